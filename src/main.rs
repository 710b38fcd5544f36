use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use peersync::{Collection, MemoryAdapter, SyncConfig, SyncService};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "peersync")]
#[command(about = "peersync - share a message list with every peer on the local network", long_about = None)]
struct Args {
    /// Service name; only peers with the same name sync together
    #[arg(short, long)]
    service: Option<String>,

    /// Instance name (auto-generated if not provided)
    #[arg(long)]
    instance: Option<String>,

    /// Port the leader listens on for followers
    #[arg(short, long)]
    port: Option<u16>,

    /// UDP port for leader announcements
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Directory for the change log and peer index store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Host other peers should use to reach this one
    #[arg(long)]
    advertise_host: Option<String>,
}

const COLLECTION: &str = "messages";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peersync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = SyncConfig::from_env()?;
    if let Some(service) = args.service {
        config.service_name = service;
    }
    if let Some(instance) = args.instance {
        config.instance_name = instance;
    }
    if let Some(port) = args.port {
        config.sync_port = port;
    }
    if let Some(port) = args.discovery_port {
        config.discovery_port = port;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if args.advertise_host.is_some() {
        config.advertise_host = args.advertise_host;
    }

    let messages = Arc::new(MemoryAdapter::new());
    let service = SyncService::builder(config)
        .collection(Collection::new(COLLECTION, messages.clone()).with_dirty(messages.clone()))
        .build()?;
    service.start();

    println!(
        "{} joined '{}'. Type a message, or :list, :edit <id> <text>, :del <id>, :peers",
        service.instance_name(),
        service.config().service_name
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&service, &messages, line.trim()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    service.stop().await;
    Ok(())
}

fn handle_line(service: &SyncService, messages: &MemoryAdapter, line: &str) {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        ":list" => {
            for record in messages.records() {
                println!("{}", record);
            }
        }
        ":peers" => {
            println!(
                "role: {}, leader: {}",
                service.role(),
                service.leader_name().unwrap_or_else(|| "-".to_string())
            );
            for peer in service.peers() {
                println!(
                    "  {} {} {}",
                    peer.id,
                    peer.addr(),
                    peer.name.as_deref().unwrap_or("")
                );
            }
        }
        ":edit" => {
            let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
            match id.parse::<i64>() {
                Ok(id) if messages.modify(id, message(service, text)) => {}
                _ => println!("no message {}", id),
            }
        }
        ":del" => match rest.trim().parse::<i64>() {
            Ok(id) if messages.remove(id) => {}
            _ => println!("no message {}", rest),
        },
        _ => messages.create(message(service, line)),
    }
}

fn message(service: &SyncService, text: &str) -> serde_json::Value {
    json!({
        "text": text,
        "author": service.instance_name(),
        "sentAt": chrono::Utc::now().to_rfc3339(),
    })
}
