//! Common test utilities for multi-peer tests
//!
//! Provides shared helpers for:
//! - Building peers on a shared in-process discovery bus
//! - A discovery bus that can be partitioned and healed
//! - Fast timings so elections and failover finish in seconds
//! - Polling until the cluster converges

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use peersync::cluster::{Announcement, Discovery};
use peersync::{Collection, MemoryAdapter, MemoryDiscovery, Role, SyncConfig, SyncService};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const COLLECTION: &str = "messages";

pub struct TestPeer {
    pub service: SyncService,
    pub messages: Arc<MemoryAdapter>,
    _dir: TempDir,
}

impl TestPeer {
    pub fn role(&self) -> Role {
        self.service.role()
    }

    /// Text of the record stored under `id`
    pub fn text(&self, id: i64) -> Option<String> {
        self.messages
            .get(id)
            .and_then(|r| r.get("text").and_then(Value::as_str).map(str::to_string))
    }
}

/// A port nothing listens on right now
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn test_config(service: &str, instance: &str, dir: &TempDir, discovery: Duration) -> SyncConfig {
    let mut config = SyncConfig::new(service, Some(instance.to_string()), free_port());
    config.bind_host = "127.0.0.1".to_string();
    config.advertise_host = Some("127.0.0.1".to_string());
    config.data_dir = dir.path().to_path_buf();
    config.discovery_timeout = discovery;
    config.announce_interval = Duration::from_millis(100);
    config.tick_interval = Duration::from_millis(50);
    config.poll_interval = Duration::from_millis(20);
    config.restart_backoff = Duration::from_millis(200);
    config.reconnect_attempts = 50;
    config.connect_timeout = Duration::from_millis(500);
    config.reconnect_delay = Duration::from_millis(100);
    config.stall_warning = Duration::from_secs(5);
    config
}

/// Build a peer on `bus` without starting it
pub fn build_peer(bus: &MemoryDiscovery, service: &str, instance: &str, discovery: Duration) -> TestPeer {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(service, instance, &dir, discovery);
    assemble_peer(Arc::new(bus.clone()), config, dir)
}

/// Build a peer from a prepared config without starting it
pub fn assemble_peer(discovery: Arc<dyn Discovery>, config: SyncConfig, dir: TempDir) -> TestPeer {
    let messages = Arc::new(MemoryAdapter::new());

    let service = SyncService::builder(config)
        .collection(Collection::new(COLLECTION, messages.clone()).with_dirty(messages.clone()))
        .discovery(discovery)
        .build()
        .expect("Failed to build service");

    TestPeer {
        service,
        messages,
        _dir: dir,
    }
}

/// Discovery bus whose announcements are dropped until [`GatedDiscovery::open`]
///
/// Peers on a closed gate cannot hear each other, which lets two of them
/// elect themselves at the same time.
#[derive(Clone)]
pub struct GatedDiscovery {
    bus: MemoryDiscovery,
    open: Arc<AtomicBool>,
}

impl GatedDiscovery {
    pub fn closed() -> Self {
        Self {
            bus: MemoryDiscovery::new(),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Discovery for GatedDiscovery {
    async fn announce(&self, announcement: &Announcement) -> anyhow::Result<()> {
        if self.open.load(Ordering::SeqCst) {
            self.bus.announce(announcement).await?;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.bus.subscribe()
    }
}

/// Start a peer that elects itself quickly
pub async fn start_leader(bus: &MemoryDiscovery, instance: &str) -> TestPeer {
    let peer = build_peer(bus, "chat", instance, Duration::from_millis(200));
    peer.service.start();
    assert!(
        wait_until(Duration::from_secs(5), || peer.role() == Role::Leader).await,
        "{} never became leader",
        instance
    );
    peer
}

/// Start a peer that joins the running leader
pub async fn start_follower(bus: &MemoryDiscovery, instance: &str) -> TestPeer {
    let peer = build_peer(bus, "chat", instance, Duration::from_secs(1));
    peer.service.start();
    assert!(
        wait_until(Duration::from_secs(5), || {
            peer.role() == Role::Follower && peer.service.leader_name().is_some()
        })
        .await,
        "{} never joined a leader",
        instance
    );
    peer
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
