//! Public service handle
//!
//! [`SyncService`] owns the engine, the role supervisor and the sync
//! scheduler. Build it with [`SyncService::builder`], register collections,
//! then `start` and `stop` it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::SyncConfig;
use super::discovery::Discovery;
use super::manager::SessionEnd;
use super::multicast::MulticastDiscovery;
use super::node::Role;
use crate::adapter::Collection;
use crate::engine::Engine;
use crate::error::{SyncError, SyncResult};
use crate::sync::index::PeerIndexStore;
use crate::sync::log::ChangeLog;
use crate::sync::protocol::PeerInfo;
use crate::sync::store::SyncStore;
use crate::sync::worker::SyncScheduler;

pub struct SyncServiceBuilder {
    config: SyncConfig,
    collections: Vec<Collection>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl SyncServiceBuilder {
    /// Register a collection to replicate
    pub fn collection(mut self, collection: Collection) -> Self {
        self.collections.push(collection);
        self
    }

    /// Use `discovery` instead of LAN multicast
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Open the local stores and assemble the service
    ///
    /// Binding multicast discovery needs a running tokio runtime.
    pub fn build(self) -> SyncResult<SyncService> {
        let discovery = match self.discovery {
            Some(discovery) => discovery,
            None => {
                let multicast = MulticastDiscovery::bind(self.config.discovery_port)
                    .map_err(|e| SyncError::Discovery(e.to_string()))?;
                Arc::new(multicast)
            }
        };

        let store = SyncStore::open(self.config.store_path())?;
        let engine = Engine::new(self.config, self.collections, store, discovery)?;
        let (stop_tx, _) = watch::channel(true);

        Ok(SyncService {
            engine: Arc::new(engine),
            stop_tx,
            tasks: Mutex::new(None),
        })
    }
}

struct RunningTasks {
    supervisor: JoinHandle<()>,
    scheduler: JoinHandle<()>,
}

pub struct SyncService {
    engine: Arc<Engine>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl SyncService {
    pub fn builder(config: SyncConfig) -> SyncServiceBuilder {
        SyncServiceBuilder {
            config,
            collections: Vec::new(),
            discovery: None,
        }
    }

    /// Start discovery and the scheduler in the background
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            warn!("[ROLE] {} is already running", self.instance_name());
            return;
        }

        self.stop_tx.send_replace(false);
        let supervisor = tokio::spawn(supervise(self.engine.clone(), self.stop_tx.subscribe()));
        let scheduler = tokio::spawn(
            SyncScheduler::new(self.engine.clone(), self.stop_tx.subscribe()).run(),
        );

        info!(
            "[ROLE] Starting {} for service '{}'",
            self.instance_name(),
            self.engine.config.service_name
        );
        *tasks = Some(RunningTasks {
            supervisor,
            scheduler,
        });
    }

    /// Stop every session and task; in-flight broadcasts end cancelled
    pub async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            return;
        };

        self.stop_tx.send_replace(true);
        self.engine.end_session(Role::Stopped);

        let _ = tasks.supervisor.await;
        let _ = tasks.scheduler.await;
        self.engine.end_session(Role::Stopped);
        info!("[ROLE] {} stopped", self.instance_name());
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    pub fn role(&self) -> Role {
        self.engine.role()
    }

    /// Instance name of the current leader, ourselves included
    pub fn leader_name(&self) -> Option<String> {
        self.engine.leader_name()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.engine.peers()
    }

    pub fn instance_name(&self) -> &str {
        self.engine.instance_name()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.engine.config
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.engine.changes
    }

    pub fn index_store(&self) -> &PeerIndexStore {
        &self.engine.indexes
    }
}

/// Run sessions back to back until stopped
async fn supervise(engine: Arc<Engine>, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }

        let token = engine.state.lock().begin_session();
        let end = tokio::select! {
            end = engine.clone().run_session(token) => end,
            _ = stop.changed() => break,
        };

        engine.end_session(Role::Discovering);
        if end == SessionEnd::Restart {
            info!("[ROLE] {} restarting discovery", engine.instance_name());
        }
    }
    engine.end_session(Role::Stopped);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::cluster::discovery::MemoryDiscovery;

    fn config(dir: &TempDir) -> SyncConfig {
        let mut config = SyncConfig::new("chat", Some("chat_1".to_string()), 0);
        config.bind_host = "127.0.0.1".to_string();
        config.data_dir = dir.path().to_path_buf();
        config.discovery_timeout = Duration::from_millis(100);
        config.tick_interval = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_duplicate_collection_rejected() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MemoryAdapter::new());
        let result = SyncService::builder(config(&dir))
            .collection(Collection::new("messages", adapter.clone()))
            .collection(Collection::new("messages", adapter))
            .discovery(Arc::new(MemoryDiscovery::new()))
            .build();

        assert!(matches!(result, Err(SyncError::DuplicateCollection(id)) if id == "messages"));
    }

    #[tokio::test]
    async fn test_lone_peer_leads_and_stops() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(MemoryAdapter::new());
        let service = SyncService::builder(config(&dir))
            .collection(Collection::new("messages", adapter.clone()).with_dirty(adapter.clone()))
            .discovery(Arc::new(MemoryDiscovery::new()))
            .build()
            .unwrap();
        assert_eq!(service.role(), Role::Stopped);

        service.start();
        assert!(service.is_running());
        for _ in 0..100 {
            if service.role() == Role::Leader {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(service.role(), Role::Leader);
        assert_eq!(service.leader_name().as_deref(), Some("chat_1"));

        adapter.create(serde_json::json!({"text": "solo"}));
        for _ in 0..100 {
            if adapter.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(adapter.get(1).unwrap()["text"], "solo");
        assert_eq!(service.change_log().latest_index("messages").unwrap(), 1);

        service.stop().await;
        assert!(!service.is_running());
        assert_eq!(service.role(), Role::Stopped);
        assert!(service.peers().is_empty());
    }
}
