//! Shared engine context
//!
//! One [`Engine`] per service, shared by the role sessions, every protocol
//! handler and the scheduler. It owns the registered collections, both
//! bookkeeping stores, the pending-operation queue and the mutable
//! [`EngineState`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::adapter::{Collection, DataAdapter, Record};
use crate::cluster::config::SyncConfig;
use crate::cluster::discovery::{Announcement, Discovery};
use crate::cluster::node::Role;
use crate::cluster::state::{EngineState, SessionToken};
use crate::error::{SyncError, SyncResult};
use crate::sync::index::PeerIndexStore;
use crate::sync::log::ChangeLog;
use crate::sync::protocol::{ChangeKind, ChangeRecord, Mutation, PeerId, PeerInfo, SyncMessage};
use crate::sync::queue::PendingQueue;
use crate::sync::store::SyncStore;

/// A collection plus the engine's per-collection bookkeeping
pub struct RegisteredCollection {
    pub def: Collection,
    /// Serializes broadcast-and-commit for this collection
    pub write_lock: tokio::sync::Mutex<()>,
    disabled: AtomicBool,
}

impl RegisteredCollection {
    fn new(def: Collection) -> Self {
        Self {
            def,
            write_lock: tokio::sync::Mutex::new(()),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.def.identifier
    }

    pub fn adapter(&self) -> &dyn DataAdapter {
        self.def.adapter.as_ref()
    }

    /// Set after a configuration error; the scheduler skips it from then on
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }
}

/// Who must acknowledge a broadcast
#[derive(Debug, Clone)]
pub enum Audience {
    /// Follower sending to its leader; the first ack completes the wait
    Leader,
    /// Leader sending to every connected follower except `except`
    Followers { except: Option<PeerId> },
}

pub struct Engine {
    pub config: SyncConfig,
    pub collections: Vec<RegisteredCollection>,
    pub changes: ChangeLog,
    pub indexes: PeerIndexStore,
    pub queue: PendingQueue,
    pub discovery: Arc<dyn Discovery>,
    pub state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(
        config: SyncConfig,
        collections: Vec<Collection>,
        store: SyncStore,
        discovery: Arc<dyn Discovery>,
    ) -> SyncResult<Self> {
        let mut registered: Vec<RegisteredCollection> = Vec::with_capacity(collections.len());
        for def in collections {
            if registered.iter().any(|c| c.identifier() == def.identifier) {
                return Err(SyncError::DuplicateCollection(def.identifier));
            }
            registered.push(RegisteredCollection::new(def));
        }

        Ok(Self {
            config,
            collections: registered,
            changes: ChangeLog::new(store.clone()),
            indexes: PeerIndexStore::new(store),
            queue: PendingQueue::new(),
            discovery,
            state: Mutex::new(EngineState::default()),
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.config.instance_name
    }

    pub fn collection(&self, identifier: &str) -> SyncResult<&RegisteredCollection> {
        self.collections
            .iter()
            .find(|c| c.identifier() == identifier)
            .ok_or_else(|| SyncError::UnknownCollection(identifier.to_string()))
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn leader_name(&self) -> Option<String> {
        self.state.lock().leader_name.clone()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.lock().peer_infos()
    }

    /// What this node announces while leading
    pub fn announcement(&self) -> Announcement {
        Announcement {
            service_name: self.config.service_name.clone(),
            instance_name: self.config.instance_name.clone(),
            host: self.config.advertise_host.clone(),
            port: self.config.sync_port,
        }
    }

    /// Tear down the running session and forget everything it owned
    pub fn end_session(&self, role: Role) {
        self.state.lock().end_session(role);
        self.queue.clear();
    }

    pub fn append_change(
        &self,
        identifier: &str,
        id: i64,
        kind: ChangeKind,
        index: Option<i64>,
    ) -> SyncResult<ChangeRecord> {
        self.changes.append(identifier, id, kind, index)
    }

    /// Note that the peer called `name` holds data up to `external_id`
    pub fn record_peer_progress(
        &self,
        name: &str,
        identifier: &str,
        external_id: i64,
    ) -> SyncResult<()> {
        let change_index = self.changes.latest_index(identifier)?;
        self.indexes
            .record_progress(name, identifier, Some(external_id), Some(change_index))?;
        Ok(())
    }

    /// After an acknowledged broadcast: the leader and every known peer
    /// hold data up to `external_id`
    pub fn record_shared_progress(&self, identifier: &str, external_id: i64) -> SyncResult<()> {
        let names = {
            let state = self.state.lock();
            let mut names = state.peer_names();
            if let Some(leader) = &state.leader_name {
                names.push(leader.clone());
            }
            names
        };

        for name in names {
            self.record_peer_progress(&name, identifier, external_id)?;
        }
        Ok(())
    }

    /// Broadcast a mutation and wait until the audience has acknowledged it
    ///
    /// Returns the final external id: the one the leader reported for
    /// [`Audience::Leader`], `external_id` otherwise. The wait polls the
    /// pending queue every `poll_interval` and ends early when the session
    /// is cancelled or the entry is dropped from the queue.
    pub async fn process_and_wait(
        &self,
        token: &SessionToken,
        identifier: &str,
        kind: ChangeKind,
        data: Record,
        external_id: i64,
        audience: Audience,
    ) -> SyncResult<i64> {
        let handle = self
            .queue
            .enqueue(identifier, kind, external_id, data.clone());
        let result = self
            .send_and_wait(token, handle, identifier, kind, data, external_id, &audience)
            .await;
        self.queue.dequeue(handle);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_and_wait(
        &self,
        token: &SessionToken,
        handle: crate::sync::queue::QueueHandle,
        identifier: &str,
        kind: ChangeKind,
        data: Record,
        external_id: i64,
        audience: &Audience,
    ) -> SyncResult<i64> {
        let message = SyncMessage::request(
            kind,
            Mutation {
                identifier: identifier.to_string(),
                data,
                external_id,
            },
        );

        let recipients: Vec<PeerId> = match audience {
            Audience::Leader => {
                let link = self
                    .state
                    .lock()
                    .leader_link
                    .clone()
                    .ok_or(SyncError::NotConnected)?;
                link.send(message)?;
                vec![link.peer_id]
            }
            Audience::Followers { except } => {
                let links = self.state.lock().links_except(except.as_deref());
                for link in &links {
                    if let Err(e) = link.send(message.clone()) {
                        debug!("Skipping {} for {} broadcast: {}", link.peer_id, kind, e);
                    }
                }
                links.into_iter().map(|l| l.peer_id).collect()
            }
        };

        let mut cancel = token.clone();
        let started = Instant::now();
        let mut last_warning = started;

        loop {
            // Ending the session also clears the queue; report it as cancelled
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let op = self.queue.get(handle).ok_or_else(|| SyncError::Superseded {
                identifier: identifier.to_string(),
                external_id,
            })?;

            match audience {
                Audience::Leader => {
                    if let Some(ack) = op.done.first() {
                        return Ok(ack.external_id);
                    }
                }
                Audience::Followers { .. } => {
                    // Peers that left since the broadcast are not waited for
                    let live: Vec<&PeerId> = {
                        let state = self.state.lock();
                        recipients.iter().filter(|id| state.has_peer(id)).collect()
                    };
                    match self.queue.is_satisfied(handle, live) {
                        Some(true) => return Ok(external_id),
                        Some(false) => {}
                        None => {
                            return Err(SyncError::Superseded {
                                identifier: identifier.to_string(),
                                external_id,
                            })
                        }
                    }
                }
            }

            if let Some(limit) = self.config.broadcast_timeout {
                if started.elapsed() >= limit {
                    warn!(
                        "Gave up on {} of {}/{} after {:?}",
                        kind, identifier, external_id, limit
                    );
                    return Err(SyncError::BroadcastTimeout {
                        identifier: identifier.to_string(),
                        external_id,
                    });
                }
            }

            if last_warning.elapsed() >= self.config.stall_warning {
                warn!(
                    "Still waiting for acknowledgements of {} {}/{} after {:?} ({} of {} received)",
                    kind,
                    identifier,
                    external_id,
                    started.elapsed(),
                    op.done.len(),
                    recipients.len()
                );
                last_warning = Instant::now();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            }
        }
    }
}
