//! Sync scheduler
//!
//! Replicates locally modified records on a fixed tick. Each cycle walks
//! every registered collection and pushes at most one dirty insert, one
//! dirty update and one dirty delete through the broadcast-and-ack path.
//! Cycles run inline in the loop, so a new one never starts while the
//! previous one is in flight.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::adapter::{external_id, set_external_id, DirtyRecords, Record};
use crate::cluster::node::Role;
use crate::cluster::state::SessionToken;
use crate::engine::{Audience, Engine, RegisteredCollection};
use crate::error::{SyncError, SyncResult};
use crate::sync::protocol::ChangeKind;

/// Background task driving local changes into the cluster
pub struct SyncScheduler {
    engine: Arc<Engine>,
    stop: watch::Receiver<bool>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<Engine>, stop: watch::Receiver<bool>) -> Self {
        Self { engine, stop }
    }

    /// Tick until the stop signal fires
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.engine.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "[SCHED] Started, tick every {:?}",
            self.engine.config.tick_interval
        );

        loop {
            tokio::select! {
                _ = tick.tick() => self.run_cycle().await,
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("[SCHED] Stopped");
    }

    /// Token of the session, once it can carry replication traffic
    fn ready_token(&self) -> Option<SessionToken> {
        let state = self.engine.state.lock();
        let ready = match state.role {
            Role::Leader => true,
            Role::Follower => state.leader_link.is_some() && state.leader_name.is_some(),
            _ => false,
        };
        if ready {
            state.session_token()
        } else {
            None
        }
    }

    async fn run_cycle(&self) {
        let Some(token) = self.ready_token() else {
            return;
        };

        for coll in &self.engine.collections {
            if coll.is_disabled() {
                continue;
            }
            match self.sync_collection(coll, &token).await {
                Ok(()) => {}
                Err(e @ SyncError::MissingHooks { .. }) => {
                    error!("[SCHED] {}; no longer replicating '{}'", e, coll.identifier());
                    coll.disable();
                }
                Err(e) if e.is_interruption() => {
                    debug!("[SCHED] Cycle interrupted: {}", e);
                    return;
                }
                Err(e) => warn!("[SCHED] Sync of '{}' failed: {}", coll.identifier(), e),
            }
        }
    }

    async fn sync_collection(
        &self,
        coll: &RegisteredCollection,
        token: &SessionToken,
    ) -> SyncResult<()> {
        let dirty = coll
            .def
            .dirty
            .clone()
            .ok_or_else(|| SyncError::MissingHooks {
                identifier: coll.identifier().to_string(),
            })?;

        self.sync_insert(coll, dirty.as_ref(), token).await?;
        self.sync_update(coll, dirty.as_ref(), token).await?;
        self.sync_delete(coll, dirty.as_ref(), token).await?;
        Ok(())
    }

    fn audience(&self) -> Audience {
        if self.engine.role() == Role::Leader {
            Audience::Followers { except: None }
        } else {
            Audience::Leader
        }
    }

    async fn sync_insert(
        &self,
        coll: &RegisteredCollection,
        dirty: &dyn DirtyRecords,
        token: &SessionToken,
    ) -> SyncResult<()> {
        let Some(record) = dirty.fetch_insert().await? else {
            return Ok(());
        };
        let identifier = coll.identifier();

        let guard = coll.write_lock.lock().await;
        let proposed = coll.adapter().latest_external_id().await? + 1;
        let mut stamped = record.clone();
        set_external_id(&mut stamped, proposed);

        let final_id = self
            .engine
            .process_and_wait(
                token,
                identifier,
                ChangeKind::Insert,
                stamped.clone(),
                proposed,
                self.audience(),
            )
            .await?;

        if final_id != proposed {
            debug!(
                "[SCHED] Insert into '{}' proposed as {} stored as {}",
                identifier, proposed, final_id
            );
            set_external_id(&mut stamped, final_id);
        }
        self.engine
            .commit(coll, ChangeKind::Insert, stamped, final_id)
            .await?;
        self.engine.record_shared_progress(identifier, final_id)?;
        drop(guard);

        dirty.after_insert(&record, final_id).await?;
        debug!("[SCHED] Replicated insert {}/{}", identifier, final_id);
        Ok(())
    }

    async fn sync_update(
        &self,
        coll: &RegisteredCollection,
        dirty: &dyn DirtyRecords,
        token: &SessionToken,
    ) -> SyncResult<()> {
        let Some(record) = dirty.fetch_update().await? else {
            return Ok(());
        };
        self.replicate_existing(coll, ChangeKind::Update, &record, token)
            .await?;
        dirty.after_update(&record).await?;
        Ok(())
    }

    async fn sync_delete(
        &self,
        coll: &RegisteredCollection,
        dirty: &dyn DirtyRecords,
        token: &SessionToken,
    ) -> SyncResult<()> {
        let Some(record) = dirty.fetch_delete().await? else {
            return Ok(());
        };
        self.replicate_existing(coll, ChangeKind::Delete, &record, token)
            .await?;
        dirty.after_delete(&record).await?;
        Ok(())
    }

    /// Broadcast and commit an update or delete of an already numbered record
    async fn replicate_existing(
        &self,
        coll: &RegisteredCollection,
        kind: ChangeKind,
        record: &Record,
        token: &SessionToken,
    ) -> SyncResult<()> {
        let identifier = coll.identifier();
        let id = external_id(record).ok_or_else(|| SyncError::MissingExternalId {
            identifier: identifier.to_string(),
        })?;

        let guard = coll.write_lock.lock().await;
        self.engine
            .process_and_wait(token, identifier, kind, record.clone(), id, self.audience())
            .await?;
        self.engine.commit(coll, kind, record.clone(), id).await?;
        self.engine.record_shared_progress(identifier, id)?;
        drop(guard);

        debug!("[SCHED] Replicated {} {}/{}", kind, identifier, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::adapter::{Collection, MemoryAdapter};
    use crate::cluster::config::SyncConfig;
    use crate::cluster::discovery::MemoryDiscovery;
    use crate::sync::store::SyncStore;

    fn engine_with(collections: Vec<Collection>) -> (TempDir, Arc<Engine>) {
        let tmp = TempDir::new().unwrap();
        let store = SyncStore::open(tmp.path().join("db")).unwrap();
        let config = SyncConfig::new("test", Some("node".to_string()), 0);
        let engine =
            Engine::new(config, collections, store, Arc::new(MemoryDiscovery::new())).unwrap();
        (tmp, Arc::new(engine))
    }

    /// Put the engine in a leader session with no followers
    fn lead_alone(engine: &Engine) {
        let mut state = engine.state.lock();
        state.begin_session();
        state.role = Role::Leader;
        state.leader_name = Some("node".to_string());
    }

    #[tokio::test]
    async fn test_collection_without_hooks_is_disabled() {
        let messages = Arc::new(MemoryAdapter::new());
        let notes = Arc::new(MemoryAdapter::new());
        let (_tmp, engine) = engine_with(vec![
            Collection::new("notes", notes.clone()),
            Collection::new("messages", messages.clone()).with_dirty(messages.clone()),
        ]);
        lead_alone(&engine);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let scheduler = SyncScheduler::new(engine.clone(), stop_rx);

        notes.create(json!({"text": "note"}));
        messages.create(json!({"text": "first"}));
        scheduler.run_cycle().await;

        assert!(engine.collection("notes").unwrap().is_disabled());
        assert!(!engine.collection("messages").unwrap().is_disabled());
        assert_eq!(messages.get(1).unwrap()["text"], "first");
        assert!(notes.is_empty());
        assert_eq!(notes.dirty_count(), 1);

        // Later cycles keep serving the other collection
        messages.create(json!({"text": "second"}));
        scheduler.run_cycle().await;
        assert_eq!(messages.get(2).unwrap()["text"], "second");
        assert_eq!(engine.changes.latest_index("messages").unwrap(), 2);
        assert_eq!(engine.changes.latest_index("notes").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cycle_skipped_without_session() {
        let messages = Arc::new(MemoryAdapter::new());
        let (_tmp, engine) = engine_with(vec![
            Collection::new("messages", messages.clone()).with_dirty(messages.clone())
        ]);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let scheduler = SyncScheduler::new(engine.clone(), stop_rx);

        messages.create(json!({"text": "waiting"}));
        scheduler.run_cycle().await;
        assert!(messages.is_empty());
        assert_eq!(messages.dirty_count(), 1);

        lead_alone(&engine);
        scheduler.run_cycle().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages.dirty_count(), 0);
    }
}
