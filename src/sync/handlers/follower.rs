use tracing::{debug, info, warn};

use super::shared::MergeMode;
use crate::adapter::Record;
use crate::engine::{Engine, RegisteredCollection};
use crate::error::SyncResult;
use crate::sync::protocol::{Ack, ChangeKind, ChangeRecord, Mutation, SyncMessage};
use crate::sync::transport::PeerLink;

/// Why a follower stopped reading from its leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerExit {
    /// The leader refused us
    Rejected,
    /// The connection dropped
    Lost,
}

impl Engine {
    /// Handle one message from the leader
    ///
    /// Runs inline on the connection reader and never takes a collection's
    /// write lock: a local broadcast may be holding it while it waits for
    /// acknowledgements that only this reader can deliver.
    pub async fn handle_follower_message(
        &self,
        link: &PeerLink,
        msg: SyncMessage,
    ) -> Option<FollowerExit> {
        match msg {
            SyncMessage::ValidServer {
                leader_name,
                peer_id,
            } => {
                info!("[FOLLOWER] Accepted by leader {} as {}", leader_name, peer_id);
                {
                    let mut state = self.state.lock();
                    state.leader_name = Some(leader_name);
                    state.self_id = Some(peer_id);
                }
                let _ = link.send(SyncMessage::GetClients);
            }
            SyncMessage::SetClients { clients } => {
                let first = {
                    let mut state = self.state.lock();
                    state.set_peers(clients);
                    !std::mem::replace(&mut state.caught_up, true)
                };
                if first {
                    self.catch_up(link).await;
                }
            }
            SyncMessage::InsertRequest(m) => self.apply_from_leader(link, ChangeKind::Insert, m).await,
            SyncMessage::UpdateRequest(m) => self.apply_from_leader(link, ChangeKind::Update, m).await,
            SyncMessage::DeleteRequest(m) => self.apply_from_leader(link, ChangeKind::Delete, m).await,
            SyncMessage::InsertResponse(ack) => {
                // The leader may have reassigned the id, so match loosely
                if !self.queue.record_ack_any(ChangeKind::Insert, &link.peer_id, &ack) {
                    debug!(
                        "[FOLLOWER] insert_response {}/{} matches nothing pending",
                        ack.identifier, ack.external_id
                    );
                }
            }
            SyncMessage::UpdateResponse(ack) => {
                self.queue.record_ack(ChangeKind::Update, &link.peer_id, &ack);
            }
            SyncMessage::DeleteResponse(ack) => {
                self.queue.record_ack(ChangeKind::Delete, &link.peer_id, &ack);
            }
            SyncMessage::SetData {
                identifier,
                data,
                changes,
                ..
            } => {
                if let Err(e) = self.merge_from_leader(link, &identifier, data, changes).await {
                    warn!("[MERGE] set_data for '{}' from leader failed: {}", identifier, e);
                }
            }
            SyncMessage::GetData {
                identifier,
                last_external_id,
                latest_change_index,
            } => {
                if let Err(e) = self
                    .send_delta(link, &identifier, last_external_id, latest_change_index)
                    .await
                {
                    warn!("[FOLLOWER] get_data for '{}' failed: {}", identifier, e);
                }
            }
            SyncMessage::Disconnect => return Some(FollowerExit::Rejected),
            other => debug!("[FOLLOWER] Ignoring {}", other.event()),
        }
        None
    }

    /// First exchange after joining: push local data the leader has not
    /// seen, or ask for what we are missing
    async fn catch_up(&self, link: &PeerLink) {
        let Some(leader) = self.leader_name() else {
            return;
        };
        for coll in &self.collections {
            if let Err(e) = self.catch_up_collection(link, &leader, coll).await {
                warn!(
                    "[FOLLOWER] Catch-up of '{}' with {} failed: {}",
                    coll.identifier(),
                    leader,
                    e
                );
            }
        }
    }

    async fn catch_up_collection(
        &self,
        link: &PeerLink,
        leader: &str,
        coll: &RegisteredCollection,
    ) -> SyncResult<()> {
        let identifier = coll.identifier();
        let known = self.indexes.latest_index(leader, identifier)?;
        let known_change = self.indexes.latest_change_index(leader, identifier)?;
        let local = coll.adapter().latest_external_id().await?;

        if known <= local && local > 0 {
            let (data, changes) = self.collect_delta(coll, known + 1, Some(known_change)).await?;
            info!(
                "[FOLLOWER] Pushing {} records and {} changes of '{}' to {}",
                data.len(),
                changes.len(),
                identifier,
                leader
            );
            link.send(SyncMessage::SetData {
                identifier: identifier.to_string(),
                data,
                changes,
                last_external_id: Some(known),
            })?;
        } else {
            debug!(
                "[FOLLOWER] Requesting '{}' from {} after {}",
                identifier, leader, known
            );
            link.send(SyncMessage::GetData {
                identifier: identifier.to_string(),
                last_external_id: known,
                latest_change_index: (known_change > 0).then_some(known_change),
            })?;
        }
        Ok(())
    }

    /// Apply a mutation relayed by the leader and always acknowledge it
    async fn apply_from_leader(&self, link: &PeerLink, kind: ChangeKind, mutation: Mutation) {
        let Mutation {
            identifier,
            data,
            external_id,
        } = mutation;

        if let Err(e) = self.apply_mutation(kind, &identifier, data, external_id).await {
            warn!(
                "[FOLLOWER] Failed to apply {} of {}/{}: {}",
                kind, identifier, external_id, e
            );
        }

        let _ = link.send(SyncMessage::response(
            kind,
            Ack {
                identifier,
                external_id,
            },
        ));
    }

    async fn apply_mutation(
        &self,
        kind: ChangeKind,
        identifier: &str,
        data: Record,
        external_id: i64,
    ) -> SyncResult<()> {
        let coll = self.collection(identifier)?;

        if kind == ChangeKind::Update && !coll.adapter().decide_update(&data).await? {
            info!(
                "[FOLLOWER] Update of {}/{} rejected by policy",
                identifier, external_id
            );
            return Ok(());
        }

        self.commit(coll, kind, data, external_id).await?;

        if kind == ChangeKind::Insert {
            if let Some(leader) = self.leader_name() {
                self.record_peer_progress(&leader, identifier, external_id)?;
            }
        }
        Ok(())
    }

    /// Apply the leader's authoritative data and report our new latest id
    async fn merge_from_leader(
        &self,
        link: &PeerLink,
        identifier: &str,
        data: Vec<Record>,
        changes: Vec<ChangeRecord>,
    ) -> SyncResult<()> {
        let coll = self.collection(identifier)?;
        let report = self.merge(coll, data, changes, MergeMode::Authoritative).await?;
        let latest = coll.adapter().latest_external_id().await?;

        if let Some(leader) = self.leader_name() {
            self.record_peer_progress(&leader, identifier, latest)?;
        }

        if report.mutations() > 0 {
            info!(
                "[MERGE] Applied '{}' from leader: {} inserted, {} updated, {} deleted",
                identifier, report.inserted, report.updated, report.deleted
            );
        } else {
            debug!("[MERGE] '{}' already up to date at {}", identifier, latest);
        }

        link.send(SyncMessage::InsertResponse(Ack {
            identifier: identifier.to_string(),
            external_id: latest,
        }))?;
        Ok(())
    }

    /// Answer the leader's `get_data` with our records after `last_external_id`
    async fn send_delta(
        &self,
        link: &PeerLink,
        identifier: &str,
        last_external_id: i64,
        latest_change_index: Option<i64>,
    ) -> SyncResult<()> {
        let coll = self.collection(identifier)?;
        let (data, changes) = self
            .collect_delta(coll, last_external_id + 1, latest_change_index)
            .await?;
        link.send(SyncMessage::SetData {
            identifier: identifier.to_string(),
            data,
            changes,
            last_external_id: Some(last_external_id),
        })?;
        Ok(())
    }
}
