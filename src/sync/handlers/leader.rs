use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::shared::MergeMode;
use crate::adapter::{set_external_id, Record};
use crate::cluster::state::SessionToken;
use crate::engine::{Audience, Engine};
use crate::error::SyncResult;
use crate::sync::protocol::{Ack, ChangeKind, ChangeRecord, Mutation, PeerId, PeerInfo, SyncMessage};
use crate::sync::transport::{accept_handshake, read_message, PeerLink, TransportError};

impl Engine {
    /// Serve one accepted connection until it closes
    pub async fn serve_follower(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        token: SessionToken,
    ) {
        if let Err(e) = accept_handshake(&mut stream).await {
            debug!("[LEADER] Dropping connection from {}: {}", addr, e);
            return;
        }
        let _ = stream.set_nodelay(true);

        let peer_id: PeerId = Uuid::new_v4().to_string();
        let (mut reader, writer) = stream.into_split();
        let (link, _writer) = PeerLink::spawn(peer_id.clone(), addr, writer);
        debug!("[LEADER] Connection {} from {}", peer_id, addr);

        let mut validated = false;
        loop {
            let msg = match read_message(&mut reader).await {
                Ok(msg) => msg,
                Err(TransportError::Disconnected) => break,
                Err(e) => {
                    warn!("[LEADER] Connection {} from {} failed: {}", peer_id, addr, e);
                    break;
                }
            };

            if let SyncMessage::CheckValidServer {
                service_name,
                instance_name,
                listen_port,
            } = msg
            {
                if !self.validate_follower(&link, &service_name, &instance_name, listen_port) {
                    break;
                }
                validated = true;
                continue;
            }

            if !validated {
                debug!(
                    "[LEADER] Ignoring {} from unvalidated connection {}",
                    msg.event(),
                    peer_id
                );
                continue;
            }

            if !self.handle_leader_message(&link, msg, &token).await {
                break;
            }
        }

        let removed = self.state.lock().remove_peer(&peer_id);
        if let Some(peer) = removed {
            info!(
                "[LEADER] {} disconnected",
                peer.name().unwrap_or(peer_id.as_str())
            );
            self.broadcast_clients(None);
        }
    }

    /// Dispatch one message from a validated follower; false ends the connection
    async fn handle_leader_message(
        self: &Arc<Self>,
        link: &PeerLink,
        msg: SyncMessage,
        token: &SessionToken,
    ) -> bool {
        match msg {
            SyncMessage::GetClients => {
                let clients = self.state.lock().peer_infos();
                let _ = link.send(SyncMessage::SetClients { clients });
            }
            SyncMessage::InsertRequest(m) => self.spawn_request(link, ChangeKind::Insert, m, token),
            SyncMessage::UpdateRequest(m) => self.spawn_request(link, ChangeKind::Update, m, token),
            SyncMessage::DeleteRequest(m) => self.spawn_request(link, ChangeKind::Delete, m, token),
            SyncMessage::InsertResponse(ack) => {
                self.handle_response(&link.peer_id, ChangeKind::Insert, &ack)
            }
            SyncMessage::UpdateResponse(ack) => {
                self.handle_response(&link.peer_id, ChangeKind::Update, &ack)
            }
            SyncMessage::DeleteResponse(ack) => {
                self.handle_response(&link.peer_id, ChangeKind::Delete, &ack)
            }
            SyncMessage::GetData {
                identifier,
                last_external_id,
                latest_change_index,
            } => {
                if let Err(e) = self
                    .answer_get_data(link, &identifier, last_external_id, latest_change_index)
                    .await
                {
                    warn!("[LEADER] get_data for '{}' failed: {}", identifier, e);
                }
            }
            SyncMessage::SetData {
                identifier,
                data,
                changes,
                last_external_id,
            } => {
                let engine = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine
                        .merge_from_follower(&link, &identifier, data, changes, last_external_id)
                        .await
                    {
                        warn!(
                            "[MERGE] set_data for '{}' from {} failed: {}",
                            identifier, link.peer_id, e
                        );
                    }
                });
            }
            SyncMessage::Disconnect => return false,
            other => debug!("[LEADER] Ignoring {} from {}", other.event(), link.peer_id),
        }
        true
    }

    /// Accept or reject a connecting follower by service name
    fn validate_follower(
        &self,
        link: &PeerLink,
        service_name: &str,
        instance_name: &str,
        listen_port: u16,
    ) -> bool {
        if service_name != self.config.service_name {
            warn!(
                "[LEADER] Rejecting {} from {}: service '{}' does not match '{}'",
                instance_name, link.addr, service_name, self.config.service_name
            );
            let _ = link.send(SyncMessage::Disconnect);
            return false;
        }

        let info = PeerInfo {
            id: link.peer_id.clone(),
            connected: true,
            host: link.addr.ip().to_string(),
            port: listen_port,
            name: Some(instance_name.to_string()),
        };

        let clients = {
            let mut state = self.state.lock();
            state.add_peer(info, link.clone());
            state.peer_infos()
        };

        let _ = link.send(SyncMessage::ValidServer {
            leader_name: self.instance_name().to_string(),
            peer_id: link.peer_id.clone(),
        });
        let _ = link.send(SyncMessage::SetClients { clients });
        self.broadcast_clients(Some(&link.peer_id));

        info!("[LEADER] {} joined from {}", instance_name, link.addr);
        true
    }

    /// Send the peer list, without names, to every follower but `except`
    fn broadcast_clients(&self, except: Option<&str>) {
        let (clients, links) = {
            let state = self.state.lock();
            let clients: Vec<PeerInfo> = state.peers.iter().map(|p| p.info.anonymized()).collect();
            (clients, state.links_except(except))
        };

        for link in links {
            let _ = link.send(SyncMessage::SetClients {
                clients: clients.clone(),
            });
        }
    }

    fn spawn_request(
        self: &Arc<Self>,
        link: &PeerLink,
        kind: ChangeKind,
        mutation: Mutation,
        token: &SessionToken,
    ) {
        let engine = self.clone();
        let link = link.clone();
        let token = token.clone();

        tokio::spawn(async move {
            let identifier = mutation.identifier.clone();
            let external_id = mutation.external_id;
            match engine.handle_request(&link, kind, mutation, &token).await {
                Ok(()) => {}
                Err(e) if e.is_interruption() => {
                    debug!(
                        "[LEADER] {} of {}/{} from {} interrupted: {}",
                        kind, identifier, external_id, link.peer_id, e
                    );
                }
                Err(e) => warn!(
                    "[LEADER] {} of {}/{} from {} failed: {}",
                    kind, identifier, external_id, link.peer_id, e
                ),
            }
        });
    }

    /// Relay a follower's mutation to the other followers, then commit it
    /// and answer with the final external id
    async fn handle_request(
        &self,
        from: &PeerLink,
        kind: ChangeKind,
        mutation: Mutation,
        token: &SessionToken,
    ) -> SyncResult<()> {
        let Mutation {
            identifier,
            mut data,
            external_id,
        } = mutation;

        let coll = match self.collection(&identifier) {
            Ok(coll) => coll,
            Err(e) => {
                // Answer anyway so the requester does not wait forever
                from.send(SyncMessage::response(kind, Ack { identifier, external_id }))?;
                return Err(e);
            }
        };
        let adapter = coll.adapter();

        let allowed = match kind {
            ChangeKind::Insert => true,
            ChangeKind::Update => adapter.decide_update(&data).await?,
            ChangeKind::Delete => adapter.decide_delete(&data).await?,
        };
        if !allowed {
            info!(
                "[LEADER] {} of {}/{} from {} rejected by policy",
                kind, identifier, external_id, from.peer_id
            );
            from.send(SyncMessage::response(kind, Ack { identifier, external_id }))?;
            return Ok(());
        }

        let guard = coll.write_lock.lock().await;

        let external_id = match kind {
            ChangeKind::Insert => {
                let assigned = adapter.latest_external_id().await? + 1;
                set_external_id(&mut data, assigned);
                assigned
            }
            _ => external_id,
        };

        self.process_and_wait(
            token,
            &identifier,
            kind,
            data.clone(),
            external_id,
            Audience::Followers {
                except: Some(from.peer_id.clone()),
            },
        )
        .await?;

        self.commit(coll, kind, data, external_id).await?;
        self.record_shared_progress(&identifier, external_id)?;
        drop(guard);

        debug!(
            "[LEADER] {} of {}/{} from {} committed",
            kind, identifier, external_id, from.peer_id
        );
        from.send(SyncMessage::response(kind, Ack { identifier, external_id }))?;
        Ok(())
    }

    fn handle_response(&self, from: &PeerId, kind: ChangeKind, ack: &Ack) {
        if kind == ChangeKind::Insert {
            let name = self.state.lock().peer_name(from);
            if let Some(name) = name {
                if let Err(e) = self.record_peer_progress(&name, &ack.identifier, ack.external_id) {
                    warn!("[LEADER] Failed to record progress of {}: {}", name, e);
                }
            }
        }

        if !self.queue.record_ack(kind, from, ack) {
            debug!(
                "[LEADER] Unmatched {} ack for {}/{} from {}",
                kind, ack.identifier, ack.external_id, from
            );
        }
    }

    /// Answer a follower's `get_data` with everything after its last known id
    async fn answer_get_data(
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

        debug!(
            "[LEADER] Sending {} records and {} changes of '{}' to {}",
            data.len(),
            changes.len(),
            identifier,
            link.peer_id
        );
        link.send(SyncMessage::SetData {
            identifier: identifier.to_string(),
            data,
            changes,
            last_external_id: None,
        })?;
        Ok(())
    }

    /// Merge a follower's pushed data, then push the result to every follower
    async fn merge_from_follower(
        &self,
        from: &PeerLink,
        identifier: &str,
        data: Vec<Record>,
        changes: Vec<ChangeRecord>,
        last_external_id: Option<i64>,
    ) -> SyncResult<()> {
        let coll = self.collection(identifier)?;
        let adapter = coll.adapter();
        let guard = coll.write_lock.lock().await;

        let latest_before = adapter.latest_external_id().await?;
        let lowest_change = changes.iter().map(|c| c.index).min();
        let report = self.merge(coll, data, changes, MergeMode::Collision).await?;

        let latest = adapter.latest_external_id().await?;
        let name = self.state.lock().peer_name(&from.peer_id);
        if let Some(name) = &name {
            self.record_peer_progress(name, identifier, latest)?;
        }

        let out_changes = match lowest_change {
            Some(index) => self.changes.get_changes(identifier, index - 1)?,
            None => self.changes.latest_change(identifier)?.into_iter().collect(),
        };

        let mut from_id = last_external_id.unwrap_or(0);
        if from_id == latest_before {
            from_id += 1;
        }
        for change in out_changes.iter().filter(|c| c.kind != ChangeKind::Delete) {
            from_id = from_id.min(change.id);
        }
        let out_data = adapter.get_data(from_id, None).await?;
        drop(guard);

        info!(
            "[MERGE] Merged '{}' from {}: {} inserted, {} updated, {} re-inserted, {} deleted; pushing {} records",
            identifier,
            name.as_deref().unwrap_or(from.peer_id.as_str()),
            report.inserted,
            report.updated,
            report.reinserted,
            report.deleted,
            out_data.len()
        );

        let links = self.state.lock().links_except(None);
        for link in links {
            let _ = link.send(SyncMessage::SetData {
                identifier: identifier.to_string(),
                data: out_data.clone(),
                changes: out_changes.clone(),
                last_external_id: None,
            });
        }
        Ok(())
    }
}
