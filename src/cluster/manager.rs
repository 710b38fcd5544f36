//! Role engine
//!
//! One session runs discovery, then leads or follows until something ends
//! it: a bind failure, a rejection, a split-brain step-down or a failover
//! that ran out of candidates. The supervisor in [`super::service`] then
//! starts the next session from `Discovering`.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::discovery::Announcement;
use super::node::Role;
use super::state::SessionToken;
use crate::engine::Engine;
use crate::sync::handlers::FollowerExit;
use crate::sync::protocol::{PeerId, PeerInfo, SyncMessage};
use crate::sync::transport::{connect, read_message, PeerLink, TransportError};

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Start over from discovery
    Restart,
    /// The session was cancelled from outside
    Cancelled,
}

impl Engine {
    /// Run one leader or follower session to its end
    pub async fn run_session(self: Arc<Self>, token: SessionToken) -> SessionEnd {
        match self.discover().await {
            Some(stream) => self.follow(stream).await,
            None => self.lead(&token).await,
        }
    }

    /// Listen for a leader of our service until the discovery timeout
    ///
    /// Returns a connected stream when one answers, `None` when this node
    /// should lead.
    async fn discover(&self) -> Option<TcpStream> {
        let mut announcements = self.discovery.subscribe();
        let deadline = tokio::time::sleep(self.config.discovery_timeout);
        tokio::pin!(deadline);
        let mut listening = true;

        debug!(
            "[DISCOVERY] Looking for '{}' leaders for {:?}",
            self.config.service_name, self.config.discovery_timeout
        );

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!("[DISCOVERY] No '{}' leader found", self.config.service_name);
                    return None;
                }
                heard = announcements.recv(), if listening => match heard {
                    Ok(ann) => {
                        if let Some(stream) = self.try_leader(&ann).await {
                            return Some(stream);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("[DISCOVERY] Missed {} announcements", skipped);
                    }
                    Err(RecvError::Closed) => listening = false,
                },
            }
        }
    }

    async fn try_leader(&self, ann: &Announcement) -> Option<TcpStream> {
        if ann.service_name != self.config.service_name || ann.instance_name == self.instance_name()
        {
            return None;
        }
        let addr = ann.addr()?;

        match connect(&addr, self.config.connect_timeout).await {
            Ok(stream) => {
                info!("[DISCOVERY] Found leader {} at {}", ann.instance_name, addr);
                Some(stream)
            }
            Err(e) => {
                warn!(
                    "[DISCOVERY] Could not reach leader {} at {}: {}",
                    ann.instance_name, addr, e
                );
                None
            }
        }
    }

    /// Another leader of our service that wins over us
    fn outranked_by(&self, ann: &Announcement) -> bool {
        ann.service_name == self.config.service_name
            && ann.instance_name.as_str() < self.instance_name()
    }

    async fn lead(self: &Arc<Self>, token: &SessionToken) -> SessionEnd {
        let bind = (self.config.bind_host.as_str(), self.config.sync_port);
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(
                    "[LEADER] Failed to listen on {}: {}; restarting in {:?}",
                    self.config.listen_addr(),
                    e,
                    self.config.restart_backoff
                );
                tokio::time::sleep(self.config.restart_backoff).await;
                return SessionEnd::Restart;
            }
        };

        {
            let mut state = self.state.lock();
            state.role = Role::Leader;
            state.leader_name = Some(self.instance_name().to_string());
        }
        info!(
            "[ROLE] {} is leading '{}' on {}",
            self.instance_name(),
            self.config.service_name,
            self.config.listen_addr()
        );

        let mut announcements = self.discovery.subscribe();
        let mut listening = true;
        let mut announce = tokio::time::interval(self.config.announce_interval);
        let mut connections = JoinSet::new();
        let mut cancel = token.clone();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        connections.spawn(self.clone().serve_follower(stream, addr, token.clone()));
                    }
                    Err(e) => warn!("[LEADER] Accept failed: {}", e),
                },
                _ = announce.tick() => {
                    if let Err(e) = self.discovery.announce(&self.announcement()).await {
                        debug!("[DISCOVERY] Announcement failed: {}", e);
                    }
                }
                heard = announcements.recv(), if listening => match heard {
                    Ok(ann) if ann.instance_name != self.instance_name() && self.outranked_by(&ann) => {
                        info!(
                            "[ROLE] Leader {} outranks {}; stepping down",
                            ann.instance_name,
                            self.instance_name()
                        );
                        return SessionEnd::Restart;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("[DISCOVERY] Missed {} announcements", skipped);
                    }
                    Err(RecvError::Closed) => listening = false,
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
            }
        }
    }

    /// Follow a leader, failing over to the next peer when it goes away
    async fn follow(&self, mut stream: TcpStream) -> SessionEnd {
        loop {
            match self.follow_leader(stream).await {
                FollowerExit::Rejected => {
                    warn!(
                        "[ROLE] Rejected by leader; restarting in {:?}",
                        self.config.restart_backoff
                    );
                    tokio::time::sleep(self.config.restart_backoff).await;
                    return SessionEnd::Restart;
                }
                FollowerExit::Lost => {
                    let (candidates, self_id) = {
                        let mut state = self.state.lock();
                        state.role = Role::Reconnecting;
                        state.leader_link = None;
                        state.leader_name = None;
                        state.caught_up = false;
                        (state.peer_infos(), state.self_id.clone())
                    };
                    self.queue.clear();

                    match self.failover(&candidates, self_id.as_ref()).await {
                        Some(next) => stream = next,
                        None => return SessionEnd::Restart,
                    }
                }
            }
        }
    }

    async fn follow_leader(&self, stream: TcpStream) -> FollowerExit {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("[FOLLOWER] Leader connection unusable: {}", e);
                return FollowerExit::Lost;
            }
        };
        let (mut reader, writer) = stream.into_split();
        let (link, _writer) = PeerLink::spawn("leader".to_string(), addr, writer);

        {
            let mut state = self.state.lock();
            state.role = Role::Follower;
            state.leader_link = Some(link.clone());
        }
        info!("[ROLE] {} is following {}", self.instance_name(), addr);

        let hello = SyncMessage::CheckValidServer {
            service_name: self.config.service_name.clone(),
            instance_name: self.instance_name().to_string(),
            listen_port: self.config.sync_port,
        };
        if link.send(hello).is_err() {
            return FollowerExit::Lost;
        }

        loop {
            let msg = match read_message(&mut reader).await {
                Ok(msg) => msg,
                Err(TransportError::Disconnected) => {
                    warn!("[FOLLOWER] Leader at {} went away", addr);
                    return FollowerExit::Lost;
                }
                Err(e) => {
                    warn!("[FOLLOWER] Connection to {} failed: {}", addr, e);
                    return FollowerExit::Lost;
                }
            };
            if let Some(exit) = self.handle_follower_message(&link, msg).await {
                return exit;
            }
        }
    }

    /// Walk the last known peer list for a new leader
    ///
    /// The first peer of the list takes over; when that is us, the session
    /// restarts so discovery elects us.
    async fn failover(
        &self,
        candidates: &[PeerInfo],
        self_id: Option<&PeerId>,
    ) -> Option<TcpStream> {
        tokio::time::sleep(self.config.poll_interval).await;

        match candidates.first() {
            None => {
                info!("[ROLE] No known peers to fail over to");
                return None;
            }
            Some(first) if Some(&first.id) == self_id => {
                info!("[ROLE] {} is next in line; taking over", self.instance_name());
                return None;
            }
            Some(_) => {}
        }

        for candidate in candidates.iter().filter(|c| Some(&c.id) != self_id) {
            let addr = candidate.addr();
            info!("[ROLE] Failing over to {}", addr);

            for attempt in 1..=self.config.reconnect_attempts {
                match connect(&addr, self.config.connect_timeout).await {
                    Ok(stream) => {
                        info!("[ROLE] Reconnected to {} on attempt {}", addr, attempt);
                        return Some(stream);
                    }
                    Err(e) => {
                        debug!(
                            "[ROLE] Attempt {}/{} on {} failed: {}",
                            attempt, self.config.reconnect_attempts, addr, e
                        );
                        tokio::time::sleep(self.config.reconnect_delay).await;
                    }
                }
            }
            warn!("[ROLE] Giving up on {}", addr);
        }
        None
    }
}
