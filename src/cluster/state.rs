use tokio::sync::watch;

use super::node::{Peer, Role};
use crate::sync::protocol::{PeerId, PeerInfo};
use crate::sync::transport::PeerLink;

/// Cancellation handle for one leader/follower session
///
/// Cloned into every task that may block on the network. The session owner
/// fires it when the session ends, for any reason.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub id: u64,
    rx: watch::Receiver<bool>,
}

impl SessionToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the session has ended
    pub async fn cancelled(&mut self) {
        // A dropped sender also means the session is gone
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Mutable state of the engine
///
/// Lives behind one mutex that is never held across an await.
pub struct EngineState {
    pub role: Role,
    /// Instance name of the current leader (ourselves when leading)
    pub leader_name: Option<String>,
    /// Connection id the leader assigned to us
    pub self_id: Option<PeerId>,
    /// Link to the leader while following
    pub leader_link: Option<PeerLink>,
    /// Ordered peer list; order drives failover
    pub peers: Vec<Peer>,
    /// Set once the first peer list after validation has been handled
    pub caught_up: bool,
    session_seq: u64,
    session: Option<(u64, watch::Sender<bool>)>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            role: Role::Stopped,
            leader_name: None,
            self_id: None,
            leader_link: None,
            peers: Vec::new(),
            caught_up: false,
            session_seq: 0,
            session: None,
        }
    }
}

impl EngineState {
    /// Open a new session, cancelling any previous one
    pub fn begin_session(&mut self) -> SessionToken {
        self.end_session(Role::Discovering);
        self.session_seq += 1;
        let (tx, rx) = watch::channel(false);
        self.session = Some((self.session_seq, tx));
        SessionToken {
            id: self.session_seq,
            rx,
        }
    }

    /// Cancel the current session and drop everything it owned
    pub fn end_session(&mut self, role: Role) {
        if let Some((_, tx)) = self.session.take() {
            let _ = tx.send(true);
        }
        self.role = role;
        self.leader_name = None;
        self.self_id = None;
        self.leader_link = None;
        self.peers.clear();
        self.caught_up = false;
    }

    /// Token of the running session, if any
    pub fn session_token(&self) -> Option<SessionToken> {
        self.session.as_ref().map(|(id, tx)| SessionToken {
            id: *id,
            rx: tx.subscribe(),
        })
    }

    /// Leader side: add a validated connection
    pub fn add_peer(&mut self, info: PeerInfo, link: PeerLink) {
        self.peers.retain(|p| p.info.id != info.id);
        self.peers.push(Peer {
            info,
            link: Some(link),
        });
    }

    pub fn remove_peer(&mut self, id: &str) -> Option<Peer> {
        let pos = self.peers.iter().position(|p| p.info.id == id)?;
        Some(self.peers.remove(pos))
    }

    /// Follower side: replace the list, keeping names learned earlier
    pub fn set_peers(&mut self, clients: Vec<PeerInfo>) {
        let previous = std::mem::take(&mut self.peers);
        self.peers = clients
            .into_iter()
            .map(|mut info| {
                if info.name.is_none() {
                    info.name = previous
                        .iter()
                        .find(|p| p.info.id == info.id)
                        .and_then(|p| p.info.name.clone());
                }
                Peer { info, link: None }
            })
            .collect();
    }

    pub fn has_peer(&self, id: &str) -> bool {
        self.peers.iter().any(|p| p.info.id == id)
    }

    pub fn peer_name(&self, id: &str) -> Option<String> {
        self.peers
            .iter()
            .find(|p| p.info.id == id)
            .and_then(|p| p.info.name.clone())
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(|p| p.info.clone()).collect()
    }

    /// Names of every known peer
    pub fn peer_names(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter_map(|p| p.info.name.clone())
            .collect()
    }

    /// Open links of all connected peers except `except`
    pub fn links_except(&self, except: Option<&str>) -> Vec<PeerLink> {
        self.peers
            .iter()
            .filter(|p| Some(p.info.id.as_str()) != except)
            .filter_map(|p| p.link.clone())
            .filter(|link| !link.is_closed())
            .collect()
    }
}
