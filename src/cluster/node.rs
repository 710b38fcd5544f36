use serde::{Deserialize, Serialize};

use crate::sync::protocol::{PeerId, PeerInfo};
use crate::sync::transport::PeerLink;

/// Role of this process in the cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    Discovering,
    Leader,
    Follower,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Discovering => write!(f, "discovering"),
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
            Role::Reconnecting => write!(f, "reconnecting"),
            Role::Stopped => write!(f, "stopped"),
        }
    }
}

/// A member of the peer list
///
/// On the leader every peer carries the link to its connection; followers
/// only know the list the leader sent them.
#[derive(Debug, Clone)]
pub struct Peer {
    pub info: PeerInfo,
    pub link: Option<PeerLink>,
}

impl Peer {
    pub fn id(&self) -> &PeerId {
        &self.info.id
    }

    pub fn name(&self) -> Option<&str> {
        self.info.name.as_deref()
    }
}
