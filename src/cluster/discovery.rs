//! Service discovery
//!
//! A leader periodically announces `(service, instance, host, port)`; peers in
//! the `Discovering` state listen for announcements of their own service.
//! [`MemoryDiscovery`] is an in-process bus for tests and single-host setups;
//! [`super::multicast::MulticastDiscovery`] is the LAN implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of announcement fan-out channels
pub const ANNOUNCEMENT_BUFFER: usize = 64;

/// A leader advertising its sync endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Announcement {
    pub service_name: String,
    pub instance_name: String,
    /// Advertised host; filled from the datagram source when absent
    pub host: Option<String>,
    pub port: u16,
}

impl Announcement {
    pub fn addr(&self) -> Option<String> {
        self.host.as_ref().map(|h| format!("{}:{}", h, self.port))
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Announce and observe leaders
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Publish an announcement once
    async fn announce(&self, announcement: &Announcement) -> anyhow::Result<()>;

    /// Stream of announcements heard from now on (our own included)
    fn subscribe(&self) -> broadcast::Receiver<Announcement>;
}

/// In-process discovery bus; clones share the same bus
#[derive(Clone)]
pub struct MemoryDiscovery {
    tx: broadcast::Sender<Announcement>,
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ANNOUNCEMENT_BUFFER);
        Self { tx }
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn announce(&self, announcement: &Announcement) -> anyhow::Result<()> {
        // No listeners is not an error
        let _ = self.tx.send(announcement.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.tx.subscribe()
    }
}
