pub mod config;
pub mod discovery;
pub mod manager;
pub mod multicast;
pub mod node;
pub mod service;
pub mod state;

pub use config::SyncConfig;
pub use discovery::{Announcement, Discovery, MemoryDiscovery};
pub use manager::SessionEnd;
pub use multicast::MulticastDiscovery;
pub use node::{Peer, Role};
pub use service::{SyncService, SyncServiceBuilder};
