//! Replication core
//!
//! - [`protocol`]: wire messages and change records
//! - [`transport`]: framed TCP links between a leader and its followers
//! - [`store`], [`log`], [`index`]: the RocksDB-backed change log and peer
//!   index store
//! - [`queue`]: in-memory pending operations awaiting acknowledgement
//! - [`handlers`]: per-role message handling and the `set_data` merge
//! - [`worker`]: the sync scheduler

pub mod handlers;
pub mod index;
pub mod log;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod transport;
pub mod worker;

// Re-export key types
pub use index::{IndexRecord, PeerIndexStore};
pub use log::ChangeLog;
pub use protocol::{Ack, ChangeKind, ChangeRecord, Mutation, PeerId, PeerInfo, SyncMessage};
pub use queue::PendingQueue;
pub use store::SyncStore;
pub use transport::{PeerLink, TransportError};
pub use worker::SyncScheduler;
