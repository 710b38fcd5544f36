pub mod adapter;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod sync;

pub use adapter::{Collection, DataAdapter, DirtyRecords, MemoryAdapter, Record};
pub use cluster::{MemoryDiscovery, MulticastDiscovery, Role, SyncConfig, SyncService};
pub use error::{SyncError, SyncResult};
