//! Data adapter interface
//!
//! The engine never owns application storage. Each synchronized collection
//! supplies a [`DataAdapter`] for committed records and, optionally, a
//! [`DirtyRecords`] capability the scheduler drains for local changes.
//! Records are schemaless JSON objects; the only field the engine reads or
//! writes is `externalId`.

use std::sync::Arc;

use async_trait::async_trait;

pub mod memory;

pub use memory::MemoryAdapter;

/// A synchronized record
pub type Record = serde_json::Value;

/// Field carrying a record's external id
pub const EXTERNAL_ID_FIELD: &str = "externalId";

/// External id of a record, accepting numbers and numeric strings
pub fn external_id(record: &Record) -> Option<i64> {
    match record.get(EXTERNAL_ID_FIELD)? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Stamp `external_id` onto an object record; other JSON values are left as is
pub fn set_external_id(record: &mut Record, external_id: i64) {
    if let Some(obj) = record.as_object_mut() {
        obj.insert(EXTERNAL_ID_FIELD.to_string(), external_id.into());
    }
}

/// Storage operations for one collection
#[async_trait]
pub trait DataAdapter: Send + Sync {
    /// Highest external id stored, 0 when empty
    async fn latest_external_id(&self) -> anyhow::Result<i64>;

    /// Records with `from <= externalId` (and `<= to` when given), ascending
    async fn get_data(&self, from: i64, to: Option<i64>) -> anyhow::Result<Vec<Record>>;

    async fn insert(&self, record: Record, external_id: i64) -> anyhow::Result<()>;

    /// Overwrite the record identified by its `externalId`
    async fn update(&self, record: Record) -> anyhow::Result<()>;

    async fn delete(&self, external_id: i64) -> anyhow::Result<()>;

    fn is_equal(&self, a: &Record, b: &Record) -> bool {
        a == b
    }

    /// Whether an incoming update may be applied
    async fn decide_update(&self, _record: &Record) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Whether an incoming delete may be applied
    async fn decide_delete(&self, _record: &Record) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Locally modified records waiting to be replicated
///
/// `fetch_*` returns at most one candidate per call; the matching `after_*`
/// runs once the mutation has been acknowledged and committed.
#[async_trait]
pub trait DirtyRecords: Send + Sync {
    async fn fetch_insert(&self) -> anyhow::Result<Option<Record>>;

    async fn after_insert(&self, record: &Record, external_id: i64) -> anyhow::Result<()>;

    async fn fetch_update(&self) -> anyhow::Result<Option<Record>>;

    async fn after_update(&self, record: &Record) -> anyhow::Result<()>;

    async fn fetch_delete(&self) -> anyhow::Result<Option<Record>>;

    async fn after_delete(&self, record: &Record) -> anyhow::Result<()>;
}

/// A collection registered with the sync service
#[derive(Clone)]
pub struct Collection {
    pub identifier: String,
    pub adapter: Arc<dyn DataAdapter>,
    pub dirty: Option<Arc<dyn DirtyRecords>>,
}

impl Collection {
    pub fn new(identifier: impl Into<String>, adapter: Arc<dyn DataAdapter>) -> Self {
        Self {
            identifier: identifier.into(),
            adapter,
            dirty: None,
        }
    }

    pub fn with_dirty(mut self, dirty: Arc<dyn DirtyRecords>) -> Self {
        self.dirty = Some(dirty);
        self
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("identifier", &self.identifier)
            .field("dirty", &self.dirty.is_some())
            .finish()
    }
}
