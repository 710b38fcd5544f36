//! RocksDB handle shared by the change log and the peer index store

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};

use crate::error::{SyncError, SyncResult};

pub const CF_CHANGES: &str = "changes";
pub const CF_INDEXES: &str = "indexes";

/// One database per instance, holding both bookkeeping stores
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<DB>,
}

impl SyncStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_CHANGES, CF_INDEXES]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        tracing::debug!("Opened sync store at {}", path.display());

        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn db(&self) -> &DB {
        &self.db
    }

    pub(crate) fn cf(&self, name: &str) -> SyncResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SyncError::Storage(format!("Missing column family '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_column_families() {
        let tmp = TempDir::new().unwrap();
        let store = SyncStore::open(tmp.path().join("node")).unwrap();

        assert!(store.cf(CF_CHANGES).is_ok());
        assert!(store.cf(CF_INDEXES).is_ok());
        assert!(store.cf("missing").is_err());
        assert!(tmp.path().join("node").is_dir());
    }

    #[test]
    fn test_reopen_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node");
        {
            let store = SyncStore::open(&path).unwrap();
            let cf = store.cf(CF_INDEXES).unwrap();
            store.db().put_cf(cf, b"k", b"v").unwrap();
        }

        let store = SyncStore::open(&path).unwrap();
        let cf = store.cf(CF_INDEXES).unwrap();
        assert_eq!(store.db().get_cf(cf, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
