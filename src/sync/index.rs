//! Peer index store
//!
//! Remembers, per (peer name, collection), the last external id and the last
//! change index that peer is known to have applied. Both values only move
//! forward; a stale update leaves the stored value untouched.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::store::{SyncStore, CF_INDEXES};
use crate::error::SyncResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRecord {
    pub name: String,
    pub identifier: String,
    /// Last known external id
    pub index: i64,
    /// Last known change log index
    pub change_index: i64,
}

fn index_key(name: &str, identifier: &str) -> Vec<u8> {
    format!("{}\0{}", name, identifier).into_bytes()
}

pub struct PeerIndexStore {
    store: SyncStore,
    write_lock: Mutex<()>,
}

impl PeerIndexStore {
    pub fn new(store: SyncStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, name: &str, identifier: &str) -> SyncResult<Option<IndexRecord>> {
        let cf = self.store.cf(CF_INDEXES)?;
        match self.store.db().get_cf(cf, index_key(name, identifier))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Last external id known for `name`, 0 if unknown
    pub fn latest_index(&self, name: &str, identifier: &str) -> SyncResult<i64> {
        Ok(self.get(name, identifier)?.map(|r| r.index).unwrap_or(0))
    }

    /// Last change index known for `name`, 0 if unknown
    pub fn latest_change_index(&self, name: &str, identifier: &str) -> SyncResult<i64> {
        Ok(self
            .get(name, identifier)?
            .map(|r| r.change_index)
            .unwrap_or(0))
    }

    /// Advance the record for (`name`, `identifier`)
    ///
    /// Each field is only raised, never lowered. Returns true if anything
    /// was written.
    pub fn record_progress(
        &self,
        name: &str,
        identifier: &str,
        index: Option<i64>,
        change_index: Option<i64>,
    ) -> SyncResult<bool> {
        let _guard = self.write_lock.lock();

        let mut record = self.get(name, identifier)?.unwrap_or_else(|| IndexRecord {
            name: name.to_string(),
            identifier: identifier.to_string(),
            index: 0,
            change_index: 0,
        });

        let mut changed = false;
        if let Some(index) = index {
            if index > record.index {
                record.index = index;
                changed = true;
            }
        }
        if let Some(change_index) = change_index {
            if change_index > record.change_index {
                record.change_index = change_index;
                changed = true;
            }
        }

        if changed {
            let cf = self.store.cf(CF_INDEXES)?;
            self.store
                .db()
                .put_cf(cf, index_key(name, identifier), serde_json::to_vec(&record)?)?;
            tracing::debug!(
                "PeerIndexStore: {}/{} -> index {} change {}",
                name,
                identifier,
                record.index,
                record.change_index
            );
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, PeerIndexStore) {
        let tmp = TempDir::new().unwrap();
        let store = SyncStore::open(tmp.path().join("db")).unwrap();
        (tmp, PeerIndexStore::new(store))
    }

    #[test]
    fn test_unknown_peer_defaults_to_zero() {
        let (_tmp, store) = open_store();
        assert!(store.get("leader", "messages").unwrap().is_none());
        assert_eq!(store.latest_index("leader", "messages").unwrap(), 0);
        assert_eq!(store.latest_change_index("leader", "messages").unwrap(), 0);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (_tmp, store) = open_store();

        assert!(store
            .record_progress("leader", "messages", Some(5), Some(7))
            .unwrap());
        // Stale values rejected
        assert!(!store
            .record_progress("leader", "messages", Some(3), Some(2))
            .unwrap());
        // Fields advance independently
        assert!(store
            .record_progress("leader", "messages", Some(4), Some(9))
            .unwrap());

        let rec = store.get("leader", "messages").unwrap().unwrap();
        assert_eq!(rec.index, 5);
        assert_eq!(rec.change_index, 9);

        assert!(store
            .record_progress("leader", "messages", Some(6), None)
            .unwrap());
        assert_eq!(store.latest_index("leader", "messages").unwrap(), 6);
        assert_eq!(store.latest_change_index("leader", "messages").unwrap(), 9);
    }

    #[test]
    fn test_records_are_per_peer_and_collection() {
        let (_tmp, store) = open_store();
        store.record_progress("a", "messages", Some(1), None).unwrap();
        store.record_progress("a", "notes", Some(2), None).unwrap();
        store.record_progress("ab", "messages", Some(3), None).unwrap();

        assert_eq!(store.latest_index("a", "messages").unwrap(), 1);
        assert_eq!(store.latest_index("a", "notes").unwrap(), 2);
        assert_eq!(store.latest_index("ab", "messages").unwrap(), 3);
        assert_eq!(store.latest_index("ab", "notes").unwrap(), 0);
    }
}
