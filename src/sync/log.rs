//! Change log for recording mutations per collection
//!
//! Append-only: a record is never rewritten or removed. Each collection has
//! its own index sequence. Keys are `identifier \0 index` with a zero-padded
//! index so iteration over a prefix yields changes in index order.

use std::collections::HashMap;

use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode};

use super::protocol::{ChangeKind, ChangeRecord};
use super::store::{SyncStore, CF_CHANGES};
use crate::error::SyncResult;

fn change_key(identifier: &str, index: i64) -> Vec<u8> {
    format!("{}\0{:020}", identifier, index).into_bytes()
}

fn prefix(identifier: &str) -> Vec<u8> {
    format!("{}\0", identifier).into_bytes()
}

/// Keep only the highest-index record per id, ordered by index
pub fn dedup_changes(changes: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut latest: HashMap<i64, ChangeRecord> = HashMap::new();
    for change in changes {
        match latest.get(&change.id) {
            Some(existing) if existing.index >= change.index => {}
            _ => {
                latest.insert(change.id, change);
            }
        }
    }

    let mut out: Vec<ChangeRecord> = latest.into_values().collect();
    out.sort_by_key(|c| c.index);
    out
}

/// Persistent change log backed by RocksDB
pub struct ChangeLog {
    store: SyncStore,
    /// Latest index per identifier, filled lazily
    latest: Mutex<HashMap<String, i64>>,
    /// Serializes index allocation
    write_lock: Mutex<()>,
}

impl ChangeLog {
    pub fn new(store: SyncStore) -> Self {
        Self {
            store,
            latest: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Append a change and return the stored record
    ///
    /// Without `index` the record gets `latest + 1`. An explicit index is
    /// kept when that slot is free; if the slot already holds the same
    /// change nothing is written, and if it holds a different one the record
    /// is appended at `latest + 1` instead.
    pub fn append(
        &self,
        identifier: &str,
        id: i64,
        kind: ChangeKind,
        index: Option<i64>,
    ) -> SyncResult<ChangeRecord> {
        let _guard = self.write_lock.lock();
        let latest = self.latest_index(identifier)?;

        let index = match index.filter(|i| *i > 0) {
            Some(requested) => match self.get(identifier, requested)? {
                Some(existing) if existing.id == id && existing.kind == kind => {
                    return Ok(existing);
                }
                Some(_) => latest + 1,
                None => requested,
            },
            None => latest + 1,
        };

        let record = ChangeRecord {
            index,
            identifier: identifier.to_string(),
            id,
            kind,
        };

        let cf = self.store.cf(CF_CHANGES)?;
        let value = serde_json::to_vec(&record)?;
        self.store
            .db()
            .put_cf(cf, change_key(identifier, index), value)?;

        self.latest
            .lock()
            .insert(identifier.to_string(), latest.max(index));

        tracing::debug!(
            "ChangeLog: {} {} id={} at index {}",
            identifier,
            kind,
            id,
            index
        );
        Ok(record)
    }

    /// Change stored at exactly `index`
    pub fn get(&self, identifier: &str, index: i64) -> SyncResult<Option<ChangeRecord>> {
        let cf = self.store.cf(CF_CHANGES)?;
        match self.store.db().get_cf(cf, change_key(identifier, index))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every logged change with `index > from`, in index order
    pub fn changes_from(&self, identifier: &str, from: i64) -> SyncResult<Vec<ChangeRecord>> {
        let cf = self.store.cf(CF_CHANGES)?;
        let prefix = prefix(identifier);
        let start = change_key(identifier, from.max(0) + 1);

        let mut changes = Vec::new();
        let iter = self
            .store
            .db()
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let record: ChangeRecord = serde_json::from_slice(&value)?;
            if record.index > from {
                changes.push(record);
            }
        }

        Ok(changes)
    }

    /// Changes with `index > from`, deduplicated by id keeping the highest
    /// index, in ascending index order
    pub fn get_changes(&self, identifier: &str, from: i64) -> SyncResult<Vec<ChangeRecord>> {
        Ok(dedup_changes(self.changes_from(identifier, from)?))
    }

    /// Most recent change for an identifier
    pub fn latest_change(&self, identifier: &str) -> SyncResult<Option<ChangeRecord>> {
        let cf = self.store.cf(CF_CHANGES)?;
        let prefix = prefix(identifier);
        // One past the prefix range: `identifier \x01`
        let upper = format!("{}\x01", identifier).into_bytes();

        let mut iter = self
            .store
            .db()
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.starts_with(&prefix) {
                    Ok(Some(serde_json::from_slice(&value)?))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Highest index for an identifier, 0 when the log is empty
    pub fn latest_index(&self, identifier: &str) -> SyncResult<i64> {
        if let Some(index) = self.latest.lock().get(identifier) {
            return Ok(*index);
        }

        let index = self.latest_change(identifier)?.map(|c| c.index).unwrap_or(0);
        self.latest.lock().insert(identifier.to_string(), index);
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log() -> (TempDir, ChangeLog) {
        let tmp = TempDir::new().unwrap();
        let store = SyncStore::open(tmp.path().join("db")).unwrap();
        (tmp, ChangeLog::new(store))
    }

    #[test]
    fn test_append_assigns_increasing_indices() {
        let (_tmp, log) = open_log();

        let a = log.append("messages", 1, ChangeKind::Insert, None).unwrap();
        let b = log.append("messages", 2, ChangeKind::Insert, None).unwrap();
        let c = log.append("messages", 1, ChangeKind::Update, None).unwrap();
        assert_eq!((a.index, b.index, c.index), (1, 2, 3));

        // Separate sequence per identifier
        let other = log.append("notes", 1, ChangeKind::Insert, None).unwrap();
        assert_eq!(other.index, 1);
        assert_eq!(log.latest_index("messages").unwrap(), 3);
        assert_eq!(log.latest_index("notes").unwrap(), 1);
        assert_eq!(log.latest_index("empty").unwrap(), 0);
    }

    #[test]
    fn test_get_changes_dedups_by_id() {
        let (_tmp, log) = open_log();
        log.append("messages", 1, ChangeKind::Insert, None).unwrap();
        log.append("messages", 2, ChangeKind::Insert, None).unwrap();
        log.append("messages", 1, ChangeKind::Update, None).unwrap();

        let changes = log.get_changes("messages", 0).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].id, 2);
        assert_eq!(changes[1].id, 1);
        assert_eq!(changes[1].index, 3);
        assert_eq!(changes[1].kind, ChangeKind::Update);

        let changes = log.get_changes("messages", 2).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].index, 3);

        assert!(log.get_changes("messages", 3).unwrap().is_empty());
    }

    #[test]
    fn test_changes_from_keeps_every_entry() {
        let (_tmp, log) = open_log();
        log.append("messages", 1, ChangeKind::Insert, None).unwrap();
        log.append("messages", 1, ChangeKind::Update, None).unwrap();
        log.append("messages", 1, ChangeKind::Update, None).unwrap();
        log.append("notes", 1, ChangeKind::Insert, None).unwrap();

        let raw = log.changes_from("messages", 1).unwrap();
        let indices: Vec<i64> = raw.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![2, 3]);
        assert!(raw.iter().all(|c| c.id == 1 && c.kind == ChangeKind::Update));
        assert_eq!(log.get_changes("messages", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_prefix_isolation() {
        let (_tmp, log) = open_log();
        log.append("msg", 1, ChangeKind::Insert, None).unwrap();
        log.append("messages", 7, ChangeKind::Delete, None).unwrap();

        let changes = log.get_changes("msg", 0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, 1);
        assert_eq!(log.latest_change("msg").unwrap().unwrap().id, 1);
        assert!(log.latest_change("m").unwrap().is_none());
    }

    #[test]
    fn test_explicit_index() {
        let (_tmp, log) = open_log();
        log.append("messages", 1, ChangeKind::Insert, None).unwrap();

        // Free slot is honored
        let rec = log.append("messages", 4, ChangeKind::Delete, Some(5)).unwrap();
        assert_eq!(rec.index, 5);

        // Same change at the same slot is a no-op
        let again = log.append("messages", 4, ChangeKind::Delete, Some(5)).unwrap();
        assert_eq!(again, rec);
        assert_eq!(log.latest_index("messages").unwrap(), 5);

        // Occupied by something else: appended after the latest
        let moved = log.append("messages", 9, ChangeKind::Insert, Some(1)).unwrap();
        assert_eq!(moved.index, 6);
    }

    #[test]
    fn test_latest_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");
        {
            let log = ChangeLog::new(SyncStore::open(&path).unwrap());
            for id in 1..=12 {
                log.append("messages", id, ChangeKind::Insert, None).unwrap();
            }
        }

        let log = ChangeLog::new(SyncStore::open(&path).unwrap());
        assert_eq!(log.latest_index("messages").unwrap(), 12);
        let next = log.append("messages", 13, ChangeKind::Insert, None).unwrap();
        assert_eq!(next.index, 13);
    }

    #[test]
    fn test_dedup_changes_keeps_highest() {
        let changes = vec![
            ChangeRecord {
                index: 3,
                identifier: "m".to_string(),
                id: 1,
                kind: ChangeKind::Update,
            },
            ChangeRecord {
                index: 1,
                identifier: "m".to_string(),
                id: 1,
                kind: ChangeKind::Insert,
            },
        ];
        let out = dedup_changes(changes);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].index, 3);
    }
}
