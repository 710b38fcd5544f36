//! In-memory data adapter
//!
//! Keeps committed records in a `BTreeMap` keyed by external id, plus the
//! local edits not yet replicated: new records without an id, and the ids of
//! edited or removed records. Used by the demo binary and the test suite.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{external_id, set_external_id, DataAdapter, DirtyRecords, Record, EXTERNAL_ID_FIELD};

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<i64, Record>,
    /// Highest id ever stored, so deleted ids are never handed out again
    high_water: i64,
    pending_inserts: VecDeque<Record>,
    pending_updates: BTreeSet<i64>,
    pending_deletes: BTreeSet<i64>,
}

pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
    allow_updates: AtomicBool,
    allow_deletes: AtomicBool,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of `record` without its external id, for content comparison
fn content(record: &Record) -> Record {
    match record {
        Value::Object(obj) => {
            let mut obj = obj.clone();
            obj.remove(EXTERNAL_ID_FIELD);
            Value::Object(obj)
        }
        other => other.clone(),
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            allow_updates: AtomicBool::new(true),
            allow_deletes: AtomicBool::new(true),
        }
    }

    /// Queue a locally created record; it gets an id once replicated
    pub fn create(&self, record: Record) {
        let mut record = record;
        if let Some(obj) = record.as_object_mut() {
            obj.remove(EXTERNAL_ID_FIELD);
        }
        self.state.lock().pending_inserts.push_back(record);
    }

    /// Replace a committed record locally and mark it for replication
    pub fn modify(&self, id: i64, record: Record) -> bool {
        let mut state = self.state.lock();
        if !state.records.contains_key(&id) {
            return false;
        }
        let mut record = record;
        set_external_id(&mut record, id);
        state.records.insert(id, record);
        state.pending_updates.insert(id);
        true
    }

    /// Mark a committed record for deletion; it stays visible until replicated
    pub fn remove(&self, id: i64) -> bool {
        let mut state = self.state.lock();
        if !state.records.contains_key(&id) {
            return false;
        }
        state.pending_deletes.insert(id);
        true
    }

    /// Committed records in id order
    pub fn records(&self) -> Vec<Record> {
        self.state.lock().records.values().cloned().collect()
    }

    pub fn get(&self, id: i64) -> Option<Record> {
        self.state.lock().records.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of local edits not yet replicated
    pub fn dirty_count(&self) -> usize {
        let state = self.state.lock();
        state.pending_inserts.len() + state.pending_updates.len() + state.pending_deletes.len()
    }

    /// Policy for incoming updates (`decide_update`)
    pub fn set_allow_updates(&self, allow: bool) {
        self.allow_updates.store(allow, Ordering::SeqCst);
    }

    /// Policy for incoming deletes (`decide_delete`)
    pub fn set_allow_deletes(&self, allow: bool) {
        self.allow_deletes.store(allow, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataAdapter for MemoryAdapter {
    async fn latest_external_id(&self) -> anyhow::Result<i64> {
        Ok(self.state.lock().high_water)
    }

    async fn get_data(&self, from: i64, to: Option<i64>) -> anyhow::Result<Vec<Record>> {
        let state = self.state.lock();
        let upper = to.unwrap_or(i64::MAX);
        if upper < from {
            return Ok(Vec::new());
        }
        Ok(state.records.range(from..=upper).map(|(_, r)| r.clone()).collect())
    }

    async fn insert(&self, record: Record, external_id: i64) -> anyhow::Result<()> {
        let mut record = record;
        set_external_id(&mut record, external_id);

        let mut state = self.state.lock();
        state.records.insert(external_id, record);
        state.high_water = state.high_water.max(external_id);
        Ok(())
    }

    async fn update(&self, record: Record) -> anyhow::Result<()> {
        let id = external_id(&record).ok_or_else(|| anyhow!("update without externalId"))?;
        let mut state = self.state.lock();
        if let Some(existing) = state.records.get_mut(&id) {
            *existing = record;
        }
        Ok(())
    }

    async fn delete(&self, external_id: i64) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.records.remove(&external_id);
        state.pending_updates.remove(&external_id);
        Ok(())
    }

    fn is_equal(&self, a: &Record, b: &Record) -> bool {
        content(a) == content(b)
    }

    async fn decide_update(&self, _record: &Record) -> anyhow::Result<bool> {
        Ok(self.allow_updates.load(Ordering::SeqCst))
    }

    async fn decide_delete(&self, _record: &Record) -> anyhow::Result<bool> {
        Ok(self.allow_deletes.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl DirtyRecords for MemoryAdapter {
    async fn fetch_insert(&self) -> anyhow::Result<Option<Record>> {
        Ok(self.state.lock().pending_inserts.front().cloned())
    }

    async fn after_insert(&self, record: &Record, _external_id: i64) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let wanted = content(record);
        if let Some(pos) = state
            .pending_inserts
            .iter()
            .position(|r| content(r) == wanted)
        {
            state.pending_inserts.remove(pos);
        }
        Ok(())
    }

    async fn fetch_update(&self) -> anyhow::Result<Option<Record>> {
        let mut state = self.state.lock();
        while let Some(id) = state.pending_updates.first().copied() {
            if let Some(record) = state.records.get(&id) {
                return Ok(Some(record.clone()));
            }
            state.pending_updates.remove(&id);
        }
        Ok(None)
    }

    async fn after_update(&self, record: &Record) -> anyhow::Result<()> {
        if let Some(id) = external_id(record) {
            self.state.lock().pending_updates.remove(&id);
        }
        Ok(())
    }

    async fn fetch_delete(&self) -> anyhow::Result<Option<Record>> {
        let state = self.state.lock();
        Ok(state.pending_deletes.first().map(|id| {
            state
                .records
                .get(id)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({ EXTERNAL_ID_FIELD: id }))
        }))
    }

    async fn after_delete(&self, record: &Record) -> anyhow::Result<()> {
        if let Some(id) = external_id(record) {
            let mut state = self.state.lock();
            state.pending_deletes.remove(&id);
            state.records.remove(&id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_get_data_ranges() {
        let adapter = MemoryAdapter::new();
        for id in 1..=4 {
            adapter
                .insert(json!({"message": format!("m{}", id)}), id)
                .await
                .unwrap();
        }

        assert_eq!(adapter.latest_external_id().await.unwrap(), 4);
        assert_eq!(adapter.get_data(3, None).await.unwrap().len(), 2);
        let single = adapter.get_data(2, Some(2)).await.unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0]["externalId"], 2);
        assert!(adapter.get_data(5, Some(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_ids_are_not_reused() {
        let adapter = MemoryAdapter::new();
        adapter.insert(json!({"message": "a"}), 1).await.unwrap();
        adapter.insert(json!({"message": "b"}), 2).await.unwrap();
        adapter.delete(2).await.unwrap();

        assert_eq!(adapter.len(), 1);
        assert_eq!(adapter.latest_external_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_equality_ignores_external_id() {
        let adapter = MemoryAdapter::new();
        assert!(adapter.is_equal(
            &json!({"message": "x", "externalId": 1}),
            &json!({"message": "x", "externalId": 2})
        ));
        assert!(!adapter.is_equal(&json!({"message": "x"}), &json!({"message": "y"})));
    }

    #[tokio::test]
    async fn test_dirty_insert_cycle() {
        let adapter = MemoryAdapter::new();
        adapter.create(json!({"message": "first"}));
        adapter.create(json!({"message": "second"}));

        let candidate = adapter.fetch_insert().await.unwrap().unwrap();
        assert_eq!(candidate["message"], "first");

        adapter.insert(candidate.clone(), 1).await.unwrap();
        adapter.after_insert(&candidate, 1).await.unwrap();

        let next = adapter.fetch_insert().await.unwrap().unwrap();
        assert_eq!(next["message"], "second");
        assert_eq!(adapter.dirty_count(), 1);
    }

    #[tokio::test]
    async fn test_dirty_update_and_delete_cycle() {
        let adapter = MemoryAdapter::new();
        adapter.insert(json!({"message": "a"}), 1).await.unwrap();
        adapter.insert(json!({"message": "b"}), 2).await.unwrap();

        assert!(adapter.modify(1, json!({"message": "a2"})));
        assert!(!adapter.modify(9, json!({"message": "zz"})));
        let update = adapter.fetch_update().await.unwrap().unwrap();
        assert_eq!(update, json!({"message": "a2", "externalId": 1}));
        adapter.after_update(&update).await.unwrap();
        assert!(adapter.fetch_update().await.unwrap().is_none());

        assert!(adapter.remove(2));
        let delete = adapter.fetch_delete().await.unwrap().unwrap();
        assert_eq!(delete["externalId"], 2);
        // Still visible until replicated
        assert!(adapter.get(2).is_some());
        adapter.after_delete(&delete).await.unwrap();
        assert!(adapter.get(2).is_none());
        assert!(adapter.fetch_delete().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_policy_switches() {
        let adapter = MemoryAdapter::new();
        let record = json!({"externalId": 1});
        assert!(adapter.decide_delete(&record).await.unwrap());
        adapter.set_allow_deletes(false);
        assert!(!adapter.decide_delete(&record).await.unwrap());
        adapter.set_allow_updates(false);
        assert!(!adapter.decide_update(&record).await.unwrap());
    }
}
