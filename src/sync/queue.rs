//! Pending-operation queue
//!
//! Tracks mutations that were broadcast and are waiting for acknowledgements.
//! Entries are keyed by `(identifier, kind, external_id)`; enqueueing a key
//! that is already pending replaces the older entry, whose waiter then sees
//! it as superseded.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::protocol::{Ack, ChangeKind, PeerId};
use crate::adapter::Record;

/// Handle returned by [`PendingQueue::enqueue`], unique per entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(u64);

/// A peer's acknowledgement of a pending operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub peer: PeerId,
    /// External id reported by the peer; the leader may reassign insert ids
    pub external_id: i64,
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub handle: QueueHandle,
    pub identifier: String,
    pub kind: ChangeKind,
    pub external_id: i64,
    pub data: Record,
    pub done: Vec<Acknowledgement>,
}

impl PendingOperation {
    fn matches(&self, identifier: &str, kind: ChangeKind, external_id: i64) -> bool {
        self.identifier == identifier && self.kind == kind && self.external_id == external_id
    }

    pub fn acked_by(&self, peer: &str) -> bool {
        self.done.iter().any(|a| a.peer == peer)
    }
}

#[derive(Default)]
struct QueueInner {
    next_handle: u64,
    entries: VecDeque<PendingOperation>,
}

/// FIFO of operations awaiting acknowledgements
#[derive(Default)]
pub struct PendingQueue {
    inner: Mutex<QueueInner>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation, replacing any pending entry with the same key
    pub fn enqueue(
        &self,
        identifier: &str,
        kind: ChangeKind,
        external_id: i64,
        data: Record,
    ) -> QueueHandle {
        let mut inner = self.inner.lock();
        inner
            .entries
            .retain(|op| !op.matches(identifier, kind, external_id));

        inner.next_handle += 1;
        let handle = QueueHandle(inner.next_handle);
        inner.entries.push_back(PendingOperation {
            handle,
            identifier: identifier.to_string(),
            kind,
            external_id,
            data,
            done: Vec::new(),
        });
        handle
    }

    /// Record `peer`'s ack for the entry with exactly this key
    ///
    /// Returns false if no such entry is pending. A second ack from the same
    /// peer is ignored.
    pub fn record_ack(&self, kind: ChangeKind, peer: &str, ack: &Ack) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .entries
            .iter_mut()
            .find(|op| op.matches(&ack.identifier, kind, ack.external_id))
        {
            Some(op) => {
                Self::push_ack(op, peer, ack.external_id);
                true
            }
            None => false,
        }
    }

    /// Record `peer`'s ack for the oldest entry of this identifier and kind
    ///
    /// Used for inserts sent to the leader, which answers with the id it
    /// assigned rather than the one we proposed.
    pub fn record_ack_any(&self, kind: ChangeKind, peer: &str, ack: &Ack) -> bool {
        let mut inner = self.inner.lock();
        let target = inner
            .entries
            .iter_mut()
            .filter(|op| op.identifier == ack.identifier && op.kind == kind)
            .find(|op| !op.acked_by(peer));

        match target {
            Some(op) => {
                Self::push_ack(op, peer, ack.external_id);
                true
            }
            None => false,
        }
    }

    fn push_ack(op: &mut PendingOperation, peer: &str, external_id: i64) {
        if !op.acked_by(peer) {
            op.done.push(Acknowledgement {
                peer: peer.to_string(),
                external_id,
            });
        }
    }

    /// True when every peer in `required` has acknowledged the entry
    pub fn is_satisfied<'a, I>(&self, handle: QueueHandle, required: I) -> Option<bool>
    where
        I: IntoIterator<Item = &'a PeerId>,
    {
        let inner = self.inner.lock();
        let op = inner.entries.iter().find(|op| op.handle == handle)?;
        Some(required.into_iter().all(|peer| op.acked_by(peer)))
    }

    pub fn get(&self, handle: QueueHandle) -> Option<PendingOperation> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|op| op.handle == handle)
            .cloned()
    }

    pub fn dequeue(&self, handle: QueueHandle) -> Option<PendingOperation> {
        let mut inner = self.inner.lock();
        let pos = inner.entries.iter().position(|op| op.handle == handle)?;
        inner.entries.remove(pos)
    }

    /// Drop every pending entry; waiters observe them as superseded
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ack(identifier: &str, external_id: i64) -> Ack {
        Ack {
            identifier: identifier.to_string(),
            external_id,
        }
    }

    #[test]
    fn test_enqueue_replaces_same_key() {
        let queue = PendingQueue::new();
        let first = queue.enqueue("messages", ChangeKind::Update, 3, json!({"v": 1}));
        let second = queue.enqueue("messages", ChangeKind::Update, 3, json!({"v": 2}));

        assert_ne!(first, second);
        assert_eq!(queue.len(), 1);
        assert!(queue.get(first).is_none());
        assert_eq!(queue.get(second).unwrap().data["v"], 2);
    }

    #[test]
    fn test_different_kinds_coexist() {
        let queue = PendingQueue::new();
        queue.enqueue("messages", ChangeKind::Update, 3, json!({}));
        queue.enqueue("messages", ChangeKind::Delete, 3, json!({}));
        queue.enqueue("other", ChangeKind::Update, 3, json!({}));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_record_ack_exact_and_duplicates() {
        let queue = PendingQueue::new();
        let handle = queue.enqueue("messages", ChangeKind::Insert, 5, json!({}));

        assert!(queue.record_ack(ChangeKind::Insert, "a", &ack("messages", 5)));
        assert!(queue.record_ack(ChangeKind::Insert, "a", &ack("messages", 5)));
        assert!(!queue.record_ack(ChangeKind::Insert, "b", &ack("messages", 6)));
        assert!(!queue.record_ack(ChangeKind::Update, "b", &ack("messages", 5)));

        let op = queue.get(handle).unwrap();
        assert_eq!(op.done.len(), 1);
        assert!(op.acked_by("a"));
    }

    #[test]
    fn test_record_ack_any_takes_oldest() {
        let queue = PendingQueue::new();
        let first = queue.enqueue("messages", ChangeKind::Insert, 4, json!({}));
        let second = queue.enqueue("messages", ChangeKind::Insert, 5, json!({}));

        // Leader reassigned the id to 9
        assert!(queue.record_ack_any(ChangeKind::Insert, "leader", &ack("messages", 9)));
        assert_eq!(queue.get(first).unwrap().done[0].external_id, 9);
        assert!(queue.get(second).unwrap().done.is_empty());

        assert!(queue.record_ack_any(ChangeKind::Insert, "leader", &ack("messages", 10)));
        assert_eq!(queue.get(second).unwrap().done[0].external_id, 10);
    }

    #[test]
    fn test_is_satisfied() {
        let queue = PendingQueue::new();
        let handle = queue.enqueue("messages", ChangeKind::Delete, 2, json!({}));
        let peers = vec!["a".to_string(), "b".to_string()];

        assert_eq!(queue.is_satisfied(handle, &peers), Some(false));
        queue.record_ack(ChangeKind::Delete, "a", &ack("messages", 2));
        assert_eq!(queue.is_satisfied(handle, &peers), Some(false));
        queue.record_ack(ChangeKind::Delete, "b", &ack("messages", 2));
        assert_eq!(queue.is_satisfied(handle, &peers), Some(true));

        // No peers required means trivially satisfied
        assert_eq!(queue.is_satisfied(handle, &Vec::<PeerId>::new()), Some(true));
    }

    #[test]
    fn test_dequeue_and_clear() {
        let queue = PendingQueue::new();
        let handle = queue.enqueue("messages", ChangeKind::Insert, 1, json!({}));
        queue.enqueue("messages", ChangeKind::Insert, 2, json!({}));

        assert!(queue.dequeue(handle).is_some());
        assert!(queue.dequeue(handle).is_none());
        assert_eq!(queue.is_satisfied(handle, &Vec::<PeerId>::new()), None);

        queue.clear();
        assert!(queue.is_empty());
    }
}
