use crate::action::ActionResult;
use crate::alert::Alert;
use crate::error::{RemedyError, Result};
use crate::rules::Automation;
use crate::types::QueueStatus;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use uuid::Uuid;

fn automation_id<S: Serializer>(automation: &Arc<Automation>, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&automation.id)
}

// ---------------------------------------------------------------------------
// QueueItem
// ---------------------------------------------------------------------------

/// One pending or executed run of an automation.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    #[serde(rename = "automation_id", serialize_with = "automation_id")]
    pub automation: Arc<Automation>,
    pub priority: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    pub status: QueueStatus,
    /// Executions started so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ActionResult>,
}

impl QueueItem {
    pub fn new(automation: Arc<Automation>, priority: u32, alert: Option<Alert>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            automation,
            priority,
            alert,
            schedule_id: None,
            status: QueueStatus::Queued,
            attempts: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            results: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// PriorityQueue
// ---------------------------------------------------------------------------

struct Entry {
    key: (u32, Reverse<u64>),
    item: QueueItem,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Bounded max-priority queue. Equal priorities pop in enqueue order.
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    capacity: usize,
    seq: u64,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
            seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn push(&mut self, item: QueueItem) -> Result<()> {
        let capacity = self.capacity;
        self.try_push(item)
            .map_err(|_| RemedyError::QueueFull(capacity))
    }

    /// Like [`push`](Self::push) but hands the item back when full.
    pub fn try_push(&mut self, mut item: QueueItem) -> std::result::Result<(), QueueItem> {
        if self.is_full() {
            return Err(item);
        }
        item.status = QueueStatus::Queued;
        self.seq += 1;
        self.heap.push(Entry {
            key: (item.priority, Reverse(self.seq)),
            item,
        });
        Ok(())
    }

    pub fn pop(&mut self) -> Option<QueueItem> {
        self.heap.pop().map(|e| e.item)
    }

    pub fn remove(&mut self, id: &str) -> Option<QueueItem> {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let removed = entries
            .iter()
            .position(|e| e.item.id == id)
            .map(|pos| entries.swap_remove(pos).item);
        self.heap = BinaryHeap::from(entries);
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.heap.iter().any(|e| e.item.id == id)
    }

    /// Items in the order they would be popped.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.item.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::WorkflowStep;

    fn item(priority: u32) -> QueueItem {
        let automation = Arc::new(Automation {
            id: format!("auto-{priority}"),
            name: "test".into(),
            kind: "default".into(),
            conditions: vec![],
            workflow: vec![WorkflowStep::new("log", true)],
            enabled: true,
            created_at: Utc::now(),
        });
        QueueItem::new(automation, priority, None)
    }

    #[test]
    fn highest_priority_first_fifo_within_ties() {
        let mut q = PriorityQueue::new(10);
        let a = item(1);
        let b = item(3);
        let c = item(3);
        let d = item(2);
        let order = vec![b.id.clone(), c.id.clone(), d.id.clone(), a.id.clone()];
        for i in [a, b, c, d] {
            q.push(i).unwrap();
        }
        let snap: Vec<String> = q.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(snap, order);
        let popped: Vec<String> = std::iter::from_fn(|| q.pop()).map(|i| i.id).collect();
        assert_eq!(popped, order);
    }

    #[test]
    fn rejects_when_full() {
        let mut q = PriorityQueue::new(2);
        q.push(item(1)).unwrap();
        q.push(item(1)).unwrap();
        assert!(matches!(q.push(item(5)), Err(RemedyError::QueueFull(2))));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn remove_keeps_order_of_the_rest() {
        let mut q = PriorityQueue::new(10);
        let first = item(2);
        let gone = item(2);
        let last = item(2);
        let (first_id, gone_id, last_id) = (first.id.clone(), gone.id.clone(), last.id.clone());
        for i in [first, gone, last] {
            q.push(i).unwrap();
        }
        assert!(q.remove(&gone_id).is_some());
        assert!(q.remove(&gone_id).is_none());
        assert_eq!(q.pop().unwrap().id, first_id);
        assert_eq!(q.pop().unwrap().id, last_id);
    }
}
