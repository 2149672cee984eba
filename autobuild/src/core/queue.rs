//! In-memory priority queue of pending state transitions.

use chrono::{DateTime, Utc};

use crate::core::types::ExecutionState;

/// Priority given to items re-queued after losing the lease race.
pub const CONTENTION_PRIORITY: i32 = 1;

/// A pending request to execute `state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: String,
    pub state: ExecutionState,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Single-consumer priority queue ordered by (priority desc, enqueue time asc).
///
/// Sorting is stable, so items with equal priority and timestamp keep their
/// insertion order.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    items: Vec<QueueItem>,
    next_seq: u64,
    processing: bool,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a transition request and return its id.
    pub fn enqueue(&mut self, state: ExecutionState, priority: i32) -> String {
        self.next_seq += 1;
        let id = format!("q-{}", self.next_seq);
        self.items.push(QueueItem {
            id: id.clone(),
            state,
            priority,
            enqueued_at: Utc::now(),
            retry_count: 0,
        });
        self.sort();
        id
    }

    /// Put an item back after lock contention, bumped ahead of fresh requests.
    pub fn requeue(&mut self, mut item: QueueItem) {
        item.priority = item.priority.max(CONTENTION_PRIORITY);
        item.retry_count += 1;
        self.items.push(item);
        self.sort();
    }

    pub fn dequeue(&mut self) -> Option<QueueItem> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.items.remove(0))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn contains_state(&self, state: ExecutionState) -> bool {
        self.items.iter().any(|item| item.state == state)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_first_then_fifo() {
        let mut queue = ExecutionQueue::new();
        let first = queue.enqueue(ExecutionState::Plan, 0);
        let urgent = queue.enqueue(ExecutionState::Implement, 1);
        let last = queue.enqueue(ExecutionState::Verify, 0);

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|item| item.id)
            .collect();
        assert_eq!(order, vec![urgent, first, last]);
    }

    #[test]
    fn requeue_bumps_priority_and_retry_count() {
        let mut queue = ExecutionQueue::new();
        queue.enqueue(ExecutionState::Plan, 0);
        let item = queue.dequeue().expect("item");
        queue.enqueue(ExecutionState::Verify, 0);
        queue.requeue(item);

        let next = queue.dequeue().expect("requeued");
        assert_eq!(next.state, ExecutionState::Plan);
        assert_eq!(next.priority, CONTENTION_PRIORITY);
        assert_eq!(next.retry_count, 1);
    }

    #[test]
    fn clear_empties_queue_but_keeps_ids_unique() {
        let mut queue = ExecutionQueue::new();
        let a = queue.enqueue(ExecutionState::Plan, 0);
        queue.clear();
        assert!(queue.is_empty());
        let b = queue.enqueue(ExecutionState::Plan, 0);
        assert_ne!(a, b);
        assert!(queue.contains_state(ExecutionState::Plan));
    }

    #[test]
    fn processing_flag_round_trips() {
        let mut queue = ExecutionQueue::new();
        assert!(!queue.is_processing());
        queue.set_processing(true);
        assert!(queue.is_processing());
    }
}
