//! Per-resource-key operation scheduling.
//!
//! Operations touching the same resource key resolve strictly in proposal
//! order; disjoint keys never wait on each other. The scheduler is plain
//! FIFO bookkeeping: the engine asks whether an operation may start and
//! reports when one finishes.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::operation::OperationId;

/// FIFO queues keyed by resource key.
#[derive(Debug, Default)]
pub struct ResourceScheduler {
    queues: BTreeMap<[u8; 32], VecDeque<OperationId>>,
}

impl ResourceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an operation on its key. Returns true if it is immediately
    /// runnable (nothing ahead of it).
    pub fn enqueue(&mut self, key: [u8; 32], operation: OperationId) -> bool {
        let queue = self.queues.entry(key).or_default();
        queue.push_back(operation);
        let runnable = queue.len() == 1;
        debug!(operation = %operation, position = queue.len() - 1, runnable, "operation enqueued");
        runnable
    }

    /// Whether an operation is at the front of its key's queue.
    pub fn is_runnable(&self, key: &[u8; 32], operation: &OperationId) -> bool {
        self.queues
            .get(key)
            .and_then(|q| q.front())
            .map(|front| front == operation)
            .unwrap_or(false)
    }

    /// Mark the front operation of a key finished, returning the next
    /// operation now unblocked on that key, if any.
    pub fn complete(&mut self, key: &[u8; 32], operation: &OperationId) -> Option<OperationId> {
        let queue = self.queues.get_mut(key)?;
        if queue.front() == Some(operation) {
            queue.pop_front();
        } else {
            // Finished out of order (e.g. rejected before it ever ran);
            // remove it wherever it sits.
            queue.retain(|id| id != operation);
        }
        let next = queue.front().copied();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        next
    }

    /// Operations currently queued (running or waiting) across all keys.
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_is_fifo() {
        let mut sched = ResourceScheduler::new();
        let key = [1u8; 32];
        let first = OperationId::random();
        let second = OperationId::random();

        assert!(sched.enqueue(key, first));
        assert!(!sched.enqueue(key, second));
        assert!(sched.is_runnable(&key, &first));
        assert!(!sched.is_runnable(&key, &second));

        assert_eq!(sched.complete(&key, &first), Some(second));
        assert!(sched.is_runnable(&key, &second));
        assert_eq!(sched.complete(&key, &second), None);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn disjoint_keys_run_concurrently() {
        let mut sched = ResourceScheduler::new();
        let a = OperationId::random();
        let b = OperationId::random();

        assert!(sched.enqueue([1u8; 32], a));
        assert!(sched.enqueue([2u8; 32], b));
        assert!(sched.is_runnable(&[1u8; 32], &a));
        assert!(sched.is_runnable(&[2u8; 32], &b));
    }

    #[test]
    fn mid_queue_completion_preserves_order() {
        let mut sched = ResourceScheduler::new();
        let key = [3u8; 32];
        let ops: Vec<OperationId> = (0..3).map(|_| OperationId::random()).collect();
        for op in &ops {
            sched.enqueue(key, *op);
        }

        // Middle operation withdrawn before it ever ran
        assert_eq!(sched.complete(&key, &ops[1]), Some(ops[0]));
        assert!(sched.is_runnable(&key, &ops[0]));
        assert_eq!(sched.complete(&key, &ops[0]), Some(ops[2]));
    }
}
