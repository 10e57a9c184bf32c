//! Priority-ordered admission queue.
//!
//! Highest priority first; within a priority the earliest-created task wins,
//! and the submission sequence number breaks ties between tasks created in the
//! same millisecond.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::core::executor::TaskBody;
use crate::core::task::{TaskRecord, TaskSnapshot};
use crate::util::serde::TaskId;

/// A task waiting for admission, together with its not-yet-run body.
pub(crate) struct PendingTask {
    pub(crate) record: TaskRecord,
    pub(crate) body: Box<dyn TaskBody>,
}

impl PendingTask {
    fn sort_key(&self) -> (crate::util::serde::Priority, std::cmp::Reverse<u128>, std::cmp::Reverse<u64>) {
        (
            self.record.priority,
            std::cmp::Reverse(self.record.created_at_ms),
            std::cmp::Reverse(self.record.seq),
        )
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.record.id == other.record.id
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Max-heap of pending tasks. O(log n) push and pop.
#[derive(Default)]
pub(crate) struct AdmissionQueue {
    tasks: BinaryHeap<PendingTask>,
}

impl AdmissionQueue {
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, task: PendingTask) {
        self.tasks.push(task);
    }

    /// Remove and return the best task.
    pub(crate) fn pop(&mut self) -> Option<PendingTask> {
        self.tasks.pop()
    }

    /// Remove a specific task.
    pub(crate) fn remove(&mut self, id: &TaskId) -> Option<PendingTask> {
        if !self.contains(id) {
            return None;
        }
        let (found, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_vec()
            .into_iter()
            .partition(|t| &t.record.id == id);
        self.tasks = BinaryHeap::from(rest);
        found.into_iter().next()
    }

    pub(crate) fn get(&self, id: &TaskId) -> Option<&PendingTask> {
        self.tasks.iter().find(|t| &t.record.id == id)
    }

    pub(crate) fn contains(&self, id: &TaskId) -> bool {
        self.get(id).is_some()
    }

    /// Remove every task, best first.
    pub(crate) fn drain_sorted(&mut self) -> Vec<PendingTask> {
        let mut drained = std::mem::take(&mut self.tasks).into_sorted_vec();
        drained.reverse();
        drained
    }

    /// Snapshots in admission order.
    pub(crate) fn snapshots(&self, subtasks: impl Fn(&TaskId) -> Vec<TaskId>) -> Vec<TaskSnapshot> {
        let mut entries: Vec<&PendingTask> = self.tasks.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|t| t.record.snapshot(subtasks(&t.record.id)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
