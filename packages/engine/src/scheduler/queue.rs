// packages/engine/src/scheduler/queue.rs
//! Priority queue with skip
//!
//! Ordered by (priority desc, enqueue sequence asc): strict preference
//! across priority bands, FIFO within a band. Dispatch scans in that order
//! and takes the first task it can place, so a task whose capability has no
//! idle agent never blocks the tasks behind it.
//!
//! ```text
//! Critical  [t7]
//! High      [t2, t9]
//! Normal    [t1, t3, t4]   ← t1 skipped (no agent), t3 dispatched
//! ```

use crate::model::{Priority, Task, TaskId};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    seq: u64,
}

/// Pending tasks in dispatch order
#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: BTreeMap<QueueKey, Task>,
    index: HashMap<TaskId, QueueKey>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue behind every task of equal priority; returns the sequence number
    pub fn push(&mut self, task: Task) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(task, seq);
        seq
    }

    /// Put a task back at a sequence number it held before
    pub fn requeue(&mut self, task: Task, seq: u64) {
        self.insert(task, seq);
    }

    fn insert(&mut self, task: Task, seq: u64) {
        let key = QueueKey {
            priority: Reverse(task.priority()),
            seq,
        };
        self.index.insert(task.id(), key);
        self.entries.insert(key, task);
    }

    /// Sequence number a queued task was enqueued with
    pub fn seq_of(&self, id: TaskId) -> Option<u64> {
        self.index.get(&id).map(|key| key.seq)
    }

    /// Remove and return the first task, in dispatch order, accepted by `accept`
    ///
    /// `accept` sees tasks in order and may have side effects; scanning stops
    /// at the first task it accepts.
    pub fn pop_first_matching<F>(&mut self, mut accept: F) -> Option<(Task, u64)>
    where
        F: FnMut(&Task) -> bool,
    {
        let key = self
            .entries
            .iter()
            .find(|(_, task)| accept(task))
            .map(|(key, _)| *key)?;

        let task = self.entries.remove(&key)?;
        self.index.remove(&task.id());
        Some((task, key.seq))
    }

    pub fn pop_front(&mut self) -> Option<(Task, u64)> {
        self.pop_first_matching(|_| true)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let key = self.index.remove(&id)?;
        self.entries.remove(&key)
    }

    /// Remove every task whose deadline is at or before `now`
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<Task> {
        let expired: Vec<TaskId> = self
            .entries
            .values()
            .filter(|task| task.is_expired(now))
            .map(|task| task.id())
            .collect();

        expired.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn drain(&mut self) -> Vec<Task> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Task ids in dispatch order
    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.values().map(|task| task.id()).collect()
    }

    pub fn depth_by_priority(&self) -> HashMap<Priority, usize> {
        let mut depth = HashMap::new();
        for key in self.entries.keys() {
            *depth.entry(key.priority.0).or_insert(0) += 1;
        }
        depth
    }
}
