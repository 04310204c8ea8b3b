// packages/engine/src/scheduler/retry.rs
//! Retry backoff and the dead-letter log

use crate::model::{AgentId, Capability, Priority, Task, TaskId};
use crate::utils::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Exponential backoff with a ceiling
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,

    /// Total attempts per task, first one included
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay after the failed attempt with zero-based index `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a task that has failed `failures` times gets another attempt
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// One failed attempt
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    /// One-based attempt number
    pub attempt: u32,
    pub agent_id: Option<AgentId>,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    RetriesExhausted,
    Expired,
}

/// A task that will not be attempted again
#[derive(Debug)]
pub struct DeadLetter {
    pub task: Task,
    pub failures: Vec<FailureRecord>,
    pub reason: DeadLetterReason,
    pub at: DateTime<Utc>,
}

/// Snapshot of a dead letter for reporting
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    pub task_id: TaskId,
    pub capability: Capability,
    pub priority: Priority,
    pub submitted_by: String,
    pub payload: serde_json::Value,
    pub failures: Vec<FailureRecord>,
    pub reason: DeadLetterReason,
    pub at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn record(&self) -> DeadLetterRecord {
        DeadLetterRecord {
            task_id: self.task.id(),
            capability: self.task.capability().clone(),
            priority: self.task.priority(),
            submitted_by: self.task.submitted_by().to_string(),
            payload: self.task.payload().clone(),
            failures: self.failures.clone(),
            reason: self.reason,
            at: self.at,
        }
    }
}

/// Bounded dead-letter log, oldest evicted first
#[derive(Debug)]
pub struct DeadLetterLog {
    entries: VecDeque<DeadLetter>,
    capacity: usize,
    evicted: u64,
}

impl DeadLetterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn push(&mut self, letter: DeadLetter) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(letter);
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.entries.iter().map(DeadLetter::record).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn test_attempt_bound() {
        let policy = policy();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_log_evicts_oldest() {
        let mut log = DeadLetterLog::new(2);
        let ids: Vec<TaskId> = (0..3)
            .map(|_| {
                let task = Task::new("echo", serde_json::Value::Null);
                let id = task.id();
                log.push(DeadLetter {
                    task,
                    failures: Vec::new(),
                    reason: DeadLetterReason::Expired,
                    at: Utc::now(),
                });
                id
            })
            .collect();

        let kept: Vec<TaskId> = log.records().iter().map(|r| r.task_id).collect();
        assert_eq!(kept, ids[1..].to_vec());
        assert_eq!(log.evicted(), 1);
    }
}
