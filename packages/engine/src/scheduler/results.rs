// packages/engine/src/scheduler/results.rs
//! Task status tracking for polling and awaiting callers

use crate::model::{AgentId, ExecutionResult, TaskId};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::watch;

/// Where a task is in its life
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running {
        agent_id: AgentId,
        attempt: u32,
    },
    RetryPending {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    Completed {
        result: ExecutionResult,
    },
    DeadLettered {
        result: ExecutionResult,
    },
    Cancelled {
        result: ExecutionResult,
    },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        self.result().is_some()
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            TaskStatus::Completed { result }
            | TaskStatus::DeadLettered { result }
            | TaskStatus::Cancelled { result } => Some(result),
            _ => None,
        }
    }
}

/// Latest status per task, with bounded retention of finished ones
pub struct ResultStore {
    statuses: DashMap<TaskId, watch::Sender<TaskStatus>>,
    finished: Mutex<VecDeque<TaskId>>,
    retention: usize,
}

impl ResultStore {
    pub fn new(retention: usize) -> Self {
        Self {
            statuses: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }

    pub fn register(&self, id: TaskId) {
        let (tx, _) = watch::channel(TaskStatus::Queued);
        self.statuses.insert(id, tx);
    }

    pub fn set(&self, id: TaskId, status: TaskStatus) {
        let terminal = status.is_terminal();
        match self.statuses.get(&id) {
            Some(tx) => {
                tx.send_replace(status);
            }
            None => {
                let (tx, _) = watch::channel(status);
                self.statuses.insert(id, tx);
            }
        }

        if terminal {
            let evicted = {
                let mut finished = self.finished.lock();
                finished.push_back(id);
                if finished.len() > self.retention {
                    finished.pop_front()
                } else {
                    None
                }
            };
            if let Some(old) = evicted {
                self.statuses.remove(&old);
            }
        }
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.statuses.get(&id).map(|tx| tx.borrow().clone())
    }

    /// Terminal result, if the task has finished
    pub fn try_result(&self, id: TaskId) -> Option<ExecutionResult> {
        self.status(id).and_then(|status| status.result().cloned())
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait(&self, id: TaskId) -> Result<ExecutionResult> {
        let mut rx = self
            .statuses
            .get(&id)
            .map(|tx| tx.subscribe())
            .ok_or(EngineError::TaskNotFound(id))?;

        let status = rx
            .wait_for(TaskStatus::is_terminal)
            .await
            .map_err(|_| EngineError::TaskNotFound(id))?;

        status
            .result()
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("task {} finished without a result", id)))
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_resolves_on_terminal_status() {
        let store = Arc::new(ResultStore::new(10));
        let id = TaskId::new();
        store.register(id);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait(id).await })
        };

        store.set(
            id,
            TaskStatus::Running {
                agent_id: AgentId::new(),
                attempt: 1,
            },
        );
        assert!(store.try_result(id).is_none());

        store.set(
            id,
            TaskStatus::Completed {
                result: ExecutionResult::failed(id, None, "boom"),
            },
        );

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.task_id, id);
        assert!(store.status(id).unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let store = ResultStore::new(10);
        assert!(matches!(
            store.wait(TaskId::new()).await,
            Err(EngineError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_retention_evicts_oldest_finished() {
        let store = ResultStore::new(2);
        let ids: Vec<TaskId> = (0..3).map(|_| TaskId::new()).collect();
        for id in &ids {
            store.register(*id);
            store.set(
                *id,
                TaskStatus::Cancelled {
                    result: ExecutionResult::failed(*id, None, "cancelled"),
                },
            );
        }
        assert!(store.status(ids[0]).is_none());
        assert!(store.status(ids[2]).is_some());
        assert_eq!(store.len(), 2);
    }
}
