// packages/engine/src/scheduler/dispatcher.rs
//! Scheduler actor
//!
//! A single task owns the queue, the retry backoff set, the circuit
//! breakers and the dead-letter log. Everything else talks to it through a
//! [`SchedulerHandle`]:
//!
//! ```text
//!  submit / cancel / stats ──┐
//!  executor completions ─────┤            ┌─► executor.run (spawned)
//!  retry timers ─────────────┼─► mpsc ─► Dispatcher ─► ResultStore (watch)
//!  cooldown timers, wake ────┤            └─► TelemetryCollector
//!  periodic tick ────────────┘
//! ```
//!
//! A dispatch pass walks the queue in (priority desc, sequence asc) order
//! and starts every task that has an idle agent, a closed circuit and room
//! in the quota ledger. Tasks that cannot start are skipped, so one starved
//! capability never blocks another.

use crate::model::{AgentId, Capability, ExecutionResult, Priority, Task, TaskId};
use crate::runtime::executor::{DispatchError, Execution, Executor};
use crate::runtime::quota::{Admission, ResourceQuota};
use crate::scheduler::circuit_breaker::{CircuitBreaker, CircuitStatus};
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::results::{ResultStore, TaskStatus};
use crate::scheduler::retry::{
    DeadLetter, DeadLetterLog, DeadLetterReason, DeadLetterRecord, FailureRecord, RetryPolicy,
};
use crate::telemetry::TelemetryCollector;
use crate::utils::config::SchedulerConfig;
use crate::utils::errors::{EngineError, RejectionReason, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const SHUTDOWN_CANCELLED: &str = "scheduler shut down";
const CANCEL_RETRIES: u32 = 100;
const CANCEL_RETRY_DELAY: Duration = Duration::from_millis(10);

enum SchedulerCommand {
    Submit {
        task: Task,
        reply: oneshot::Sender<std::result::Result<TaskId, RejectionReason>>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Finished(Box<Completion>),
    RetryDue(TaskId),
    Wake,
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    DeadLetters {
        reply: oneshot::Sender<Vec<DeadLetterRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Completion {
    agent_id: AgentId,
    outcome: std::result::Result<Execution, DispatchError>,
}

/// A task handed to an agent and the ledger charge it holds
struct Running {
    agent_id: AgentId,
    capability: Capability,
    charged: ResourceQuota,
    seq: u64,
}

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub queued_by_priority: BTreeMap<Priority, usize>,
    pub backing_off: usize,
    pub running: usize,
    pub dead_letters: usize,
    pub dead_letters_evicted: u64,
    pub open_circuits: Vec<Capability>,
    pub accepting: bool,
}

/// Cloneable front door to the scheduler actor
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
    results: Arc<ResultStore>,
    queued: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    /// Start the actor on the current runtime
    pub fn start(
        config: SchedulerConfig,
        executor: Arc<Executor>,
        telemetry: Arc<TelemetryCollector>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let results = Arc::new(ResultStore::new(config.result_retention));
        let queued = Arc::new(AtomicUsize::new(0));

        let dispatcher = Dispatcher {
            retry: RetryPolicy::from_config(&config),
            dead_letters: DeadLetterLog::new(config.dead_letter_capacity),
            config,
            executor,
            telemetry,
            results: results.clone(),
            queue: TaskQueue::new(),
            backoff: HashMap::new(),
            running: HashMap::new(),
            failures: HashMap::new(),
            busy: HashSet::new(),
            cancelled: HashSet::new(),
            breakers: HashMap::new(),
            queued: queued.clone(),
            self_tx: tx.downgrade(),
            accepting: true,
            stopping: false,
            drain_deadline: None,
            shutdown_replies: Vec::new(),
        };
        let handle = tokio::spawn(dispatcher.run(rx));

        (Self { tx, results, queued }, handle)
    }

    /// Admit a task into the queue
    pub async fn submit(&self, task: Task) -> std::result::Result<TaskId, RejectionReason> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Submit { task, reply })
            .map_err(|_| RejectionReason::ShuttingDown)?;
        rx.await.map_err(|_| RejectionReason::ShuttingDown)?
    }

    /// Cancel a queued, backing-off or running task
    ///
    /// Returns `false` when the task is unknown or already finished.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Cancel { task_id, reply })
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Ask for a dispatch pass, e.g. after an agent became available
    pub fn wake(&self) {
        let _ = self.tx.send(SchedulerCommand::Wake);
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Stats { reply })
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::DeadLetters { reply })
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Stop admissions, drain, cancel leftovers and terminate every agent
    ///
    /// Returns once the actor has stopped. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SchedulerCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    /// Queued plus backing-off tasks
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Dispatcher {
    config: SchedulerConfig,
    retry: RetryPolicy,
    executor: Arc<Executor>,
    telemetry: Arc<TelemetryCollector>,
    results: Arc<ResultStore>,

    queue: TaskQueue,
    /// Failed tasks waiting for their retry timer
    backoff: HashMap<TaskId, Task>,
    running: HashMap<TaskId, Running>,
    failures: HashMap<TaskId, Vec<FailureRecord>>,
    /// Agents handed a task whose completion has not arrived yet
    busy: HashSet<AgentId>,
    /// Running tasks the caller asked to cancel
    cancelled: HashSet<TaskId>,
    breakers: HashMap<Capability, CircuitBreaker>,
    dead_letters: DeadLetterLog,

    queued: Arc<AtomicUsize>,
    self_tx: mpsc::WeakUnboundedSender<SchedulerCommand>,
    accepting: bool,
    stopping: bool,
    drain_deadline: Option<tokio::time::Instant>,
    shutdown_replies: Vec<oneshot::Sender<()>>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerCommand>) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue_capacity = self.config.queue_capacity,
            max_attempts = self.retry.max_attempts,
            "scheduler started"
        );

        loop {
            let drain_at = self
                .drain_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tick.tick() => self.on_tick(),
                _ = tokio::time::sleep_until(drain_at), if self.drain_deadline.is_some() => {
                    debug!("drain period elapsed");
                }
            }

            if let Some(deadline) = self.drain_deadline {
                let drained = self.queue.is_empty() && self.backoff.is_empty() && self.running.is_empty();
                if drained || tokio::time::Instant::now() >= deadline {
                    self.finish_shutdown(&mut rx).await;
                    break;
                }
            }
        }

        info!("scheduler stopped");
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Submit { task, reply } => {
                let outcome = self.submit(task);
                let _ = reply.send(outcome);
            }
            SchedulerCommand::Cancel { task_id, reply } => {
                let cancelled = self.cancel(task_id);
                let _ = reply.send(cancelled);
            }
            SchedulerCommand::Finished(completion) => self.on_finished(*completion),
            SchedulerCommand::RetryDue(task_id) => {
                if let Some(task) = self.backoff.remove(&task_id) {
                    debug!(task = %task_id, "retry due");
                    self.queue.push(task);
                    self.results.set(task_id, TaskStatus::Queued);
                    self.publish_depth();
                    self.dispatch();
                }
            }
            SchedulerCommand::Wake => self.dispatch(),
            SchedulerCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            SchedulerCommand::DeadLetters { reply } => {
                let _ = reply.send(self.dead_letters.records());
            }
            SchedulerCommand::Shutdown { reply } => {
                self.shutdown_replies.push(reply);
                if self.drain_deadline.is_none() {
                    self.accepting = false;
                    self.drain_deadline =
                        Some(tokio::time::Instant::now() + self.config.drain_timeout());
                    info!(
                        queued = self.queue.len(),
                        backing_off = self.backoff.len(),
                        running = self.running.len(),
                        "scheduler draining"
                    );
                }
            }
        }
    }

    fn submit(&mut self, task: Task) -> std::result::Result<TaskId, RejectionReason> {
        let outcome = self.admit(&task);
        if let Err(reason) = &outcome {
            debug!(task = %task.id(), reason = %reason, "submission rejected");
            metrics::counter!("fabric_tasks_rejected_total", "reason" => rejection_label(reason))
                .increment(1);
            return Err(reason.clone());
        }

        let id = task.id();
        debug!(
            task = %id,
            capability = %task.capability(),
            priority = %task.priority(),
            "task queued"
        );
        self.results.register(id);
        self.queue.push(task);
        metrics::counter!("fabric_tasks_submitted_total").increment(1);
        self.publish_depth();
        self.dispatch();
        Ok(id)
    }

    fn admit(&self, task: &Task) -> std::result::Result<(), RejectionReason> {
        if !self.accepting {
            return Err(RejectionReason::ShuttingDown);
        }
        task.validate()?;
        if let Admission::Rejected(reason) = self
            .executor
            .quota()
            .admit_configured(task.resource_quota())
        {
            return Err(RejectionReason::QuotaExceeded(reason));
        }
        if self.queue.len() + self.backoff.len() >= self.config.queue_capacity {
            return Err(RejectionReason::QueueFull {
                capacity: self.config.queue_capacity,
            });
        }
        Ok(())
    }

    fn cancel(&mut self, task_id: TaskId) -> bool {
        let removed = self
            .queue
            .remove(task_id)
            .or_else(|| self.backoff.remove(&task_id));
        if removed.is_some() {
            self.failures.remove(&task_id);
            self.results.set(
                task_id,
                TaskStatus::Cancelled {
                    result: ExecutionResult::failed(task_id, None, "cancelled before dispatch"),
                },
            );
            self.publish_depth();
            info!(task = %task_id, "task cancelled");
            return true;
        }

        let Some(running) = self.running.get(&task_id) else {
            return false;
        };
        let agent_id = running.agent_id;
        self.cancelled.insert(task_id);
        info!(task = %task_id, agent = %agent_id, "cancelling running task");

        match self.executor.cancel_task(agent_id, task_id) {
            Ok(true) => {}
            Ok(false) => {
                // Dispatched but not yet inside the sandbox
                let executor = self.executor.clone();
                tokio::spawn(async move {
                    for _ in 0..CANCEL_RETRIES {
                        tokio::time::sleep(CANCEL_RETRY_DELAY).await;
                        if !matches!(executor.cancel_task(agent_id, task_id), Ok(false)) {
                            break;
                        }
                    }
                });
            }
            Err(e) => warn!(task = %task_id, error = %e, "cancel could not reach agent"),
        }
        true
    }

    /// Start every task that can start now
    fn dispatch(&mut self) {
        if self.stopping {
            return;
        }

        let now = Instant::now();
        let now_utc = Utc::now();
        let mut idle: HashMap<Capability, Vec<(AgentId, ResourceQuota)>> = HashMap::new();

        loop {
            let mut chosen: Option<AgentId> = None;
            let picked = {
                let Dispatcher {
                    queue,
                    breakers,
                    busy,
                    executor,
                    config,
                    ..
                } = &mut *self;

                queue.pop_first_matching(|task| {
                    if task.is_expired(now_utc) {
                        return false;
                    }
                    let capability = task.capability();
                    let breaker = breakers
                        .entry(capability.clone())
                        .or_insert_with(|| CircuitBreaker::new(&config.circuit_breaker));
                    if !breaker.allow(now) {
                        return false;
                    }

                    let candidates = idle
                        .entry(capability.clone())
                        .or_insert_with(|| executor.idle_agents_for(capability));
                    let ledger = executor.quota();
                    let agent = candidates.iter().find_map(|(agent, quota)| {
                        (!busy.contains(agent)
                            && quota.covers(task.resource_quota())
                            && ledger.charge(*agent, task.resource_quota()))
                        .then_some(*agent)
                    });
                    chosen = agent;
                    agent.is_some()
                })
            };

            let (Some((task, seq)), Some(agent_id)) = (picked, chosen) else {
                break;
            };
            self.start(task, seq, agent_id);
        }

        self.publish_depth();
    }

    fn start(&mut self, task: Task, seq: u64, agent_id: AgentId) {
        let task_id = task.id();
        let capability = task.capability().clone();
        let attempt = self.failures.get(&task_id).map(Vec::len).unwrap_or(0) as u32 + 1;

        if let Some(breaker) = self.breakers.get_mut(&capability) {
            breaker.on_dispatch();
        }
        self.busy.insert(agent_id);
        self.running.insert(
            task_id,
            Running {
                agent_id,
                capability,
                charged: task.resource_quota().clone(),
                seq,
            },
        );
        self.results
            .set(task_id, TaskStatus::Running { agent_id, attempt });
        debug!(task = %task_id, agent = %agent_id, attempt, "task dispatched");

        let executor = self.executor.clone();
        let tx = self.self_tx.upgrade();
        tokio::spawn(async move {
            let outcome = executor.run(agent_id, task).await;
            if let Some(tx) = tx {
                let _ = tx.send(SchedulerCommand::Finished(Box::new(Completion {
                    agent_id,
                    outcome,
                })));
            }
        });
    }

    fn on_finished(&mut self, completion: Completion) {
        let Completion { agent_id, outcome } = completion;
        self.busy.remove(&agent_id);

        match outcome {
            Err(DispatchError { task, error }) => self.on_refused(agent_id, task, error),
            Ok(execution) => self.on_executed(agent_id, execution),
        }

        self.dispatch();
    }

    /// The executor refused the task before running it
    fn on_refused(&mut self, agent_id: AgentId, task: Task, error: EngineError) {
        let task_id = task.id();
        let Some(running) = self.running.remove(&task_id) else {
            return;
        };
        self.executor.quota().release(agent_id, &running.charged);
        if let Some(breaker) = self.breakers.get_mut(&running.capability) {
            breaker.abandon_probe();
        }

        if self.cancelled.remove(&task_id) || self.stopping {
            let reason = if self.stopping {
                SHUTDOWN_CANCELLED
            } else {
                "cancelled before dispatch"
            };
            self.failures.remove(&task_id);
            self.results.set(
                task_id,
                TaskStatus::Cancelled {
                    result: ExecutionResult::failed(task_id, None, reason),
                },
            );
            return;
        }

        debug!(task = %task_id, agent = %agent_id, error = %error, "dispatch refused, requeueing");
        self.queue.requeue(task, running.seq);
        self.results.set(task_id, TaskStatus::Queued);
    }

    fn on_executed(&mut self, agent_id: AgentId, execution: Execution) {
        let Execution { task, result, .. } = execution;
        let task_id = task.id();
        let Some(running) = self.running.remove(&task_id) else {
            warn!(task = %task_id, "completion for a task that was not running");
            return;
        };
        self.executor.quota().release(agent_id, &running.charged);
        self.telemetry.record(&result);

        let user_cancelled = self.cancelled.remove(&task_id);
        let now = Instant::now();
        if let Some(breaker) = self.breakers.get_mut(&running.capability) {
            if user_cancelled && !result.success {
                breaker.abandon_probe();
            } else {
                let was_open = breaker.status() == CircuitStatus::Open;
                breaker.record(result.success, now);
                if !was_open {
                    if let Some(at) = breaker.reopens_at() {
                        warn!(
                            capability = %running.capability,
                            failure_rate = breaker.failure_rate(),
                            "circuit opened"
                        );
                        metrics::counter!("fabric_circuit_opened_total").increment(1);
                        self.wake_at(at);
                    }
                }
            }
        }

        if result.success {
            self.failures.remove(&task_id);
            debug!(task = %task_id, agent = %agent_id, ms = result.execution_time_ms, "task completed");
            metrics::counter!("fabric_tasks_completed_total").increment(1);
            self.results.set(task_id, TaskStatus::Completed { result });
            return;
        }

        if user_cancelled || self.stopping {
            self.failures.remove(&task_id);
            self.results.set(task_id, TaskStatus::Cancelled { result });
            return;
        }

        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());
        let failures = self.failures.entry(task_id).or_default();
        failures.push(FailureRecord {
            attempt: failures.len() as u32 + 1,
            agent_id: Some(agent_id),
            error: error.clone(),
            at: result.completed_at,
        });
        let failed = failures.len() as u32;

        if self.retry.should_retry(failed) {
            let delay = self.retry.delay_for(failed - 1);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            warn!(
                task = %task_id,
                attempt = failed,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "task failed, retrying"
            );
            metrics::counter!("fabric_task_retries_total").increment(1);
            self.backoff.insert(task_id, task);
            self.results.set(
                task_id,
                TaskStatus::RetryPending {
                    attempt: failed,
                    retry_at,
                },
            );
            self.schedule_retry(task_id, delay);
            return;
        }

        let mut result = result;
        result.error = Some(format!("dead-lettered after {} attempts: {}", failed, error));
        self.dead_letter(task, DeadLetterReason::RetriesExhausted, result);
    }

    fn dead_letter(&mut self, task: Task, reason: DeadLetterReason, result: ExecutionResult) {
        let task_id = task.id();
        let failures = self.failures.remove(&task_id).unwrap_or_default();
        warn!(
            task = %task_id,
            capability = %task.capability(),
            attempts = failures.len(),
            reason = ?reason,
            "task dead-lettered"
        );
        metrics::counter!("fabric_dead_letters_total").increment(1);

        self.dead_letters.push(DeadLetter {
            task,
            failures,
            reason,
            at: Utc::now(),
        });
        self.results
            .set(task_id, TaskStatus::DeadLettered { result });
    }

    fn on_tick(&mut self) {
        for task in self.queue.remove_expired(Utc::now()) {
            let result = ExecutionResult::failed(task.id(), None, "deadline passed while queued");
            self.dead_letter(task, DeadLetterReason::Expired, result);
        }
        self.dispatch();
    }

    fn schedule_retry(&self, task_id: TaskId, delay: Duration) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SchedulerCommand::RetryDue(task_id));
        });
    }

    fn wake_at(&self, at: Instant) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
            let _ = tx.send(SchedulerCommand::Wake);
        });
    }

    async fn finish_shutdown(&mut self, rx: &mut mpsc::UnboundedReceiver<SchedulerCommand>) {
        self.stopping = true;

        let leftovers: Vec<Task> = self
            .queue
            .drain()
            .into_iter()
            .chain(self.backoff.drain().map(|(_, task)| task))
            .collect();
        for task in &leftovers {
            self.failures.remove(&task.id());
            self.results.set(
                task.id(),
                TaskStatus::Cancelled {
                    result: ExecutionResult::failed(task.id(), None, SHUTDOWN_CANCELLED),
                },
            );
        }
        self.publish_depth();

        for (task_id, running) in &self.running {
            self.cancelled.insert(*task_id);
            let _ = self.executor.cancel(running.agent_id);
        }

        info!(
            cancelled_queued = leftovers.len(),
            cancelled_running = self.running.len(),
            "scheduler shutting down agents"
        );
        self.executor.shutdown_all().await;

        let grace = self.executor.config().shutdown_grace();
        while !self.running.is_empty() {
            match tokio::time::timeout(grace, rx.recv()).await {
                Ok(Some(SchedulerCommand::Finished(completion))) => self.on_finished(*completion),
                Ok(Some(command)) => self.refuse(command),
                _ => break,
            }
        }

        for (task_id, running) in self.running.drain() {
            self.executor.quota().release(running.agent_id, &running.charged);
            self.results.set(
                task_id,
                TaskStatus::Cancelled {
                    result: ExecutionResult::failed(task_id, Some(running.agent_id), SHUTDOWN_CANCELLED),
                },
            );
        }

        rx.close();
        while let Ok(command) = rx.try_recv() {
            self.refuse(command);
        }
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
    }

    /// Answer a command that arrived after shutdown began
    fn refuse(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Submit { reply, .. } => {
                let _ = reply.send(Err(RejectionReason::ShuttingDown));
            }
            SchedulerCommand::Cancel { reply, .. } => {
                let _ = reply.send(false);
            }
            SchedulerCommand::Finished(completion) => self.on_finished(*completion),
            SchedulerCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            SchedulerCommand::DeadLetters { reply } => {
                let _ = reply.send(self.dead_letters.records());
            }
            SchedulerCommand::Shutdown { reply } => self.shutdown_replies.push(reply),
            SchedulerCommand::RetryDue(_) | SchedulerCommand::Wake => {}
        }
    }

    fn stats(&self) -> SchedulerStats {
        let mut open_circuits: Vec<Capability> = self
            .breakers
            .iter()
            .filter(|(_, breaker)| breaker.status() != CircuitStatus::Closed)
            .map(|(capability, _)| capability.clone())
            .collect();
        open_circuits.sort();

        SchedulerStats {
            queued: self.queue.len(),
            queued_by_priority: self.queue.depth_by_priority().into_iter().collect(),
            backing_off: self.backoff.len(),
            running: self.running.len(),
            dead_letters: self.dead_letters.len(),
            dead_letters_evicted: self.dead_letters.evicted(),
            open_circuits,
            accepting: self.accepting,
        }
    }

    fn publish_depth(&self) {
        let depth = self.queue.len() + self.backoff.len();
        self.queued.store(depth, Ordering::Relaxed);
        metrics::gauge!("fabric_queue_depth").set(depth as f64);
        metrics::gauge!("fabric_tasks_running").set(self.running.len() as f64);
    }
}

fn rejection_label(reason: &RejectionReason) -> &'static str {
    match reason {
        RejectionReason::QuotaExceeded(_) => "quota_exceeded",
        RejectionReason::QueueFull { .. } => "queue_full",
        RejectionReason::InvalidPriority(_) => "invalid_priority",
        RejectionReason::InvalidQuota(_) => "invalid_quota",
        RejectionReason::InvalidDeadline(_) => "invalid_deadline",
        RejectionReason::ShuttingDown => "shutting_down",
    }
}
