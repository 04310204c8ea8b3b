// packages/engine/src/model/task.rs
//! Tasks: the unit of work the fabric schedules onto agents
//!
//! A task is created by a submitter, owned by the scheduler while queued,
//! moved into exactly one agent for execution and handed back alongside its
//! outcome. Priority and creation time never change after construction.

use crate::model::ids::{Capability, TaskId};
use crate::runtime::quota::ResourceQuota;
use crate::utils::errors::RejectionReason;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Scheduling priority, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Numeric weight, higher is more urgent
    pub fn weight(&self) -> u8 {
        match self {
            Priority::Critical => 100,
            Priority::High => 75,
            Priority::Normal => 50,
            Priority::Low => 25,
            Priority::Background => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight().cmp(&other.weight())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = RejectionReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            _ => Err(RejectionReason::InvalidPriority(s.to_string())),
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = RejectionReason;

    fn try_from(weight: u8) -> Result<Self, Self::Error> {
        Priority::ALL
            .into_iter()
            .find(|p| p.weight() == weight)
            .ok_or_else(|| RejectionReason::InvalidPriority(weight.to_string()))
    }
}

/// A unit of work
#[derive(Debug, Serialize)]
pub struct Task {
    id: TaskId,
    priority: Priority,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    resource_quota: ResourceQuota,
    submitted_by: String,
    capability: Capability,
    metadata: HashMap<String, String>,
}

impl Task {
    /// Create a normal-priority task with the standard quota and no deadline
    pub fn new(capability: impl Into<Capability>, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            priority: Priority::Normal,
            payload,
            created_at: Utc::now(),
            deadline: None,
            resource_quota: ResourceQuota::standard(),
            submitted_by: "local".to_string(),
            capability: capability.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn builder(capability: impl Into<Capability>) -> TaskBuilder {
        TaskBuilder::new(capability)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn resource_quota(&self) -> &ResourceQuota {
        &self.resource_quota
    }

    pub fn submitted_by(&self) -> &str {
        &self.submitted_by
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Check the creation-time invariants
    pub fn validate(&self) -> Result<(), RejectionReason> {
        self.resource_quota
            .validate()
            .map_err(RejectionReason::InvalidQuota)?;

        if let Some(deadline) = self.deadline {
            if deadline <= self.created_at {
                return Err(RejectionReason::InvalidDeadline(format!(
                    "deadline {} is not after creation time {}",
                    deadline.to_rfc3339(),
                    self.created_at.to_rfc3339()
                )));
            }
        }

        Ok(())
    }

    /// Time left before the deadline, `None` when the task has no deadline
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|deadline| deadline <= now).unwrap_or(false)
    }
}

/// Builder for tasks with non-default settings
#[derive(Debug)]
pub struct TaskBuilder {
    task: Task,
    /// Set when a relative deadline could not be represented
    deadline_error: Option<String>,
}

impl TaskBuilder {
    fn new(capability: impl Into<Capability>) -> Self {
        Self {
            task: Task::new(capability, serde_json::Value::Null),
            deadline_error: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.task.deadline = Some(deadline);
        self.deadline_error = None;
        self
    }

    /// Deadline relative to the task's creation time
    ///
    /// A duration past the representable range makes [`build`](Self::build)
    /// fail with `InvalidDeadline`.
    pub fn deadline_in(mut self, within: Duration) -> Self {
        let deadline = ChronoDuration::from_std(within)
            .ok()
            .and_then(|delta| self.task.created_at.checked_add_signed(delta));
        match deadline {
            Some(deadline) => {
                self.task.deadline = Some(deadline);
                self.deadline_error = None;
            }
            None => {
                self.task.deadline = None;
                self.deadline_error = Some(format!("deadline {:?} from now is out of range", within));
            }
        }
        self
    }

    pub fn resource_quota(mut self, quota: ResourceQuota) -> Self {
        self.task.resource_quota = quota;
        self
    }

    pub fn submitted_by(mut self, submitter: impl Into<String>) -> Self {
        self.task.submitted_by = submitter.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.task.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Task, RejectionReason> {
        if let Some(reason) = self.deadline_error {
            return Err(RejectionReason::InvalidDeadline(reason));
        }
        self.task.validate()?;
        Ok(self.task)
    }
}

/// Priority as it arrives from external producers
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PriorityValue {
    Name(String),
    Weight(u8),
}

impl TryFrom<PriorityValue> for Priority {
    type Error = RejectionReason;

    fn try_from(value: PriorityValue) -> Result<Self, Self::Error> {
        match value {
            PriorityValue::Name(name) => name.parse(),
            PriorityValue::Weight(weight) => Priority::try_from(weight),
        }
    }
}

/// Wire form of a task submission
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    pub capability: String,

    #[serde(default)]
    pub priority: Option<PriorityValue>,

    #[serde(default)]
    pub payload: serde_json::Value,

    /// Absolute deadline
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,

    /// Deadline relative to submission, in milliseconds
    #[serde(default)]
    pub deadline_in_ms: Option<u64>,

    #[serde(default)]
    pub resource_quota: Option<ResourceQuota>,

    #[serde(default)]
    pub submitted_by: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TryFrom<TaskRequest> for Task {
    type Error = RejectionReason;

    fn try_from(request: TaskRequest) -> Result<Self, Self::Error> {
        let priority = match request.priority {
            Some(value) => Priority::try_from(value)?,
            None => Priority::Normal,
        };

        let mut builder = Task::builder(request.capability)
            .priority(priority)
            .payload(request.payload);

        if let Some(quota) = request.resource_quota {
            builder = builder.resource_quota(quota);
        }
        if let Some(submitter) = request.submitted_by {
            builder = builder.submitted_by(submitter);
        }
        builder = match (request.deadline, request.deadline_in_ms) {
            (Some(_), Some(_)) => {
                return Err(RejectionReason::InvalidDeadline(
                    "both deadline and deadline_in_ms given".to_string(),
                ))
            }
            (Some(at), None) => builder.deadline(at),
            (None, Some(ms)) => builder.deadline_in(Duration::from_millis(ms)),
            (None, None) => builder,
        };
        for (key, value) in request.metadata {
            builder = builder.metadata(key, value);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Background);

        let mut all = vec![Priority::Low, Priority::Critical, Priority::Background, Priority::Normal];
        all.sort();
        assert_eq!(all.first(), Some(&Priority::Background));
        assert_eq!(all.last(), Some(&Priority::Critical));
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(Priority::try_from(100u8).unwrap(), Priority::Critical);
        assert!(matches!(
            "urgent".parse::<Priority>(),
            Err(RejectionReason::InvalidPriority(_))
        ));
        assert!(Priority::try_from(42u8).is_err());
    }

    #[test]
    fn test_builder_rejects_zero_time_quota() {
        let quota = ResourceQuota {
            max_execution_time_secs: 0,
            ..ResourceQuota::standard()
        };
        let result = Task::builder("echo").resource_quota(quota).build();
        assert!(matches!(result, Err(RejectionReason::InvalidQuota(_))));
    }

    #[test]
    fn test_deadline_must_follow_creation() {
        let task = Task::new("echo", serde_json::Value::Null);
        let past = task.created_at() - ChronoDuration::seconds(1);
        let result = Task::builder("echo").deadline(past).build();
        assert!(matches!(result, Err(RejectionReason::InvalidDeadline(_))));

        let ok = Task::builder("echo")
            .deadline_in(Duration::from_secs(30))
            .build()
            .unwrap();
        assert!(ok.deadline().unwrap() > ok.created_at());
        assert!(!ok.is_expired(Utc::now()));
    }

    #[test]
    fn test_out_of_range_relative_deadline_is_rejected() {
        let result = Task::builder("echo").deadline_in(Duration::MAX).build();
        assert!(matches!(result, Err(RejectionReason::InvalidDeadline(_))));

        let request: TaskRequest = serde_json::from_value(serde_json::json!({
            "capability": "echo",
            "deadline_in_ms": u64::MAX
        }))
        .unwrap();
        assert!(matches!(
            Task::try_from(request),
            Err(RejectionReason::InvalidDeadline(_))
        ));
    }

    #[test]
    fn test_request_conversion() {
        let request: TaskRequest = serde_json::from_value(serde_json::json!({
            "capability": "summarizer",
            "priority": "critical",
            "payload": {"text": "hello"},
            "deadline_in_ms": 5000,
            "metadata": {"trace": "abc"}
        }))
        .unwrap();

        let task = Task::try_from(request).unwrap();
        assert_eq!(task.priority(), Priority::Critical);
        assert_eq!(task.capability().as_str(), "summarizer");
        assert_eq!(task.metadata().get("trace").map(String::as_str), Some("abc"));
        assert!(task.deadline().is_some());
    }

    #[test]
    fn test_request_with_bad_priority() {
        let request: TaskRequest = serde_json::from_value(serde_json::json!({
            "capability": "summarizer",
            "priority": 7
        }))
        .unwrap();
        assert_eq!(
            Task::try_from(request).unwrap_err(),
            RejectionReason::InvalidPriority("7".to_string())
        );
    }
}
