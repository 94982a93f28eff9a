//! Task data model for the durable schedule queue.
//!
//! Tasks are the units of scheduled work the dispatch loop acts on: mostly
//! recurring check-ins against one agent's tmux window. Each task tracks its
//! target, schedule, retry budget, and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentRole;

/// Unique identifier for a scheduled task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The (project, agent, window) reference a task is dispatched against.
///
/// Within one target, dispatches are strictly serialized; across targets
/// there is no ordering guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskTarget {
    /// Project the agent belongs to.
    pub project_id: String,
    /// Role of the addressed agent.
    pub agent_role: AgentRole,
    /// Window index within the agent's tmux session.
    pub window: u32,
}

impl TaskTarget {
    pub fn new(project_id: &str, agent_role: AgentRole, window: u32) -> Self {
        Self {
            project_id: project_id.to_string(),
            agent_role,
            window,
        }
    }

    /// Key used for dedup checks and dispatch serialization locks.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.project_id, self.agent_role, self.window)
    }

    /// Tmux pane address for this target.
    pub fn pane(&self) -> String {
        format!(
            "{}:{}",
            self.agent_role.session_name(&self.project_id),
            self.window
        )
    }
}

impl std::fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Task status in its lifecycle.
///
/// `Completed` and `Disabled` are terminal; `Failed` is transient and is
/// followed by a reschedule or, once the retry budget is spent, `Disabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for its scheduled time.
    Pending,
    /// Picked up by the dispatch loop, send in flight.
    Dispatched,
    /// Done; nothing further will run.
    Completed,
    /// Last dispatch failed; a retry will be scheduled.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Retry budget exhausted or cancelled; no automatic retries.
    Disabled {
        /// Why the task was disabled.
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Column discriminant for the store.
    pub fn kind_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Disabled { .. } => "disabled",
        }
    }

    /// Detail text for the store (error or reason), if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            TaskStatus::Failed { error } => Some(error),
            TaskStatus::Disabled { reason } => Some(reason),
            _ => None,
        }
    }

    /// Rebuild a status from its store representation.
    pub fn from_db(kind: &str, detail: Option<String>) -> crate::Result<Self> {
        match kind {
            "pending" => Ok(TaskStatus::Pending),
            "dispatched" => Ok(TaskStatus::Dispatched),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed {
                error: detail.unwrap_or_default(),
            }),
            "disabled" => Ok(TaskStatus::Disabled {
                reason: detail.unwrap_or_default(),
            }),
            other => Err(crate::Error::Validation(format!(
                "Unknown task status: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Dispatched => write!(f, "dispatched"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Disabled { reason } => write!(f, "disabled: {}", reason),
        }
    }
}

/// A single task in the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// The (project, agent, window) the task dispatches against.
    pub target: TaskTarget,
    /// When the task becomes due.
    pub scheduled_at: DateTime<Utc>,
    /// Recurrence interval in seconds; `None` for one-shot tasks.
    pub interval_secs: Option<u64>,
    /// The check-in message sent to the agent on dispatch.
    pub note: String,
    /// How many times dispatch has failed so far.
    pub retry_count: u32,
    /// Retry budget; exceeding it disables the task.
    pub max_retries: u32,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(
        target: TaskTarget,
        scheduled_at: DateTime<Utc>,
        interval_secs: Option<u64>,
        note: &str,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            target,
            scheduled_at,
            interval_secs,
            note: note.to_string(),
            retry_count: 0,
            max_retries,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this task recurs after a successful dispatch.
    pub fn is_recurring(&self) -> bool {
        self.interval_secs.is_some()
    }

    /// Recurrence interval as a chrono duration, if recurring.
    pub fn interval(&self) -> Option<chrono::Duration> {
        self.interval_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }

    /// Whether the task is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at <= now
    }

    /// Whether the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Disabled { .. }
        )
    }

    /// Mark the task as picked up by the dispatch loop.
    pub fn dispatch(&mut self) {
        self.status = TaskStatus::Dispatched;
        self.updated_at = Utc::now();
    }

    /// Mark the task completed.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.updated_at = Utc::now();
    }

    /// Record a dispatch failure without deciding the retry yet.
    pub fn record_failure(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.retry_count += 1;
        self.updated_at = Utc::now();
    }

    /// Reschedule after a failure (or, for recurring tasks, after success).
    pub fn reschedule(&mut self, at: DateTime<Utc>) {
        self.scheduled_at = at;
        self.status = TaskStatus::Pending;
        self.updated_at = Utc::now();
    }

    /// Disable the task; no further automatic dispatches.
    pub fn disable(&mut self, reason: &str) {
        self.status = TaskStatus::Disabled {
            reason: reason.to_string(),
        };
        self.updated_at = Utc::now();
    }

    /// Whether the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }
}
