//! Trigger entity view: the task a run executes against
//!
//! The engine never owns tasks. It reads a snapshot of the trigger
//! task through the `TaskStore` collaborator and writes status or
//! assignee changes back through the same boundary.

use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a task (the trigger entity)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a user (requester, assignee, approver)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Task Status ──────────────────────────────────────────────────────

/// Lifecycle status of the trigger task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Not yet started
    #[default]
    Todo,
    /// Being worked on
    InProgress,
    /// Work finished
    Done,
    /// Parked while a validation awaits its decision
    PendingValidation,
    /// Abandoned
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a final status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::PendingValidation => "pending-validation",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

// ── Trigger Task ─────────────────────────────────────────────────────

/// Snapshot of the task a run was started for
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerTask {
    /// Task identifier
    pub id: TaskId,
    /// Human-readable title
    pub title: String,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Who the task is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    /// Who created the task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
}

impl TriggerTask {
    pub fn new(id: TaskId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            status: TaskStatus::Todo,
            assignee: None,
            created_by: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_assignee(mut self, assignee: UserId) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn with_created_by(mut self, creator: UserId) -> Self {
        self.created_by = Some(creator);
        self
    }

    /// Check whether a user is the task's assignee
    pub fn is_assigned_to(&self, user: &UserId) -> bool {
        self.assignee.as_ref() == Some(user)
    }
}
