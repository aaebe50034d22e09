//! Branch instances: parallel execution lanes spawned by a fork
//!
//! A fork node activates one BranchInstance per branch. Each instance
//! carries its own cursor and advances independently until it reaches
//! the join node (or is explicitly completed by a `branch_completed`
//! event). The run aggregate owns all branch state; the fork/join
//! coordinator is the only writer.

use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Branch Identifier ────────────────────────────────────────────────

/// Stable identifier of a branch within one fork/join region.
///
/// Static forks declare branch ids in their config. Dynamic forks
/// derive them from the run context's selected sub-processes, one
/// `sp_<id>` branch per selection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The branch id of a dynamically selected sub-process
    pub fn for_sub_process(sub_process_id: &str) -> Self {
        Self(format!("sp_{}", sub_process_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Branch Instance ──────────────────────────────────────────────────

/// Runtime state of one activated branch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchInstance {
    /// Which branch this is
    pub branch: BranchId,
    /// The fork node that activated it
    pub fork_node: NodeId,
    /// The branch's own cursor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeId>,
    /// Current status
    pub status: BranchStatus,
    /// Context values captured at activation time
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context_snapshot: HashMap<String, String>,
    /// When the branch was activated
    pub started_at: DateTime<Utc>,
    /// When the branch reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BranchInstance {
    /// Create a running branch with its cursor at the entry node
    pub fn new(branch: BranchId, fork_node: NodeId, entry: NodeId) -> Self {
        Self {
            branch,
            fork_node,
            current_node: Some(entry),
            status: BranchStatus::Running,
            context_snapshot: HashMap::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_context_snapshot(mut self, snapshot: HashMap<String, String>) -> Self {
        self.context_snapshot = snapshot;
        self
    }

    /// Mark the branch completed
    pub fn complete(&mut self) {
        self.status = BranchStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.current_node = None;
    }

    /// Mark the branch failed
    pub fn fail(&mut self) {
        self.status = BranchStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the branch cancelled
    pub fn cancel(&mut self) {
        self.status = BranchStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Park the branch while a validation inside it awaits a decision
    pub fn wait(&mut self) {
        self.status = BranchStatus::Waiting;
    }

    /// Resume a waiting or paused branch
    pub fn resume(&mut self) {
        self.status = BranchStatus::Running;
    }

    /// Whether the branch can still make progress
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Seconds since activation
    pub fn age_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
    }
}

// ── Branch Status ────────────────────────────────────────────────────

/// Status of a branch instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    /// Advancing through branch nodes
    #[default]
    Running,
    /// Reached the join (or explicitly completed)
    Completed,
    /// Aborted by a failure or a join timeout
    Failed,
    /// Blocked on a validation decision
    Waiting,
    /// Suspended with the run
    Paused,
    /// Closed by run cancellation
    Cancelled,
}

impl BranchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_process_branch_id() {
        assert_eq!(BranchId::for_sub_process("sp1").as_str(), "sp_sp1");
        assert_eq!(BranchId::for_sub_process("audit").to_string(), "sp_audit");
    }

    #[test]
    fn test_branch_lifecycle() {
        let mut b = BranchInstance::new(
            BranchId::new("x"),
            NodeId::new("fork"),
            NodeId::new("step-1"),
        );
        assert_eq!(b.status, BranchStatus::Running);
        assert!(b.is_open());
        assert_eq!(b.current_node, Some(NodeId::new("step-1")));

        b.wait();
        assert_eq!(b.status, BranchStatus::Waiting);
        assert!(b.is_open());

        b.resume();
        b.complete();
        assert_eq!(b.status, BranchStatus::Completed);
        assert!(!b.is_open());
        assert!(b.completed_at.is_some());
        assert!(b.current_node.is_none());
    }

    #[test]
    fn test_cancelled_branch_is_terminal() {
        let mut b = BranchInstance::new(
            BranchId::new("y"),
            NodeId::new("fork"),
            NodeId::new("step-1"),
        );
        b.cancel();
        assert!(b.status.is_terminal());
    }
}
