//! Runs: executing instances of a workflow template
//!
//! A run pins one template version, carries the cursor(s), the context
//! bag supplied by the trigger entity, all branch and validation state,
//! and an append-only execution log. Every piece of mutable state is
//! private; the only way to change it is through the methods here, so
//! the branch-set disjointness and log monotonicity invariants hold by
//! construction.

use crate::{
    BranchId, BranchInstance, BranchStatus, EngineError, EngineResult, NodeId, TaskId, UserId,
    ValidationInstance, ValidationInstanceId, WorkflowId, WorkflowTemplate,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ── Run Identifier ───────────────────────────────────────────────────

/// Unique identifier for a run
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
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

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Run Status ───────────────────────────────────────────────────────

/// Lifecycle status of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Advancing, or waiting for a task/fork event
    #[default]
    Running,
    /// Suspended while a validation awaits its decision
    Paused,
    /// Reached an end node
    Completed,
    /// Halted by a fatal error or a join timeout
    Failed,
    /// Stopped by an external cancel
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

// ── Run Context ──────────────────────────────────────────────────────

/// The key/value bag the trigger entity supplies at run start.
///
/// Structured fields are exposed under well-known keys alongside the
/// free-form bag, so condition expressions address both uniformly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunContext {
    /// Who asked for the work
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester: Option<UserId>,
    /// Who the work is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    /// Requesting department
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    /// Sub-processes chosen at start; drives dynamic forks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_sub_processes: Vec<String>,
    /// Free-form custom fields
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requester(mut self, requester: UserId) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn with_assignee(mut self, assignee: UserId) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn with_sub_processes(mut self, ids: Vec<String>) -> Self {
        self.selected_sub_processes = ids;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Uniform lookup: well-known keys first, then the free-form bag
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "requester" => self.requester.as_ref().map(|u| u.0.clone()),
            "assignee" => self.assignee.as_ref().map(|u| u.0.clone()),
            "department" => self.department.clone(),
            _ => self.fields.get(key).cloned(),
        }
    }

    /// Flatten to a plain map, used for branch context snapshots
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = self.fields.clone();
        if let Some(requester) = &self.requester {
            map.insert("requester".into(), requester.0.clone());
        }
        if let Some(assignee) = &self.assignee {
            map.insert("assignee".into(), assignee.0.clone());
        }
        if let Some(department) = &self.department {
            map.insert("department".into(), department.clone());
        }
        map
    }
}

// ── Execution Log ────────────────────────────────────────────────────

/// One entry of a run's append-only execution log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Strictly increasing per run
    pub sequence: u64,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// The node involved, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    /// Machine-readable action name, e.g. `node_entered`
    pub action: String,
    /// Human-readable detail
    pub details: String,
}

// ── Run ──────────────────────────────────────────────────────────────

/// One execution of a workflow template against a trigger task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    /// Unique run id
    pub id: RunId,
    /// The template this run executes
    pub workflow_id: WorkflowId,
    /// Pinned at start, never re-resolved
    pub workflow_version: u32,
    /// The task that entered the workflow
    pub trigger: TaskId,
    /// Lifecycle status
    status: RunStatus,
    /// Main cursor; `None` while a fork is active or the run is terminal
    current_node: Option<NodeId>,
    /// Context bag from the trigger entity
    pub context: RunContext,
    /// Branch ids currently executing
    active_branches: BTreeSet<BranchId>,
    /// Branch ids that finished since the last join
    completed_branches: BTreeSet<BranchId>,
    /// Every branch instance of the current fork region
    branches: BTreeMap<BranchId, BranchInstance>,
    /// All validation instances created for this run
    validations: Vec<ValidationInstance>,
    /// Append-only execution log
    log: Vec<LogEntry>,
    /// When the run started
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
    /// Set when the run reaches a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the run failed or was cancelled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Run {
    /// Start a run with its cursor at the template's start node
    pub fn start(template: &WorkflowTemplate, trigger: TaskId, context: RunContext) -> EngineResult<Self> {
        let start = template.start_node().ok_or(EngineError::NoStartNode)?;
        let mut run = Self {
            id: RunId::generate(),
            workflow_id: template.id.clone(),
            workflow_version: template.version,
            trigger,
            status: RunStatus::Running,
            current_node: Some(start.id.clone()),
            context,
            active_branches: BTreeSet::new(),
            completed_branches: BTreeSet::new(),
            branches: BTreeMap::new(),
            validations: Vec::new(),
            log: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            failure_reason: None,
        };
        run.record(Some(start.id.clone()), "run_started", "Run started");
        Ok(run)
    }

    // ── Status & cursor ──────────────────────────────────────────────

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_node(&self) -> Option<&NodeId> {
        self.current_node.as_ref()
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_terminal() {
            return Err(EngineError::AlreadyFinished(self.id.clone()));
        }
        Ok(())
    }

    /// Move the main cursor; logs one entry
    pub fn set_cursor(&mut self, node: NodeId, detail: &str) -> EngineResult<()> {
        self.ensure_open()?;
        self.current_node = Some(node.clone());
        self.record(Some(node), "node_entered", detail);
        Ok(())
    }

    /// Drop the main cursor while a fork region executes
    pub fn clear_cursor(&mut self) {
        self.current_node = None;
    }

    /// Suspend the run while a validation blocks progress
    pub fn pause(&mut self, reason: &str) -> EngineResult<()> {
        self.ensure_open()?;
        self.status = RunStatus::Paused;
        self.record(self.current_node.clone(), "run_paused", reason);
        Ok(())
    }

    /// Resume a paused run
    pub fn resume(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        self.status = RunStatus::Running;
        self.record(self.current_node.clone(), "run_resumed", "Run resumed");
        Ok(())
    }

    /// Finish the run at an end node
    pub fn complete(&mut self, end_node: NodeId) -> EngineResult<()> {
        self.ensure_open()?;
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.current_node = Some(end_node.clone());
        self.record(Some(end_node), "run_completed", "Run completed");
        Ok(())
    }

    /// Halt the run on a fatal error
    pub fn fail(&mut self, reason: impl Into<String>) -> EngineResult<()> {
        self.ensure_open()?;
        let reason = reason.into();
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.record(self.current_node.clone(), "run_failed", &reason);
        self.failure_reason = Some(reason);
        Ok(())
    }

    /// Stop the run on an external cancel
    pub fn cancel(&mut self, reason: impl Into<String>) -> EngineResult<()> {
        self.ensure_open()?;
        let reason = reason.into();
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.record(self.current_node.clone(), "run_cancelled", &reason);
        self.failure_reason = Some(reason);
        Ok(())
    }

    // ── Execution log ────────────────────────────────────────────────

    /// Append one log entry; the only way the log grows
    pub fn record(&mut self, node: Option<NodeId>, action: &str, details: impl Into<String>) {
        let entry = LogEntry {
            sequence: self.log.len() as u64,
            timestamp: Utc::now(),
            node,
            action: action.to_string(),
            details: details.into(),
        };
        self.log.push(entry);
        self.updated_at = Utc::now();
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn last_log(&self) -> Option<&LogEntry> {
        self.log.last()
    }

    // ── Branch bookkeeping ───────────────────────────────────────────

    /// Register a newly activated branch
    pub fn activate_branch(&mut self, instance: BranchInstance) {
        let id = instance.branch.clone();
        self.active_branches.insert(id.clone());
        self.branches.insert(id.clone(), instance);
        self.record(
            None,
            "branch_activated",
            format!("Branch '{}' activated", id),
        );
    }

    /// Move a branch from active to completed in one operation.
    ///
    /// This is the sole mutation path for the two sets, so they can
    /// never overlap.
    pub fn finish_branch(&mut self, branch: &BranchId) -> EngineResult<()> {
        if !self.active_branches.remove(branch) {
            return Err(EngineError::BranchNotFound(branch.clone()));
        }
        self.completed_branches.insert(branch.clone());
        if let Some(instance) = self.branches.get_mut(branch) {
            instance.complete();
        }
        self.record(
            None,
            "branch_completed",
            format!("Branch '{}' completed", branch),
        );
        Ok(())
    }

    /// Consume the fork region after a satisfied join
    pub fn clear_branch_state(&mut self) {
        self.active_branches.clear();
        self.completed_branches.clear();
        self.branches.clear();
    }

    pub fn branch(&self, id: &BranchId) -> Option<&BranchInstance> {
        self.branches.get(id)
    }

    pub fn branch_mut(&mut self, id: &BranchId) -> Option<&mut BranchInstance> {
        self.branches.get_mut(id)
    }

    pub fn branches(&self) -> impl Iterator<Item = &BranchInstance> {
        self.branches.values()
    }

    pub fn branches_mut(&mut self) -> impl Iterator<Item = &mut BranchInstance> {
        self.branches.values_mut()
    }

    pub fn active_branches(&self) -> &BTreeSet<BranchId> {
        &self.active_branches
    }

    pub fn completed_branches(&self) -> &BTreeSet<BranchId> {
        &self.completed_branches
    }

    pub fn branch_status(&self, id: &BranchId) -> Option<BranchStatus> {
        self.branches.get(id).map(|b| b.status)
    }

    /// Whether a fork region is currently executing
    pub fn has_active_fork(&self) -> bool {
        !self.active_branches.is_empty()
    }

    // ── Validation bookkeeping ───────────────────────────────────────

    pub fn add_validation(&mut self, instance: ValidationInstance) {
        self.record(
            Some(instance.node.clone()),
            "validation_created",
            format!("Validation instance {} created", instance.id.short()),
        );
        self.validations.push(instance);
    }

    pub fn validation(&self, id: &ValidationInstanceId) -> Option<&ValidationInstance> {
        self.validations.iter().find(|v| &v.id == id)
    }

    pub fn validation_mut(&mut self, id: &ValidationInstanceId) -> Option<&mut ValidationInstance> {
        self.validations.iter_mut().find(|v| &v.id == id)
    }

    /// The most recent instance for a node, if any
    pub fn validation_for_node(&self, node: &NodeId) -> Option<&ValidationInstance> {
        self.validations.iter().rev().find(|v| &v.node == node)
    }

    pub fn validation_for_node_mut(&mut self, node: &NodeId) -> Option<&mut ValidationInstance> {
        self.validations.iter_mut().rev().find(|v| &v.node == node)
    }

    pub fn validations(&self) -> &[ValidationInstance] {
        &self.validations
    }

    /// Instances still awaiting a decision
    pub fn open_validations(&self) -> impl Iterator<Item = &ValidationInstance> {
        self.validations.iter().filter(|v| v.is_open())
    }

    pub fn open_validations_mut(&mut self) -> impl Iterator<Item = &mut ValidationInstance> {
        self.validations.iter_mut().filter(|v| v.is_open())
    }
}
