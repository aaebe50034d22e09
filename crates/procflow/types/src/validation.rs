//! Validation gates: approval steps in a workflow
//!
//! A validation node pauses the run until an approver decides. Auto
//! mode creates its instance when the cursor arrives; manual mode
//! creates nothing until an eligible actor triggers it — the pending
//! state before that is a computed view, never a stored row.

use crate::{BranchId, NodeId, RunId, UserId, WorkflowId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Validation Instance Identifier ───────────────────────────────────

/// Unique identifier for a validation instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationInstanceId(pub String);

impl ValidationInstanceId {
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

impl std::fmt::Display for ValidationInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Configuration ────────────────────────────────────────────────────

/// Configuration of a validation node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// How the approver is resolved
    pub approver: ApproverSpec,
    /// Auto (on arrival, prerequisites permitting) or manual trigger
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    /// Who may trigger a manual validation
    #[serde(default)]
    pub trigger_allowed_by: TriggerAllowedBy,
    /// The allowed user when `trigger_allowed_by` is `SpecificUser`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specific_trigger_user: Option<UserId>,
    /// Conditions that must hold before an auto validation triggers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<Prerequisite>,
    /// Hours from trigger to the decision due date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_hours: Option<i64>,
    /// Hours between overdue reminders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminder_interval_hours: Option<i64>,
    /// Trigger the next validation immediately on approval
    #[serde(default)]
    pub auto_trigger_next: bool,
    /// The validation node chained by `auto_trigger_next`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_validation_node: Option<NodeId>,
}

impl ValidationConfig {
    pub fn new(approver: ApproverSpec) -> Self {
        Self {
            approver,
            trigger_mode: TriggerMode::default(),
            trigger_allowed_by: TriggerAllowedBy::default(),
            specific_trigger_user: None,
            prerequisites: Vec::new(),
            sla_hours: None,
            reminder_interval_hours: None,
            auto_trigger_next: false,
            next_validation_node: None,
        }
    }

    pub fn manual(mut self) -> Self {
        self.trigger_mode = TriggerMode::Manual;
        self
    }

    pub fn allowed_by(mut self, who: TriggerAllowedBy) -> Self {
        self.trigger_allowed_by = who;
        self
    }

    pub fn allowed_user(mut self, user: UserId) -> Self {
        self.trigger_allowed_by = TriggerAllowedBy::SpecificUser;
        self.specific_trigger_user = Some(user);
        self
    }

    pub fn with_prerequisite(mut self, prerequisite: Prerequisite) -> Self {
        self.prerequisites.push(prerequisite);
        self
    }

    pub fn with_sla(mut self, hours: i64) -> Self {
        self.sla_hours = Some(hours);
        self
    }

    pub fn with_reminders(mut self, interval_hours: i64) -> Self {
        self.reminder_interval_hours = Some(interval_hours);
        self
    }

    pub fn then_trigger(mut self, node: NodeId) -> Self {
        self.auto_trigger_next = true;
        self.next_validation_node = Some(node);
        self
    }
}

/// How the approver of a validation is resolved
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "approver", rename_all = "snake_case")]
pub enum ApproverSpec {
    /// A fixed user
    User { id: UserId },
    /// The requester's manager, one hop up
    RequesterManager,
    /// The assignee's manager, one hop up
    TargetManager,
    /// Resolved by the directory from a role name
    Role { name: String },
    /// Resolved by the directory from a group name
    Group { name: String },
    /// Resolved by the directory from a department name
    Department { name: String },
}

/// Whether a validation triggers on arrival or on request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Auto,
    Manual,
}

/// Who may trigger a manual validation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAllowedBy {
    /// The trigger task's assignee or creator
    #[default]
    TaskOwner,
    /// The run's requester
    Requester,
    /// Exactly the configured user
    SpecificUser,
}

/// A condition that must hold before an auto validation triggers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "prerequisite", rename_all = "snake_case")]
pub enum Prerequisite {
    /// The trigger task has reached `done`
    TaskCompleted,
    /// A previous validation node was approved
    PriorValidationApproved { node: NodeId },
    /// A context expression evaluates to true
    ConditionTrue { expression: String },
    /// Every nested prerequisite holds
    AllOf { all: Vec<Prerequisite> },
}

// ── Instance ─────────────────────────────────────────────────────────

/// Status of a validation instance; terminal except `Pending`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    /// SLA exhausted without a decision
    Expired,
    /// Closed without a decision, e.g. by run cancellation
    Skipped,
}

impl ValidationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The decision an approver hands back
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    Approved,
    Rejected,
}

/// A materialized validation awaiting (or past) its decision
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationInstance {
    /// Unique instance id
    pub id: ValidationInstanceId,
    /// The validation node this instance belongs to
    pub node: NodeId,
    /// Set when the validation sits inside a forked region
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchId>,
    /// Current status
    pub status: ValidationStatus,
    /// Resolved approver; `None` with `approver_unresolved` means
    /// the gap needs manual assignment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<UserId>,
    /// Resolution was attempted and found nobody
    #[serde(default)]
    pub approver_unresolved: bool,
    /// Whether the configured prerequisites held at last evaluation
    pub prerequisites_met: bool,
    /// When the validation was actually requested; `None` means
    /// created but not yet triggered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    /// Who requested it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<UserId>,
    /// Decision due date, from the SLA
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Overdue reminders sent so far
    #[serde(default)]
    pub reminder_count: u32,
    /// When the last reminder went out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reminder_at: Option<DateTime<Utc>>,
    /// When the decision was made
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Who decided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<UserId>,
    /// Approver's comment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
}

impl ValidationInstance {
    /// Create an untriggered pending instance for a node
    pub fn new(node: NodeId) -> Self {
        Self {
            id: ValidationInstanceId::generate(),
            node,
            branch: None,
            status: ValidationStatus::Pending,
            approver: None,
            approver_unresolved: false,
            prerequisites_met: false,
            triggered_at: None,
            triggered_by: None,
            due_at: None,
            reminder_count: 0,
            last_reminder_at: None,
            decided_at: None,
            decided_by: None,
            comment: None,
            created_at: Utc::now(),
        }
    }

    pub fn in_branch(mut self, branch: BranchId) -> Self {
        self.branch = Some(branch);
        self
    }

    /// Record the resolved approver, or the resolution gap
    pub fn set_approver(&mut self, approver: Option<UserId>) {
        self.approver_unresolved = approver.is_none();
        self.approver = approver;
    }

    /// Stamp the trigger: the validation is now actually requested
    pub fn trigger(&mut self, by: Option<UserId>, sla_hours: Option<i64>) {
        let now = Utc::now();
        self.triggered_at = Some(now);
        self.triggered_by = by;
        self.prerequisites_met = true;
        self.due_at = sla_hours.map(|h| now + Duration::hours(h));
    }

    /// Whether this instance has been triggered
    pub fn is_triggered(&self) -> bool {
        self.triggered_at.is_some()
    }

    /// Whether a decision is still possible
    pub fn is_open(&self) -> bool {
        self.status == ValidationStatus::Pending
    }

    /// Record a decision
    pub fn decide(&mut self, outcome: ValidationOutcome, by: UserId, comment: Option<String>) {
        self.status = match outcome {
            ValidationOutcome::Approved => ValidationStatus::Approved,
            ValidationOutcome::Rejected => ValidationStatus::Rejected,
        };
        self.decided_at = Some(Utc::now());
        self.decided_by = Some(by);
        self.comment = comment;
    }

    /// Close an overdue instance without a decision
    pub fn expire(&mut self) {
        self.status = ValidationStatus::Expired;
        self.decided_at = Some(Utc::now());
    }

    /// Close the instance because the run was cancelled
    pub fn skip(&mut self) {
        self.status = ValidationStatus::Skipped;
        self.decided_at = Some(Utc::now());
    }

    /// Record an overdue reminder
    pub fn record_reminder(&mut self, at: DateTime<Utc>) {
        self.reminder_count += 1;
        self.last_reminder_at = Some(at);
    }
}

// ── Computed views ───────────────────────────────────────────────────

/// A manual validation the cursor has reached but nobody has triggered.
///
/// This is a view computed from the run's cursor position; no instance
/// row exists until the trigger actually happens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingManualValidation {
    /// The run whose cursor parks on the validation node
    pub run: RunId,
    /// The validation node
    pub node: NodeId,
    /// The node's label, for display
    pub label: String,
    /// The owning workflow
    pub workflow: WorkflowId,
    /// Who may trigger it
    pub trigger_allowed_by: TriggerAllowedBy,
    /// How the approver will be resolved once triggered
    pub approver: ApproverSpec,
}

/// Result of a manual-trigger eligibility check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanTrigger {
    pub allowed: bool,
    /// Denial reason; always present when not allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CanTrigger {
    pub fn yes() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn no(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untriggered_instance_is_queryable_pre_state() {
        let inst = ValidationInstance::new(NodeId::new("approve"));
        assert!(!inst.is_triggered());
        assert!(inst.is_open());
        assert!(inst.triggered_at.is_none());
        assert!(inst.due_at.is_none());
    }

    #[test]
    fn test_trigger_stamps_due_date_from_sla() {
        let mut inst = ValidationInstance::new(NodeId::new("approve"));
        inst.trigger(Some(UserId::new("u1")), Some(48));
        assert!(inst.is_triggered());
        assert!(inst.prerequisites_met);
        let due = inst.due_at.expect("due date");
        let hours = (due - inst.triggered_at.unwrap()).num_hours();
        assert_eq!(hours, 48);
    }

    #[test]
    fn test_decision_is_terminal() {
        let mut inst = ValidationInstance::new(NodeId::new("approve"));
        inst.trigger(None, None);
        inst.decide(
            ValidationOutcome::Rejected,
            UserId::new("boss"),
            Some("needs rework".into()),
        );
        assert_eq!(inst.status, ValidationStatus::Rejected);
        assert!(!inst.is_open());
        assert_eq!(inst.comment.as_deref(), Some("needs rework"));
    }

    #[test]
    fn test_unresolved_approver_is_flagged_not_fatal() {
        let mut inst = ValidationInstance::new(NodeId::new("approve"));
        inst.set_approver(None);
        assert!(inst.approver_unresolved);
        assert!(inst.approver.is_none());

        inst.set_approver(Some(UserId::new("mgr")));
        assert!(!inst.approver_unresolved);
    }

    #[test]
    fn test_reminder_bookkeeping() {
        let mut inst = ValidationInstance::new(NodeId::new("approve"));
        let now = Utc::now();
        inst.record_reminder(now);
        inst.record_reminder(now);
        assert_eq!(inst.reminder_count, 2);
        assert_eq!(inst.last_reminder_at, Some(now));
    }

    #[test]
    fn test_approver_spec_serde_shape() {
        let json = serde_json::to_value(ApproverSpec::RequesterManager).unwrap();
        assert_eq!(json["approver"], "requester_manager");
        let json = serde_json::to_value(ApproverSpec::Role {
            name: "finance".into(),
        })
        .unwrap();
        assert_eq!(json["approver"], "role");
        assert_eq!(json["name"], "finance");
    }
}
