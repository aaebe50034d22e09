//! Template nodes: the typed steps of a workflow graph
//!
//! A node's behavior is entirely determined by its config, a tagged
//! union with one variant per node type. The engine matches on the
//! config exhaustively, so adding a node type is a compile-time
//! checklist rather than a runtime surprise.

use crate::{
    BranchId, NotificationChannel, RecipientSelector, TaskStatus, UserId, ValidationConfig,
};
use serde::{Deserialize, Serialize};

// ── Node Identifier ──────────────────────────────────────────────────

/// Unique identifier for a node within a template
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Node ─────────────────────────────────────────────────────────────

/// A typed step in the template graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    /// Unique within the template
    pub id: NodeId,
    /// Human-readable label, shown in logs and pending-validation views
    pub label: String,
    /// Type-specific configuration; the variant IS the node type
    pub config: NodeConfig,
}

impl Node {
    pub fn new(id: impl Into<String>, config: NodeConfig) -> Self {
        let id = NodeId::new(id);
        Self {
            label: id.0.clone(),
            id,
            config,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Create a start node
    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeConfig::Start)
    }

    /// Create an end node
    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeConfig::End)
    }

    /// Create a task node
    pub fn task(id: impl Into<String>, config: TaskNodeConfig) -> Self {
        Self::new(id, NodeConfig::Task(config))
    }

    /// Create a validation node
    pub fn validation(id: impl Into<String>, config: ValidationConfig) -> Self {
        Self::new(id, NodeConfig::Validation(config))
    }

    /// Create a notification node
    pub fn notification(id: impl Into<String>, config: NotificationConfig) -> Self {
        Self::new(id, NodeConfig::Notification(config))
    }

    /// Create a condition node with default true/false handles
    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(id, NodeConfig::Condition(ConditionConfig::new(expression)))
    }

    /// Create a sub-process marker node
    pub fn sub_process(id: impl Into<String>, sub_process_id: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeConfig::SubProcess(SubProcessConfig {
                sub_process_id: sub_process_id.into(),
            }),
        )
    }

    /// Create a fork node
    pub fn fork(id: impl Into<String>, mode: BranchMode) -> Self {
        Self::new(id, NodeConfig::Fork(ForkConfig { mode }))
    }

    /// Create a join node
    pub fn join(id: impl Into<String>, config: JoinConfig) -> Self {
        Self::new(id, NodeConfig::Join(config))
    }

    /// Create a status-change node
    pub fn status_change(id: impl Into<String>, status: TaskStatus) -> Self {
        Self::new(id, NodeConfig::StatusChange(StatusChangeConfig { status }))
    }

    /// Create an assignment node
    pub fn assignment(id: impl Into<String>, assignee: UserId) -> Self {
        Self::new(id, NodeConfig::Assignment(AssignmentConfig { assignee }))
    }

    /// The fieldless kind of this node, for logging and queries
    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }
}

// ── Node Config ──────────────────────────────────────────────────────

/// Type-specific node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Entry point of the graph; exactly one per template
    Start,
    /// Terminal node; completes the run
    End,
    /// A unit of human work; the run waits here for completion
    Task(TaskNodeConfig),
    /// An approval gate; the run pauses for a decision
    Validation(ValidationConfig),
    /// Sends notifications and passes through
    Notification(NotificationConfig),
    /// Routes along the true or false handle
    Condition(ConditionConfig),
    /// Marker for an embedded sub-process; passes through
    SubProcess(SubProcessConfig),
    /// Spawns parallel branches
    Fork(ForkConfig),
    /// Synchronizes branches spawned by a fork
    Join(JoinConfig),
    /// Writes a status to the trigger task and passes through
    StatusChange(StatusChangeConfig),
    /// Writes an assignee to the trigger task and passes through
    Assignment(AssignmentConfig),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Start => NodeKind::Start,
            Self::End => NodeKind::End,
            Self::Task(_) => NodeKind::Task,
            Self::Validation(_) => NodeKind::Validation,
            Self::Notification(_) => NodeKind::Notification,
            Self::Condition(_) => NodeKind::Condition,
            Self::SubProcess(_) => NodeKind::SubProcess,
            Self::Fork(_) => NodeKind::Fork,
            Self::Join(_) => NodeKind::Join,
            Self::StatusChange(_) => NodeKind::StatusChange,
            Self::Assignment(_) => NodeKind::Assignment,
        }
    }
}

/// Fieldless mirror of the config discriminant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task,
    Validation,
    Notification,
    Condition,
    SubProcess,
    Fork,
    Join,
    StatusChange,
    Assignment,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task => "task",
            Self::Validation => "validation",
            Self::Notification => "notification",
            Self::Condition => "condition",
            Self::SubProcess => "sub_process",
            Self::Fork => "fork",
            Self::Join => "join",
            Self::StatusChange => "status_change",
            Self::Assignment => "assignment",
        };
        write!(f, "{}", s)
    }
}

// ── Per-kind configs ─────────────────────────────────────────────────

/// Configuration of a task node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskNodeConfig {
    /// Assignee written to the trigger task when the node is entered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    /// Due offset applied to the task, in hours from entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_in_hours: Option<i64>,
}

/// Configuration of a condition node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// `field operator literal` expression evaluated against the run context
    pub expression: String,
    /// Handle of the edge followed when the expression holds
    #[serde(default = "default_true_handle")]
    pub true_handle: String,
    /// Handle of the edge followed otherwise
    #[serde(default = "default_false_handle")]
    pub false_handle: String,
}

impl ConditionConfig {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            true_handle: default_true_handle(),
            false_handle: default_false_handle(),
        }
    }

    pub fn with_handles(mut self, yes: impl Into<String>, no: impl Into<String>) -> Self {
        self.true_handle = yes.into();
        self.false_handle = no.into();
        self
    }
}

fn default_true_handle() -> String {
    "true".to_string()
}

fn default_false_handle() -> String {
    "false".to_string()
}

/// Configuration of a sub-process marker node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubProcessConfig {
    /// Which sub-process this node represents
    pub sub_process_id: String,
}

/// Configuration of a fork node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForkConfig {
    /// How branches are determined at fork time
    pub mode: BranchMode,
}

/// How a fork determines its branches
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BranchMode {
    /// Branches declared in the template, each optionally condition-gated
    Static { branches: Vec<BranchSpec> },
    /// One branch per selected sub-process in the run context
    Dynamic,
}

/// A declared branch of a static fork
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchSpec {
    /// Stable branch id; also matched against edge handles for entry
    pub id: BranchId,
    /// Activation gate; absent means always active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl BranchSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: BranchId::new(id),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Configuration of a join node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinConfig {
    /// When the join is satisfied
    pub mode: JoinMode,
    /// Branches that must be completed regardless of mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_branch_ids: Vec<BranchId>,
    /// Hours from fork activation before the join times out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<i64>,
    /// What the timeout sweep does on breach
    #[serde(default)]
    pub on_timeout: TimeoutAction,
}

impl JoinConfig {
    pub fn all() -> Self {
        Self::with_mode(JoinMode::All)
    }

    pub fn any() -> Self {
        Self::with_mode(JoinMode::Any)
    }

    pub fn count(n: u32) -> Self {
        Self::with_mode(JoinMode::Count(n))
    }

    fn with_mode(mode: JoinMode) -> Self {
        Self {
            mode,
            required_branch_ids: Vec::new(),
            timeout_hours: None,
            on_timeout: TimeoutAction::default(),
        }
    }

    pub fn requiring(mut self, branches: Vec<BranchId>) -> Self {
        self.required_branch_ids = branches;
        self
    }

    pub fn with_timeout(mut self, hours: i64, action: TimeoutAction) -> Self {
        self.timeout_hours = Some(hours);
        self.on_timeout = action;
        self
    }
}

/// Join satisfaction rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "join", rename_all = "snake_case")]
pub enum JoinMode {
    /// Every activated branch must complete
    All,
    /// Any single completion satisfies the join
    Any,
    /// At least this many completions satisfy the join
    Count(u32),
}

/// What to do when a join's timeout is breached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Force the join; incomplete branches are failed
    Continue,
    /// Fail the whole run
    Fail,
    /// Emit a notification and keep waiting
    #[default]
    Notify,
}

/// Configuration of a status-change node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusChangeConfig {
    /// Status written to the trigger task
    pub status: TaskStatus,
}

/// Configuration of an assignment node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// Assignee written to the trigger task
    pub assignee: UserId,
}

/// Configuration of a notification node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// One request is built per channel per resolved recipient
    pub channels: Vec<NotificationChannel>,
    /// Who to notify, resolved against the run context
    pub recipients: Vec<RecipientSelector>,
    /// Message subject
    pub subject: String,
    /// Message body
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_matches_config() {
        assert_eq!(Node::start("s").kind(), NodeKind::Start);
        assert_eq!(
            Node::condition("c", "amount > 100").kind(),
            NodeKind::Condition
        );
        assert_eq!(
            Node::fork("f", BranchMode::Dynamic).kind(),
            NodeKind::Fork
        );
        assert_eq!(Node::join("j", JoinConfig::all()).kind(), NodeKind::Join);
    }

    #[test]
    fn test_label_defaults_to_id() {
        let node = Node::start("kickoff");
        assert_eq!(node.label, "kickoff");
        let node = Node::end("done").with_label("All done");
        assert_eq!(node.label, "All done");
    }

    #[test]
    fn test_config_serde_tagging() {
        let node = Node::status_change("mark-done", crate::TaskStatus::Done);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["config"]["type"], "status_change");
        assert_eq!(json["config"]["status"], "done");

        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), NodeKind::StatusChange);
    }

    #[test]
    fn test_condition_handles_default() {
        let json = serde_json::json!({
            "type": "condition",
            "expression": "department == legal"
        });
        let cfg: NodeConfig = serde_json::from_value(json).unwrap();
        match cfg {
            NodeConfig::Condition(c) => {
                assert_eq!(c.true_handle, "true");
                assert_eq!(c.false_handle, "false");
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_static_branch_spec_gating() {
        let spec = BranchSpec::new("legal").when("department == legal");
        assert_eq!(spec.id.as_str(), "legal");
        assert!(spec.condition.is_some());
    }
}
