//! Error types for the Procflow layer

use crate::{BranchId, NodeId, RunId, TaskId, ValidationInstanceId, WorkflowId};

/// Errors that can occur in Procflow operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(WorkflowId),

    #[error("No active version for workflow: {0}")]
    NoActiveVersion(WorkflowId),

    #[error("Workflow run not found: {0}")]
    RunNotFound(RunId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("Validation instance not found: {0}")]
    ValidationNotFound(ValidationInstanceId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Broken graph in workflow '{workflow}': {detail}")]
    BrokenGraph { workflow: WorkflowId, detail: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Run already finished: {0}")]
    AlreadyFinished(RunId),

    #[error("Manual trigger not allowed: {0}")]
    TriggerNotAllowed(String),

    #[error("Duplicate template version: {workflow} v{version}")]
    DuplicateTemplate { workflow: WorkflowId, version: u32 },

    #[error("Template not editable: {workflow} v{version}")]
    TemplateNotEditable { workflow: WorkflowId, version: u32 },

    #[error("Duplicate node ID: {0}")]
    DuplicateNodeId(NodeId),

    #[error("Duplicate edge: {from} -> {to}")]
    DuplicateEdge { from: NodeId, to: NodeId },

    #[error("No start node defined")]
    NoStartNode,

    #[error("No end node defined")]
    NoEndNode,

    #[error("Disconnected graph: unreachable nodes")]
    DisconnectedGraph,

    #[error("Template validation error: {0}")]
    ValidationError(String),

    #[error("Collaborator '{collaborator}' failed: {detail}")]
    CollaboratorFailure {
        collaborator: &'static str,
        detail: String,
    },

    #[error("Internal lock poisoned")]
    LockPoisoned,
}

/// Result type alias for Procflow operations
pub type EngineResult<T> = Result<T, EngineError>;
