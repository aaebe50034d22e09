//! Inbound run events: everything that can advance a run
//!
//! The engine is event-reactive. Nothing moves a run except one of
//! these events arriving (or the external timeout sweep).

use crate::{BranchId, NodeId, TaskStatus, UserId, ValidationInstanceId, ValidationOutcome};
use serde::{Deserialize, Serialize};

/// An inbound event addressed to one run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// The task at the current (branch or main) cursor finished
    TaskCompleted {
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<BranchId>,
    },
    /// The trigger task's status changed
    StatusChanged {
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<BranchId>,
    },
    /// An approver decided a validation instance
    ValidationDecided {
        instance: ValidationInstanceId,
        outcome: ValidationOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        actor: UserId,
    },
    /// A branch reported itself complete
    BranchCompleted { branch: BranchId },
    /// An actor asked to trigger a manual validation
    ManualTriggerRequested { node: NodeId, actor: UserId },
}

impl RunEvent {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskCompleted { .. } => "task_completed",
            Self::StatusChanged { .. } => "status_changed",
            Self::ValidationDecided { .. } => "validation_decided",
            Self::BranchCompleted { .. } => "branch_completed",
            Self::ManualTriggerRequested { .. } => "manual_trigger_requested",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_shape() {
        let event = RunEvent::BranchCompleted {
            branch: BranchId::new("sp_audit"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "branch_completed");
        assert_eq!(json["branch"], "sp_audit");

        let back: RunEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "branch_completed");
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            RunEvent::TaskCompleted { branch: None }.name(),
            "task_completed"
        );
        assert_eq!(
            RunEvent::ManualTriggerRequested {
                node: NodeId::new("v"),
                actor: UserId::new("u"),
            }
            .name(),
            "manual_trigger_requested"
        );
    }
}
