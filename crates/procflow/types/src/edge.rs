//! Workflow edges: directed transitions between template nodes
//!
//! Edges connect nodes in the template graph. An edge may carry a
//! source handle, which distinguishes the outgoing paths of nodes
//! with more than one exit: a validation's `validated`/`rejected`
//! outcomes, a condition's true/false labels, or the entry point of
//! a named fork branch. Plain edges have no handle.

use crate::{BranchId, NodeId};
use serde::{Deserialize, Serialize};

/// Handle routed when a validation is approved
pub const HANDLE_VALIDATED: &str = "validated";
/// Handle routed when a validation is rejected
pub const HANDLE_REJECTED: &str = "rejected";

/// An edge in the template graph
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node
    pub source: NodeId,
    /// Target node
    pub target: NodeId,
    /// Which exit of the source node this edge leaves from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    /// Create a plain edge with no handle
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self {
            source,
            target,
            source_handle: None,
        }
    }

    /// Create an edge leaving a named exit of the source node
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Create the approval exit of a validation node
    pub fn validated(source: NodeId, target: NodeId) -> Self {
        Self::new(source, target).with_handle(HANDLE_VALIDATED)
    }

    /// Create the rejection exit of a validation node
    pub fn rejected(source: NodeId, target: NodeId) -> Self {
        Self::new(source, target).with_handle(HANDLE_REJECTED)
    }

    /// Create the entry edge of a named fork branch
    pub fn branch_entry(source: NodeId, target: NodeId, branch: &BranchId) -> Self {
        Self::new(source, target).with_handle(branch.0.clone())
    }

    /// The handle, if any
    pub fn handle(&self) -> Option<&str> {
        self.source_handle.as_deref()
    }

    /// Check whether this edge leaves the given named exit
    pub fn has_handle(&self, handle: &str) -> bool {
        self.source_handle.as_deref() == Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_edge_has_no_handle() {
        let edge = Edge::new(NodeId::new("a"), NodeId::new("b"));
        assert!(edge.handle().is_none());
        assert!(!edge.has_handle("validated"));
    }

    #[test]
    fn test_validation_exits() {
        let ok = Edge::validated(NodeId::new("v"), NodeId::new("next"));
        let no = Edge::rejected(NodeId::new("v"), NodeId::new("rework"));

        assert!(ok.has_handle(HANDLE_VALIDATED));
        assert!(no.has_handle(HANDLE_REJECTED));
        assert_eq!(ok.source, no.source);
    }

    #[test]
    fn test_branch_entry_handle_matches_branch_id() {
        let branch = BranchId::new("legal");
        let edge = Edge::branch_entry(NodeId::new("fork"), NodeId::new("legal-review"), &branch);
        assert!(edge.has_handle("legal"));
    }

    #[test]
    fn test_handle_skipped_in_json_when_absent() {
        let edge = Edge::new(NodeId::new("a"), NodeId::new("b"));
        let json = serde_json::to_string(&edge).unwrap();
        assert!(!json.contains("source_handle"));
    }
}
