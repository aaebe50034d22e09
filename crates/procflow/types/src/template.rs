//! Workflow templates: immutable directed graphs of typed nodes
//!
//! A template is editable while Draft. Publishing freezes it: an
//! Active version's node/edge set never changes, and any edit goes
//! into a new version. Runs pin the version they started with.

use crate::{
    Edge, EngineError, EngineResult, Node, NodeConfig, NodeId, NodeKind, HANDLE_VALIDATED,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

// ── Workflow Identifier ──────────────────────────────────────────────

/// Unique identifier for a workflow (shared by all its versions)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
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

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Template Status ──────────────────────────────────────────────────

/// Lifecycle status of a template version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    /// Editable; not yet runnable
    #[default]
    Draft,
    /// Published; immutable and runnable
    Active,
    /// Retired; immutable, no new runs
    Inactive,
    /// Kept for audit only
    Archived,
}

// ── Workflow Template ────────────────────────────────────────────────

/// One version of a workflow definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Shared across versions
    pub id: WorkflowId,
    /// Human-readable name
    pub name: String,
    /// Description of the process
    #[serde(default)]
    pub description: String,
    /// Version number, unique per workflow id
    pub version: u32,
    /// Lifecycle status
    pub status: TemplateStatus,
    /// Graph nodes
    pub nodes: Vec<Node>,
    /// Graph edges
    pub edges: Vec<Edge>,
    /// When this version was created
    pub created_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    /// Create a new draft, version 1
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::generate(),
            name: name.into(),
            description: String::new(),
            version: 1,
            status: TemplateStatus::Draft,
            nodes: Vec::new(),
            edges: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    fn ensure_editable(&self) -> EngineResult<()> {
        if self.status != TemplateStatus::Draft {
            return Err(EngineError::TemplateNotEditable {
                workflow: self.id.clone(),
                version: self.version,
            });
        }
        Ok(())
    }

    /// Add a node; drafts only
    pub fn add_node(&mut self, node: Node) -> EngineResult<()> {
        self.ensure_editable()?;
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(EngineError::DuplicateNodeId(node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Add an edge; drafts only. Both endpoints must exist, and no
    /// second edge may leave the same source through the same handle
    /// to the same target.
    pub fn add_edge(&mut self, edge: Edge) -> EngineResult<()> {
        self.ensure_editable()?;
        if !self.nodes.iter().any(|n| n.id == edge.source) {
            return Err(EngineError::NodeNotFound(edge.source));
        }
        if !self.nodes.iter().any(|n| n.id == edge.target) {
            return Err(EngineError::NodeNotFound(edge.target));
        }
        if self.edges.iter().any(|e| {
            e.source == edge.source
                && e.target == edge.target
                && e.source_handle == edge.source_handle
        }) {
            return Err(EngineError::DuplicateEdge {
                from: edge.source,
                to: edge.target,
            });
        }
        self.edges.push(edge);
        Ok(())
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub fn node(&self, id: &NodeId) -> EngineResult<&Node> {
        self.nodes
            .iter()
            .find(|n| &n.id == id)
            .ok_or_else(|| EngineError::NodeNotFound(id.clone()))
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.kind() == NodeKind::Start)
    }

    pub fn end_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.kind() == NodeKind::End)
            .collect()
    }

    /// All edges leaving a node
    pub fn outgoing(&self, node: &NodeId) -> Vec<&Edge> {
        self.edges.iter().filter(|e| &e.source == node).collect()
    }

    /// Edges leaving a node through a specific handle (or none)
    pub fn outgoing_with_handle(&self, node: &NodeId, handle: Option<&str>) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| &e.source == node && e.handle() == handle)
            .collect()
    }

    /// All edges entering a node
    pub fn incoming(&self, node: &NodeId) -> Vec<&Edge> {
        self.edges.iter().filter(|e| &e.target == node).collect()
    }

    /// The unique follow-up node of a linear node.
    ///
    /// Zero or multiple outgoing edges at execution time means the
    /// graph is broken for this run; the definition cannot be trusted.
    pub fn single_target(&self, node: &NodeId) -> EngineResult<&Node> {
        let outgoing = self.outgoing(node);
        match outgoing.as_slice() {
            [edge] => self.node(&edge.target),
            [] => Err(EngineError::BrokenGraph {
                workflow: self.id.clone(),
                detail: format!("node '{}' has no outgoing edge", node),
            }),
            _ => Err(EngineError::BrokenGraph {
                workflow: self.id.clone(),
                detail: format!("node '{}' has multiple unlabelled outgoing edges", node),
            }),
        }
    }

    /// The target of the edge leaving `node` through `handle`
    pub fn target_via_handle(&self, node: &NodeId, handle: &str) -> EngineResult<&Node> {
        let edge = self
            .edges
            .iter()
            .find(|e| &e.source == node && e.has_handle(handle))
            .ok_or_else(|| EngineError::BrokenGraph {
                workflow: self.id.clone(),
                detail: format!("node '{}' has no edge for handle '{}'", node, handle),
            })?;
        self.node(&edge.target)
    }

    /// The first join node reachable from a fork, breadth-first
    pub fn join_for_fork(&self, fork: &NodeId) -> Option<&Node> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&NodeId> = VecDeque::new();
        queue.push_back(fork);
        visited.insert(fork.clone());
        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing(current) {
                if !visited.insert(edge.target.clone()) {
                    continue;
                }
                if let Ok(node) = self.node(&edge.target) {
                    if node.kind() == NodeKind::Join {
                        return Some(node);
                    }
                    queue.push_back(&edge.target);
                }
            }
        }
        None
    }

    // ── Validation ───────────────────────────────────────────────────

    /// Structural validation, run before a template is registered.
    ///
    /// Checks: exactly one start node, at least one end node, unique
    /// ids, edges referencing existing nodes, everything reachable
    /// from start, every fork reaching a join, condition nodes wired
    /// for both verdicts, validation nodes wired for approval.
    pub fn validate(&self) -> EngineResult<()> {
        let starts: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.kind() == NodeKind::Start)
            .collect();
        match starts.len() {
            0 => return Err(EngineError::NoStartNode),
            1 => {}
            n => {
                return Err(EngineError::ValidationError(format!(
                    "{} start nodes, expected exactly 1",
                    n
                )))
            }
        }
        if self.end_nodes().is_empty() {
            return Err(EngineError::NoEndNode);
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(EngineError::DuplicateNodeId(node.id.clone()));
            }
        }

        for edge in &self.edges {
            if !seen.contains(&edge.source) {
                return Err(EngineError::NodeNotFound(edge.source.clone()));
            }
            if !seen.contains(&edge.target) {
                return Err(EngineError::NodeNotFound(edge.target.clone()));
            }
        }

        let reachable = self.reachable_from(&starts[0].id);
        if reachable.len() != self.nodes.len() {
            return Err(EngineError::DisconnectedGraph);
        }

        for node in &self.nodes {
            match &node.config {
                NodeConfig::Condition(cfg) => {
                    for handle in [&cfg.true_handle, &cfg.false_handle] {
                        if !self.edges.iter().any(|e| {
                            e.source == node.id && e.has_handle(handle)
                        }) {
                            return Err(EngineError::ValidationError(format!(
                                "condition node '{}' has no edge for handle '{}'",
                                node.id, handle
                            )));
                        }
                    }
                }
                NodeConfig::Validation(_) => {
                    if !self
                        .edges
                        .iter()
                        .any(|e| e.source == node.id && e.has_handle(HANDLE_VALIDATED))
                    {
                        return Err(EngineError::ValidationError(format!(
                            "validation node '{}' has no '{}' edge",
                            node.id, HANDLE_VALIDATED
                        )));
                    }
                }
                NodeConfig::Fork(_) => {
                    if self.join_for_fork(&node.id).is_none() {
                        return Err(EngineError::ValidationError(format!(
                            "fork node '{}' reaches no join",
                            node.id
                        )));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Node ids reachable from `from`, including itself
    fn reachable_from(&self, from: &NodeId) -> HashSet<NodeId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(from.clone());
        queue.push_back(from.clone());
        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing(&current) {
                if visited.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        visited
    }
}
