//! Fork/join coordinator: parallel branch mechanics
//!
//! A fork node activates branches (declared statically, optionally
//! condition-gated, or derived dynamically from the run's selected
//! sub-processes). Each branch advances independently; the join node
//! synchronizes them under a configurable rule. Consuming the join
//! clears all branch state, so one fork/join pair can never fire its
//! join twice.

use crate::condition::ConditionEvaluator;
use procflow_types::{
    BranchId, BranchInstance, BranchMode, EngineError, EngineResult, JoinConfig, JoinMode, Node,
    NodeConfig, NodeId, Run, WorkflowTemplate,
};
use serde::{Deserialize, Serialize};

/// Result of evaluating a join's satisfaction rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEvaluation {
    pub can_proceed: bool,
    pub completed_count: usize,
    pub total_count: usize,
}

/// What completing a branch did to the join
#[derive(Clone, Debug)]
pub enum JoinOutcome {
    /// The join fired; the main cursor now sits on this node
    Proceeded(NodeId),
    /// Still waiting for siblings
    Waiting(JoinEvaluation),
}

/// Coordinates branch activation, completion, and join evaluation
#[derive(Clone, Copy, Debug, Default)]
pub struct ForkJoinCoordinator {
    evaluator: ConditionEvaluator,
}

impl ForkJoinCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate the branches of a fork node.
    ///
    /// Returns the activated branch ids with their entry nodes; an
    /// empty result means every gate evaluated false (or nothing was
    /// selected) and the caller skips to the join.
    pub fn activate_branches(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        fork: &Node,
    ) -> EngineResult<Vec<(BranchId, NodeId)>> {
        let config = match &fork.config {
            NodeConfig::Fork(config) => config,
            _ => {
                return Err(EngineError::InvalidTransition(format!(
                    "node '{}' is not a fork",
                    fork.id
                )))
            }
        };

        let branch_ids: Vec<BranchId> = match &config.mode {
            BranchMode::Static { branches } => branches
                .iter()
                .filter(|spec| match &spec.condition {
                    Some(expression) => self.evaluator.evaluate(expression, &run.context),
                    None => true,
                })
                .map(|spec| spec.id.clone())
                .collect(),
            BranchMode::Dynamic => run
                .context
                .selected_sub_processes
                .iter()
                .map(|id| BranchId::for_sub_process(id))
                .collect(),
        };

        let mut activated = Vec::new();
        for branch_id in branch_ids {
            let entry = self.entry_node(template, &fork.id, &branch_id)?;
            let instance = BranchInstance::new(branch_id.clone(), fork.id.clone(), entry.clone())
                .with_context_snapshot(run.context.to_map());
            run.activate_branch(instance);
            activated.push((branch_id, entry));
        }

        if !activated.is_empty() {
            // Main cursor is undefined while the fork region executes.
            run.clear_cursor();
            tracing::info!(
                run_id = %run.id,
                fork = %fork.id,
                branches = activated.len(),
                "fork started"
            );
        }
        Ok(activated)
    }

    /// The branch's first node: the fork edge whose handle matches the
    /// branch id, falling back to the fork's first outgoing edge.
    fn entry_node(
        &self,
        template: &WorkflowTemplate,
        fork: &NodeId,
        branch: &BranchId,
    ) -> EngineResult<NodeId> {
        let edges = template.outgoing(fork);
        let edge = edges
            .iter()
            .find(|e| e.has_handle(branch.as_str()))
            .or_else(|| edges.first())
            .ok_or_else(|| EngineError::BrokenGraph {
                workflow: template.id.clone(),
                detail: format!("fork '{}' has no outgoing edge", fork),
            })?;
        Ok(edge.target.clone())
    }

    /// Evaluate whether a join is satisfied, without mutating anything
    pub fn can_join(&self, run: &Run, config: &JoinConfig) -> JoinEvaluation {
        let completed_count = run.completed_branches().len();
        let total_count = completed_count + run.active_branches().len();

        let mode_satisfied = match config.mode {
            JoinMode::All => total_count > 0 && completed_count == total_count,
            JoinMode::Any => completed_count >= 1,
            JoinMode::Count(n) => completed_count >= n.max(1) as usize,
        };

        // Required branches bind only when they actually activated.
        let required_ok = config
            .required_branch_ids
            .iter()
            .all(|id| run.branch(id).is_none() || run.completed_branches().contains(id));

        JoinEvaluation {
            can_proceed: mode_satisfied && required_ok,
            completed_count,
            total_count,
        }
    }

    /// Complete one branch and evaluate its join.
    ///
    /// Must be called with the run's lock held: the read-evaluate-write
    /// sequence here is what two concurrent completions must not
    /// interleave.
    pub fn complete_branch(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        branch: &BranchId,
    ) -> EngineResult<JoinOutcome> {
        let fork = run
            .branch(branch)
            .filter(|_| run.active_branches().contains(branch))
            .map(|b| b.fork_node.clone())
            .ok_or_else(|| EngineError::BranchNotFound(branch.clone()))?;

        run.finish_branch(branch)?;

        let join = template
            .join_for_fork(&fork)
            .ok_or_else(|| EngineError::BrokenGraph {
                workflow: template.id.clone(),
                detail: format!("fork '{}' reaches no join", fork),
            })?;
        let config = match &join.config {
            NodeConfig::Join(config) => config,
            _ => unreachable!("join_for_fork returns join nodes only"),
        };

        let evaluation = self.can_join(run, config);
        if !evaluation.can_proceed {
            tracing::debug!(
                run_id = %run.id,
                branch = %branch,
                completed = evaluation.completed_count,
                total = evaluation.total_count,
                "join still waiting"
            );
            return Ok(JoinOutcome::Waiting(evaluation));
        }

        let join_id = join.id.clone();
        self.consume_join(run, &join_id, evaluation)?;
        Ok(JoinOutcome::Proceeded(join_id))
    }

    /// Fire the join: clear all branch state and move the main cursor
    /// onto the join node. Clearing is what makes a second firing
    /// impossible for this fork/join pair.
    pub fn consume_join(
        &self,
        run: &mut Run,
        join: &NodeId,
        evaluation: JoinEvaluation,
    ) -> EngineResult<()> {
        run.record(
            Some(join.clone()),
            "join_satisfied",
            format!(
                "{}/{} branches completed",
                evaluation.completed_count, evaluation.total_count
            ),
        );
        run.clear_branch_state();
        run.set_cursor(join.clone(), "Join consumed")?;
        tracing::info!(run_id = %run.id, join = %join, "join satisfied");
        Ok(())
    }

    /// Force a join past incomplete branches (timeout `Continue`).
    /// Open branches are failed, then the join is consumed as-is.
    pub fn force_join(&self, run: &mut Run, join: &NodeId) -> EngineResult<()> {
        let open: Vec<BranchId> = run.active_branches().iter().cloned().collect();
        for branch in &open {
            if let Some(instance) = run.branch_mut(branch) {
                instance.fail();
            }
            run.record(
                None,
                "branch_failed",
                format!("Branch '{}' failed by join timeout", branch),
            );
        }
        let completed = run.completed_branches().len();
        let total = completed + open.len();
        self.consume_join(
            run,
            join,
            JoinEvaluation {
                can_proceed: true,
                completed_count: completed,
                total_count: total,
            },
        )
    }
}
