//! Validation gate: approval steps, trigger eligibility, approvers
//!
//! Auto-mode validations materialize an instance when the cursor
//! arrives and trigger as soon as their prerequisites hold. Manual
//! validations store nothing until an eligible actor triggers them;
//! until then they exist only as a computed pending view. A missing
//! approver is a resolution gap, flagged and escalated, never a crash.

use crate::collaborators::DirectoryScope;
use crate::condition::ConditionEvaluator;
use crate::effects::Effects;
use procflow_types::{
    ApproverSpec, BranchId, CanTrigger, EngineError, EngineResult, Node, NodeConfig, NodeId,
    NotificationChannel, NotificationRequest, Prerequisite, Run, TaskStatus, TriggerAllowedBy,
    TriggerMode, TriggerTask, UserId, ValidationConfig, ValidationInstance, ValidationInstanceId,
    ValidationOutcome, WorkflowTemplate,
};

/// Where a decided validation routes next
#[derive(Clone, Debug)]
pub struct DecisionRouting {
    /// The validation node the decision belongs to
    pub node: NodeId,
    /// Set when the validation sat inside a branch
    pub branch: Option<BranchId>,
    /// The approval outcome that was applied
    pub outcome: ValidationOutcome,
    /// Validation node to auto-trigger after an approval
    pub auto_trigger_next: Option<NodeId>,
}

/// Drives the validation lifecycle for a run
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidationGate {
    evaluator: ConditionEvaluator,
}

impl ValidationGate {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Arrival ──────────────────────────────────────────────────────

    /// The cursor reached a validation node.
    ///
    /// `force_trigger` is set when an upstream approval chained here
    /// via `auto_trigger_next`: the gate triggers even in manual mode.
    pub fn arrive(
        &self,
        run: &mut Run,
        node: &Node,
        config: &ValidationConfig,
        branch: Option<&BranchId>,
        force_trigger: bool,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) -> EngineResult<()> {
        match config.trigger_mode {
            TriggerMode::Manual if !force_trigger => {
                // No instance row: the pending state is a computed view.
                run.record(
                    Some(node.id.clone()),
                    "awaiting_manual_trigger",
                    format!("Validation '{}' waits for a manual trigger", node.label),
                );
                Ok(())
            }
            _ => {
                let mut instance = ValidationInstance::new(node.id.clone());
                if let Some(branch) = branch {
                    instance = instance.in_branch(branch.clone());
                }
                instance.set_approver(self.resolve_approver(&config.approver, run, fx));

                let task = fx.tasks.get(&run.trigger)?;
                let met = force_trigger
                    || self.prerequisites_met(&config.prerequisites, run, &task);
                if met {
                    instance.trigger(None, config.sla_hours);
                    let instance_node = instance.node.clone();
                    let approver = instance.approver.clone();
                    let unresolved = instance.approver_unresolved;
                    run.add_validation(instance);
                    self.suspend(run, &instance_node, branch)?;
                    self.notify_approver(run, &instance_node, approver, unresolved, fx, out);
                } else {
                    instance.prerequisites_met = false;
                    run.add_validation(instance);
                    run.record(
                        Some(node.id.clone()),
                        "prerequisites_unmet",
                        "Validation created but not triggered; prerequisites unmet",
                    );
                }
                Ok(())
            }
        }
    }

    /// Re-evaluate untriggered auto validations after an inbound event.
    /// Any instance whose prerequisites now hold gets triggered.
    pub fn reevaluate(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) -> EngineResult<()> {
        let candidates: Vec<(ValidationInstanceId, NodeId, Option<BranchId>)> = run
            .open_validations()
            .filter(|v| !v.is_triggered())
            .map(|v| (v.id.clone(), v.node.clone(), v.branch.clone()))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let task = fx.tasks.get(&run.trigger)?;
        for (instance_id, node_id, branch) in candidates {
            let config = match &template.node(&node_id)?.config {
                NodeConfig::Validation(config) => config.clone(),
                _ => continue,
            };
            if !self.prerequisites_met(&config.prerequisites, run, &task) {
                continue;
            }
            let (approver, unresolved) = {
                let instance = run
                    .validation_mut(&instance_id)
                    .ok_or_else(|| EngineError::ValidationNotFound(instance_id.clone()))?;
                instance.trigger(None, config.sla_hours);
                (instance.approver.clone(), instance.approver_unresolved)
            };
            run.record(
                Some(node_id.clone()),
                "validation_triggered",
                "Prerequisites met; validation triggered",
            );
            self.suspend(run, &node_id, branch.as_ref())?;
            self.notify_approver(run, &node_id, approver, unresolved, fx, out);
        }
        Ok(())
    }

    // ── Manual trigger ───────────────────────────────────────────────

    /// Eligibility check; returns a value, never an error
    pub fn check_can_trigger(
        &self,
        task: &TriggerTask,
        run: &Run,
        actor: &UserId,
        config: &ValidationConfig,
    ) -> CanTrigger {
        if !matches!(task.status, TaskStatus::Done | TaskStatus::InProgress) {
            return CanTrigger::no(format!(
                "task_not_ready: task is '{}', must be done or in-progress",
                task.status
            ));
        }

        let eligible = match config.trigger_allowed_by {
            TriggerAllowedBy::TaskOwner => {
                task.is_assigned_to(actor) || task.created_by.as_ref() == Some(actor)
            }
            TriggerAllowedBy::Requester => run.context.requester.as_ref() == Some(actor),
            TriggerAllowedBy::SpecificUser => {
                config.specific_trigger_user.as_ref() == Some(actor)
            }
        };
        if eligible {
            CanTrigger::yes()
        } else {
            CanTrigger::no("actor_not_allowed: actor may not trigger this validation")
        }
    }

    /// Trigger a manual validation the cursor parks on.
    ///
    /// Creates the instance, resolves the approver, stamps the SLA due
    /// date, parks the trigger task in pending-validation, suspends
    /// the run (or branch), and notifies the approver.
    pub fn trigger_manual(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        node_id: &NodeId,
        actor: &UserId,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) -> EngineResult<ValidationInstanceId> {
        let branch = self.cursor_at(run, node_id)?;
        let config = match &template.node(node_id)?.config {
            NodeConfig::Validation(config) => config.clone(),
            _ => {
                return Err(EngineError::InvalidTransition(format!(
                    "node '{}' is not a validation",
                    node_id
                )))
            }
        };
        if config.trigger_mode != TriggerMode::Manual {
            return Err(EngineError::TriggerNotAllowed(
                "validation triggers automatically".into(),
            ));
        }
        if run
            .validation_for_node(node_id)
            .map(|v| v.is_open() && v.is_triggered())
            .unwrap_or(false)
        {
            return Err(EngineError::InvalidTransition(format!(
                "validation '{}' already triggered",
                node_id
            )));
        }

        let task = fx.tasks.get(&run.trigger)?;
        let verdict = self.check_can_trigger(&task, run, actor, &config);
        if !verdict.allowed {
            return Err(EngineError::TriggerNotAllowed(
                verdict.reason.unwrap_or_else(|| "not allowed".into()),
            ));
        }

        let mut instance = ValidationInstance::new(node_id.clone());
        if let Some(branch) = &branch {
            instance = instance.in_branch(branch.clone());
        }
        instance.set_approver(self.resolve_approver(&config.approver, run, fx));
        instance.trigger(Some(actor.clone()), config.sla_hours);
        let instance_id = instance.id.clone();
        let approver = instance.approver.clone();
        let unresolved = instance.approver_unresolved;
        run.add_validation(instance);

        // Park the trigger task; the write is idempotent.
        fx.tasks
            .set_status(&run.trigger, TaskStatus::PendingValidation)?;
        run.record(
            Some(node_id.clone()),
            "validation_triggered",
            format!("Manually triggered by '{}'", actor),
        );
        self.suspend(run, node_id, branch.as_ref())?;
        self.notify_approver(run, node_id, approver, unresolved, fx, out);
        tracing::info!(run_id = %run.id, node = %node_id, actor = %actor, "manual validation triggered");
        Ok(instance_id)
    }

    /// Which lane's cursor sits on this node, if any
    fn cursor_at(&self, run: &Run, node: &NodeId) -> EngineResult<Option<BranchId>> {
        if run.current_node() == Some(node) {
            return Ok(None);
        }
        for branch in run.branches() {
            if branch.current_node.as_ref() == Some(node) && branch.is_open() {
                return Ok(Some(branch.branch.clone()));
            }
        }
        Err(EngineError::InvalidTransition(format!(
            "no cursor at validation node '{}'",
            node
        )))
    }

    // ── Decision ─────────────────────────────────────────────────────

    /// Apply an approver's decision; routing is the caller's job.
    pub fn apply_decision(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        instance_id: &ValidationInstanceId,
        outcome: ValidationOutcome,
        comment: Option<String>,
        actor: &UserId,
    ) -> EngineResult<DecisionRouting> {
        let (node_id, branch) = {
            let instance = run
                .validation(instance_id)
                .ok_or_else(|| EngineError::ValidationNotFound(instance_id.clone()))?;
            if !instance.is_open() {
                return Err(EngineError::InvalidTransition(format!(
                    "validation instance {} already decided",
                    instance_id.short()
                )));
            }
            if !instance.is_triggered() {
                return Err(EngineError::InvalidTransition(format!(
                    "validation instance {} not yet triggered",
                    instance_id.short()
                )));
            }
            (instance.node.clone(), instance.branch.clone())
        };

        let config = match &template.node(&node_id)?.config {
            NodeConfig::Validation(config) => config.clone(),
            _ => {
                return Err(EngineError::BrokenGraph {
                    workflow: template.id.clone(),
                    detail: format!("instance points at non-validation node '{}'", node_id),
                })
            }
        };

        if let Some(instance) = run.validation_mut(instance_id) {
            instance.decide(outcome, actor.clone(), comment);
        }
        run.record(
            Some(node_id.clone()),
            "validation_decided",
            format!("{:?} by '{}'", outcome, actor),
        );

        // Resume whichever lane the gate had suspended.
        match &branch {
            Some(branch_id) => {
                if let Some(instance) = run.branch_mut(branch_id) {
                    instance.resume();
                }
            }
            None => run.resume()?,
        }

        let auto_trigger_next = match outcome {
            ValidationOutcome::Approved if config.auto_trigger_next => {
                config.next_validation_node.clone()
            }
            _ => None,
        };

        tracing::info!(
            run_id = %run.id,
            node = %node_id,
            ?outcome,
            "validation decided"
        );
        Ok(DecisionRouting {
            node: node_id,
            branch,
            outcome,
            auto_trigger_next,
        })
    }

    // ── Pending views ────────────────────────────────────────────────

    /// Manual validation nodes the run's cursors park on, untriggered
    pub fn pending_nodes(&self, run: &Run, template: &WorkflowTemplate) -> Vec<NodeId> {
        let mut cursors: Vec<NodeId> = Vec::new();
        if let Some(node) = run.current_node() {
            cursors.push(node.clone());
        }
        for branch in run.branches() {
            if let Some(node) = &branch.current_node {
                if branch.is_open() {
                    cursors.push(node.clone());
                }
            }
        }

        cursors
            .into_iter()
            .filter(|node_id| {
                matches!(
                    template.node(node_id).map(|n| &n.config),
                    Ok(NodeConfig::Validation(config))
                        if config.trigger_mode == TriggerMode::Manual
                )
            })
            .filter(|node_id| {
                !run.validation_for_node(node_id)
                    .map(|v| v.is_triggered() && v.is_open() || v.status.is_terminal())
                    .unwrap_or(false)
            })
            .collect()
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Resolve the approver; `None` marks a resolution gap
    pub fn resolve_approver(
        &self,
        spec: &ApproverSpec,
        run: &Run,
        fx: &Effects<'_>,
    ) -> Option<UserId> {
        match spec {
            ApproverSpec::User { id } => Some(id.clone()),
            ApproverSpec::RequesterManager => run
                .context
                .requester
                .as_ref()
                .and_then(|user| fx.directory.manager_of(user)),
            ApproverSpec::TargetManager => run
                .context
                .assignee
                .as_ref()
                .and_then(|user| fx.directory.manager_of(user)),
            ApproverSpec::Role { name } => {
                fx.directory.resolve_principal(DirectoryScope::Role, name)
            }
            ApproverSpec::Group { name } => {
                fx.directory.resolve_principal(DirectoryScope::Group, name)
            }
            ApproverSpec::Department { name } => fx
                .directory
                .resolve_principal(DirectoryScope::Department, name),
        }
    }

    fn prerequisites_met(
        &self,
        prerequisites: &[Prerequisite],
        run: &Run,
        task: &TriggerTask,
    ) -> bool {
        prerequisites
            .iter()
            .all(|p| self.prerequisite_met(p, run, task))
    }

    fn prerequisite_met(&self, prerequisite: &Prerequisite, run: &Run, task: &TriggerTask) -> bool {
        match prerequisite {
            Prerequisite::TaskCompleted => task.status == TaskStatus::Done,
            Prerequisite::PriorValidationApproved { node } => run
                .validation_for_node(node)
                .map(|v| v.status == procflow_types::ValidationStatus::Approved)
                .unwrap_or(false),
            Prerequisite::ConditionTrue { expression } => {
                self.evaluator.evaluate(expression, &run.context)
            }
            Prerequisite::AllOf { all } => self.prerequisites_met(all, run, task),
        }
    }

    /// Pause the run, or park the branch, while the decision is out
    fn suspend(&self, run: &mut Run, node: &NodeId, branch: Option<&BranchId>) -> EngineResult<()> {
        match branch {
            Some(branch_id) => {
                if let Some(instance) = run.branch_mut(branch_id) {
                    instance.wait();
                }
                run.record(
                    Some(node.clone()),
                    "branch_waiting",
                    format!("Branch '{}' waits on validation", branch_id),
                );
                Ok(())
            }
            None => run.pause("Validation pending"),
        }
    }

    /// Notify the approver, or escalate the resolution gap to the
    /// requester so an operator can assign somebody.
    fn notify_approver(
        &self,
        run: &mut Run,
        node: &NodeId,
        approver: Option<UserId>,
        unresolved: bool,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) {
        match approver {
            Some(approver) => {
                out.push(fx.dispatch(
                    run,
                    node,
                    NotificationChannel::InApp,
                    approver,
                    "Validation requested",
                    "A workflow step awaits your decision",
                ));
            }
            None if unresolved => {
                tracing::warn!(run_id = %run.id, node = %node, "approver unresolved");
                run.record(
                    Some(node.clone()),
                    "approver_unresolved",
                    "No approver could be resolved; needs manual assignment",
                );
                if let Some(requester) = run.context.requester.clone() {
                    out.push(fx.dispatch(
                        run,
                        node,
                        NotificationChannel::InApp,
                        requester,
                        "Approver needed",
                        "A validation has no resolvable approver and needs manual assignment",
                    ));
                }
            }
            None => {}
        }
    }
}
