//! Run state machine: advances cursors through the template graph
//!
//! Every inbound event is routed here. Control nodes chain in a loop
//! within one call until the run reaches a waiting node (task,
//! validation, fork) or a terminal state; each hop appends exactly one
//! cursor log entry. Branch cursors advance under the same rules; a
//! branch whose next hop is the join node completes itself there.

use crate::condition::ConditionEvaluator;
use crate::effects::Effects;
use crate::fork_join::{ForkJoinCoordinator, JoinOutcome};
use crate::validation_gate::ValidationGate;
use procflow_types::{
    BranchId, BranchStatus, EngineError, EngineResult, NodeConfig, NodeId, NodeKind,
    NotificationRequest, Run, RunEvent, RunStatus, TaskStatus, ValidationInstanceId,
    ValidationOutcome, WorkflowTemplate, HANDLE_REJECTED, HANDLE_VALIDATED,
};

/// Which cursor an advancement drives
#[derive(Clone, Debug, PartialEq, Eq)]
enum Lane {
    Main,
    Branch(BranchId),
}

impl Lane {
    fn from_branch(branch: Option<BranchId>) -> Self {
        match branch {
            Some(branch) => Self::Branch(branch),
            None => Self::Main,
        }
    }

    fn branch(&self) -> Option<&BranchId> {
        match self {
            Self::Main => None,
            Self::Branch(branch) => Some(branch),
        }
    }
}

/// Drives one run's cursors; owns no state of its own
#[derive(Clone, Copy, Debug, Default)]
pub struct StateMachine {
    evaluator: ConditionEvaluator,
    fork_join: ForkJoinCoordinator,
    gate: ValidationGate,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain a freshly created run from its start node
    pub fn launch(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) -> EngineResult<()> {
        let start = run
            .current_node()
            .cloned()
            .ok_or_else(|| EngineError::InvalidTransition("run has no cursor".into()))?;
        let next = template.single_target(&start)?.id.clone();
        self.advance_from(run, template, Lane::Main, next, fx, out, None)
    }

    /// Route one inbound event. Returns the instance id when the event
    /// was a manual trigger.
    pub fn handle_event(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        event: RunEvent,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) -> EngineResult<Option<ValidationInstanceId>> {
        if run.is_terminal() {
            return Err(EngineError::AlreadyFinished(run.id.clone()));
        }
        tracing::debug!(run_id = %run.id, event = event.name(), "event received");

        // Untriggered auto validations re-check prerequisites on every
        // inbound event.
        self.gate.reevaluate(run, template, fx, out)?;

        match event {
            RunEvent::TaskCompleted { branch } => {
                self.advance_past_task(run, template, Lane::from_branch(branch), fx, out)?;
                Ok(None)
            }
            RunEvent::StatusChanged { status, branch } => {
                run.record(
                    None,
                    "status_changed",
                    format!("Trigger task status changed to '{}'", status),
                );
                if status == TaskStatus::Done {
                    let lane = Lane::from_branch(branch);
                    if self.task_cursor(run, template, &lane).is_some() {
                        self.advance_past_task(run, template, lane, fx, out)?;
                    }
                }
                Ok(None)
            }
            RunEvent::ValidationDecided {
                instance,
                outcome,
                comment,
                actor,
            } => {
                let routing = self.gate.apply_decision(
                    run, template, &instance, outcome, comment, &actor,
                )?;
                let handle = match routing.outcome {
                    ValidationOutcome::Approved => HANDLE_VALIDATED,
                    ValidationOutcome::Rejected => HANDLE_REJECTED,
                };
                let next = template.target_via_handle(&routing.node, handle)?.id.clone();
                self.advance_from(
                    run,
                    template,
                    Lane::from_branch(routing.branch),
                    next,
                    fx,
                    out,
                    routing.auto_trigger_next,
                )?;
                Ok(None)
            }
            RunEvent::BranchCompleted { branch } => {
                match self.fork_join.complete_branch(run, template, &branch)? {
                    JoinOutcome::Proceeded(join) => {
                        let next = template.single_target(&join)?.id.clone();
                        self.advance_from(run, template, Lane::Main, next, fx, out, None)?;
                    }
                    JoinOutcome::Waiting(_) => {}
                }
                Ok(None)
            }
            RunEvent::ManualTriggerRequested { node, actor } => {
                let instance = self
                    .gate
                    .trigger_manual(run, template, &node, &actor, fx, out)?;
                Ok(Some(instance))
            }
        }
    }

    /// Chain the main cursor onward from a consumed join node
    pub(crate) fn continue_past_join(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        join: &NodeId,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) -> EngineResult<()> {
        let next = template.single_target(join)?.id.clone();
        self.advance_from(run, template, Lane::Main, next, fx, out, None)
    }

    // ── Event helpers ────────────────────────────────────────────────

    /// The lane's cursor, when it sits on a ready task node
    fn task_cursor(
        &self,
        run: &Run,
        template: &WorkflowTemplate,
        lane: &Lane,
    ) -> Option<NodeId> {
        let cursor = match lane {
            Lane::Main if run.status() == RunStatus::Running => run.current_node().cloned(),
            Lane::Main => None,
            Lane::Branch(branch) => run
                .branch(branch)
                .filter(|b| b.status == BranchStatus::Running)
                .and_then(|b| b.current_node.clone()),
        }?;
        match template.node(&cursor) {
            Ok(node) if node.kind() == NodeKind::Task => Some(cursor),
            _ => None,
        }
    }

    fn advance_past_task(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        lane: Lane,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) -> EngineResult<()> {
        let cursor = self.task_cursor(run, template, &lane).ok_or_else(|| {
            EngineError::InvalidTransition("no ready task at the current cursor".into())
        })?;
        run.record(
            Some(cursor.clone()),
            "task_completed",
            "Task at cursor completed",
        );
        let next = template.single_target(&cursor)?.id.clone();
        self.advance_from(run, template, lane, next, fx, out, None)
    }

    // ── Chaining ─────────────────────────────────────────────────────

    /// Move a lane's cursor to `node_id` and keep advancing through
    /// control nodes until something waits or the run ends.
    ///
    /// `auto_trigger` names a validation node that must trigger on
    /// arrival even in manual mode (an upstream `auto_trigger_next`).
    fn advance_from(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        mut lane: Lane,
        mut node_id: NodeId,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
        auto_trigger: Option<NodeId>,
    ) -> EngineResult<()> {
        loop {
            let node = template.node(&node_id)?;

            // A branch reaching the join completes itself there.
            if let Lane::Branch(branch) = &lane {
                if node.kind() == NodeKind::Join {
                    match self.fork_join.complete_branch(run, template, &branch.clone())? {
                        JoinOutcome::Proceeded(join) => {
                            lane = Lane::Main;
                            node_id = template.single_target(&join)?.id.clone();
                            continue;
                        }
                        JoinOutcome::Waiting(_) => return Ok(()),
                    }
                }
            }

            self.set_cursor(run, &lane, &node_id)?;

            match &node.config {
                NodeConfig::Start => {
                    node_id = template.single_target(&node_id)?.id.clone();
                }
                NodeConfig::End => {
                    if lane != Lane::Main {
                        return Err(EngineError::InvalidTransition(format!(
                            "end node '{}' reached inside a branch",
                            node_id
                        )));
                    }
                    if run.has_active_fork() {
                        return Err(EngineError::InvalidTransition(format!(
                            "end node '{}' reached while branches are active",
                            node_id
                        )));
                    }
                    run.complete(node_id)?;
                    return Ok(());
                }
                NodeConfig::Task(config) => {
                    if let Some(assignee) = &config.assignee {
                        fx.apply_assignment(run, &node_id, assignee)?;
                    }
                    // Wait for a task_completed event.
                    return Ok(());
                }
                NodeConfig::Condition(config) => {
                    let verdict = self.evaluator.evaluate(&config.expression, &run.context);
                    let handle = if verdict {
                        &config.true_handle
                    } else {
                        &config.false_handle
                    };
                    run.record(
                        Some(node_id.clone()),
                        "condition_evaluated",
                        format!("'{}' is {}", config.expression, verdict),
                    );
                    node_id = template.target_via_handle(&node_id, handle)?.id.clone();
                }
                NodeConfig::SubProcess(config) => {
                    run.record(
                        Some(node_id.clone()),
                        "sub_process_passed",
                        format!("Sub-process '{}' marker passed", config.sub_process_id),
                    );
                    node_id = template.single_target(&node_id)?.id.clone();
                }
                NodeConfig::Notification(config) => {
                    out.extend(fx.emit_notifications(run, &node_id, config));
                    node_id = template.single_target(&node_id)?.id.clone();
                }
                NodeConfig::StatusChange(config) => {
                    fx.apply_status_change(run, &node_id, config.status)?;
                    node_id = template.single_target(&node_id)?.id.clone();
                }
                NodeConfig::Assignment(config) => {
                    fx.apply_assignment(run, &node_id, &config.assignee)?;
                    node_id = template.single_target(&node_id)?.id.clone();
                }
                NodeConfig::Validation(config) => {
                    let force = auto_trigger.as_ref() == Some(&node_id);
                    self.gate
                        .arrive(run, node, config, lane.branch(), force, fx, out)?;
                    return Ok(());
                }
                NodeConfig::Fork(_) => {
                    let activated =
                        self.fork_join.activate_branches(run, template, node)?;
                    if activated.is_empty() {
                        // Empty parallel region: skip straight to the join.
                        let join = template.join_for_fork(&node_id).ok_or_else(|| {
                            EngineError::BrokenGraph {
                                workflow: template.id.clone(),
                                detail: format!("fork '{}' reaches no join", node_id),
                            }
                        })?;
                        run.record(
                            Some(node_id.clone()),
                            "fork_skipped",
                            "No branches activated; continuing at the join",
                        );
                        let join_id = join.id.clone();
                        run.set_cursor(join_id.clone(), "Empty fork region skipped")?;
                        lane = Lane::Main;
                        node_id = template.single_target(&join_id)?.id.clone();
                        continue;
                    }
                    for (branch, entry) in activated {
                        self.advance_from(
                            run,
                            template,
                            Lane::Branch(branch),
                            entry,
                            fx,
                            out,
                            None,
                        )?;
                    }
                    return Ok(());
                }
                NodeConfig::Join(_) => {
                    // Only branch cursors reach joins; they are handled
                    // above and the main cursor skips past on consume.
                    return Err(EngineError::InvalidTransition(format!(
                        "main cursor arrived at join '{}'",
                        node_id
                    )));
                }
            }
        }
    }

    fn set_cursor(&self, run: &mut Run, lane: &Lane, node: &NodeId) -> EngineResult<()> {
        match lane {
            Lane::Main => run.set_cursor(node.clone(), "Cursor advanced"),
            Lane::Branch(branch) => {
                let instance = run
                    .branch_mut(branch)
                    .ok_or_else(|| EngineError::BranchNotFound(branch.clone()))?;
                instance.current_node = Some(node.clone());
                run.record(
                    Some(node.clone()),
                    "node_entered",
                    format!("Branch '{}' advanced", branch),
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDirectory, InMemoryTaskStore, RecordingSender, TaskStore};
    use procflow_types::{
        ApproverSpec, BranchMode, BranchSpec, Edge, JoinConfig, Node, RunContext, TaskId,
        TaskNodeConfig, TemplateStatus, TriggerTask, UserId, ValidationConfig,
    };

    struct Fixture {
        tasks: InMemoryTaskStore,
        directory: InMemoryDirectory,
        sender: RecordingSender,
    }

    impl Fixture {
        fn new() -> Self {
            let tasks = InMemoryTaskStore::new();
            tasks.insert(TriggerTask::new(TaskId::new("task-1"), "work"));
            Self {
                tasks,
                directory: InMemoryDirectory::new(),
                sender: RecordingSender::new(),
            }
        }

        fn effects(&self) -> Effects<'_> {
            Effects {
                tasks: &self.tasks,
                directory: &self.directory,
                sender: &self.sender,
            }
        }
    }

    fn start_and_launch(template: &WorkflowTemplate, fixture: &Fixture) -> Run {
        let mut run = Run::start(template, TaskId::new("task-1"), RunContext::new()).unwrap();
        let machine = StateMachine::new();
        let mut out = Vec::new();
        machine
            .launch(&mut run, template, &fixture.effects(), &mut out)
            .unwrap();
        run
    }

    fn linear_template() -> WorkflowTemplate {
        let mut t = WorkflowTemplate::new("linear");
        t.add_node(Node::start("start")).unwrap();
        t.add_node(Node::task("work", TaskNodeConfig::default()))
            .unwrap();
        t.add_node(Node::status_change("mark-done", TaskStatus::Done))
            .unwrap();
        t.add_node(Node::end("end")).unwrap();
        t.add_edge(Edge::new(NodeId::new("start"), NodeId::new("work")))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("work"), NodeId::new("mark-done")))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("mark-done"), NodeId::new("end")))
            .unwrap();
        t.status = TemplateStatus::Active;
        t
    }

    #[test]
    fn test_launch_chains_to_first_waiting_node() {
        let fixture = Fixture::new();
        let template = linear_template();
        let run = start_and_launch(&template, &fixture);
        assert_eq!(run.current_node(), Some(&NodeId::new("work")));
        assert_eq!(run.status(), RunStatus::Running);
    }

    #[test]
    fn test_task_completed_chains_to_end() {
        let fixture = Fixture::new();
        let template = linear_template();
        let mut run = start_and_launch(&template, &fixture);
        let machine = StateMachine::new();
        let mut out = Vec::new();

        machine
            .handle_event(
                &mut run,
                &template,
                RunEvent::TaskCompleted { branch: None },
                &fixture.effects(),
                &mut out,
            )
            .unwrap();

        assert_eq!(run.status(), RunStatus::Completed);
        // The status_change node fired on the way
        assert_eq!(
            fixture.tasks.get(&TaskId::new("task-1")).unwrap().status,
            TaskStatus::Done
        );
    }

    #[test]
    fn test_terminal_run_rejects_events() {
        let fixture = Fixture::new();
        let template = linear_template();
        let mut run = start_and_launch(&template, &fixture);
        let machine = StateMachine::new();
        let mut out = Vec::new();
        machine
            .handle_event(
                &mut run,
                &template,
                RunEvent::TaskCompleted { branch: None },
                &fixture.effects(),
                &mut out,
            )
            .unwrap();

        let err = machine
            .handle_event(
                &mut run,
                &template,
                RunEvent::TaskCompleted { branch: None },
                &fixture.effects(),
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyFinished(_)));
    }

    #[test]
    fn test_unroutable_task_event_rejected_without_mutation() {
        let fixture = Fixture::new();
        let config = ValidationConfig::new(ApproverSpec::User {
            id: UserId::new("boss"),
        });
        let mut t = WorkflowTemplate::new("val");
        t.add_node(Node::start("start")).unwrap();
        t.add_node(Node::validation("approve", config)).unwrap();
        t.add_node(Node::end("end")).unwrap();
        t.add_edge(Edge::new(NodeId::new("start"), NodeId::new("approve")))
            .unwrap();
        t.add_edge(Edge::validated(NodeId::new("approve"), NodeId::new("end")))
            .unwrap();
        t.status = TemplateStatus::Active;

        // Run pauses at the auto validation on launch
        let mut run = start_and_launch(&t, &fixture);
        assert_eq!(run.status(), RunStatus::Paused);

        let machine = StateMachine::new();
        let mut out = Vec::new();
        let err = machine
            .handle_event(
                &mut run,
                &t,
                RunEvent::TaskCompleted { branch: None },
                &fixture.effects(),
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
        assert_eq!(run.status(), RunStatus::Paused);
    }

    #[test]
    fn test_condition_routes_true_and_false() {
        let fixture = Fixture::new();
        let mut t = WorkflowTemplate::new("cond");
        t.add_node(Node::start("start")).unwrap();
        t.add_node(Node::condition("gate", "amount > 100")).unwrap();
        t.add_node(Node::task("big", TaskNodeConfig::default()))
            .unwrap();
        t.add_node(Node::task("small", TaskNodeConfig::default()))
            .unwrap();
        t.add_node(Node::end("end")).unwrap();
        t.add_edge(Edge::new(NodeId::new("start"), NodeId::new("gate")))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("gate"), NodeId::new("big")).with_handle("true"))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("gate"), NodeId::new("small")).with_handle("false"))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("big"), NodeId::new("end")))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("small"), NodeId::new("end")))
            .unwrap();
        t.status = TemplateStatus::Active;

        let machine = StateMachine::new();
        let mut out = Vec::new();

        let mut run = Run::start(
            &t,
            TaskId::new("task-1"),
            RunContext::new().with_field("amount", "500"),
        )
        .unwrap();
        machine
            .launch(&mut run, &t, &fixture.effects(), &mut out)
            .unwrap();
        assert_eq!(run.current_node(), Some(&NodeId::new("big")));

        let mut run = Run::start(
            &t,
            TaskId::new("task-1"),
            RunContext::new().with_field("amount", "50"),
        )
        .unwrap();
        machine
            .launch(&mut run, &t, &fixture.effects(), &mut out)
            .unwrap();
        assert_eq!(run.current_node(), Some(&NodeId::new("small")));
    }

    #[test]
    fn test_zero_activation_fork_skips_to_join() {
        let fixture = Fixture::new();
        let mut t = WorkflowTemplate::new("empty-fork");
        t.add_node(Node::start("start")).unwrap();
        t.add_node(Node::fork(
            "fork",
            BranchMode::Static {
                branches: vec![BranchSpec::new("never").when("department == legal")],
            },
        ))
        .unwrap();
        t.add_node(Node::task("step", TaskNodeConfig::default()))
            .unwrap();
        t.add_node(Node::join("join", JoinConfig::all())).unwrap();
        t.add_node(Node::end("end")).unwrap();
        t.add_edge(Edge::new(NodeId::new("start"), NodeId::new("fork")))
            .unwrap();
        t.add_edge(
            Edge::new(NodeId::new("fork"), NodeId::new("step")).with_handle("never"),
        )
        .unwrap();
        t.add_edge(Edge::new(NodeId::new("step"), NodeId::new("join")))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("join"), NodeId::new("end")))
            .unwrap();
        t.status = TemplateStatus::Active;

        // Context has no legal department: the only branch gates false.
        let run = start_and_launch(&t, &fixture);
        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.log().iter().any(|e| e.action == "fork_skipped"));
    }

    #[test]
    fn test_fork_and_join_full_cycle_via_events() {
        let fixture = Fixture::new();
        let mut t = WorkflowTemplate::new("parallel");
        t.add_node(Node::start("start")).unwrap();
        t.add_node(Node::fork(
            "fork",
            BranchMode::Static {
                branches: vec![BranchSpec::new("x"), BranchSpec::new("y")],
            },
        ))
        .unwrap();
        t.add_node(Node::task("step-x", TaskNodeConfig::default()))
            .unwrap();
        t.add_node(Node::task("step-y", TaskNodeConfig::default()))
            .unwrap();
        t.add_node(Node::join("join", JoinConfig::all())).unwrap();
        t.add_node(Node::end("end")).unwrap();
        t.add_edge(Edge::new(NodeId::new("start"), NodeId::new("fork")))
            .unwrap();
        t.add_edge(
            Edge::new(NodeId::new("fork"), NodeId::new("step-x")).with_handle("x"),
        )
        .unwrap();
        t.add_edge(
            Edge::new(NodeId::new("fork"), NodeId::new("step-y")).with_handle("y"),
        )
        .unwrap();
        t.add_edge(Edge::new(NodeId::new("step-x"), NodeId::new("join")))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("step-y"), NodeId::new("join")))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("join"), NodeId::new("end")))
            .unwrap();
        t.status = TemplateStatus::Active;

        let mut run = start_and_launch(&t, &fixture);
        assert!(run.has_active_fork());
        assert!(run.current_node().is_none());
        // Both branch cursors wait at their task nodes
        assert_eq!(
            run.branch(&BranchId::new("x")).unwrap().current_node,
            Some(NodeId::new("step-x"))
        );

        let machine = StateMachine::new();
        let mut out = Vec::new();
        machine
            .handle_event(
                &mut run,
                &t,
                RunEvent::TaskCompleted {
                    branch: Some(BranchId::new("x")),
                },
                &fixture.effects(),
                &mut out,
            )
            .unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        assert!(run.completed_branches().contains(&BranchId::new("x")));

        machine
            .handle_event(
                &mut run,
                &t,
                RunEvent::TaskCompleted {
                    branch: Some(BranchId::new("y")),
                },
                &fixture.effects(),
                &mut out,
            )
            .unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.active_branches().is_empty());
    }

    #[test]
    fn test_rejection_routes_rejected_handle() {
        let fixture = Fixture::new();
        fixture
            .tasks
            .set_status(&TaskId::new("task-1"), TaskStatus::Done)
            .unwrap();
        let config = ValidationConfig::new(ApproverSpec::User {
            id: UserId::new("boss"),
        });
        let mut t = WorkflowTemplate::new("val");
        t.add_node(Node::start("start")).unwrap();
        t.add_node(Node::validation("approve", config)).unwrap();
        t.add_node(Node::task("rework", TaskNodeConfig::default()))
            .unwrap();
        t.add_node(Node::end("end")).unwrap();
        t.add_edge(Edge::new(NodeId::new("start"), NodeId::new("approve")))
            .unwrap();
        t.add_edge(Edge::validated(NodeId::new("approve"), NodeId::new("end")))
            .unwrap();
        t.add_edge(Edge::rejected(
            NodeId::new("approve"),
            NodeId::new("rework"),
        ))
        .unwrap();
        t.status = TemplateStatus::Active;

        let mut run = start_and_launch(&t, &fixture);
        let instance_id = run
            .validation_for_node(&NodeId::new("approve"))
            .unwrap()
            .id
            .clone();

        let machine = StateMachine::new();
        let mut out = Vec::new();
        machine
            .handle_event(
                &mut run,
                &t,
                RunEvent::ValidationDecided {
                    instance: instance_id,
                    outcome: ValidationOutcome::Rejected,
                    comment: Some("insufficient detail".into()),
                    actor: UserId::new("boss"),
                },
                &fixture.effects(),
                &mut out,
            )
            .unwrap();

        assert_eq!(run.current_node(), Some(&NodeId::new("rework")));
        assert_eq!(run.status(), RunStatus::Running);
    }
}
