//! Timeout sweeper: SLA reminders, validation expiry, join timeouts
//!
//! The engine never runs its own clock. An external scheduler calls
//! the sweep with a timestamp and the sweeper reports what it did.
//! Overdue validations get reminders at the configured interval and
//! expire after one full SLA interval past the due date; expiry
//! surfaces the gap, it never decides for the approver. Join timeouts
//! apply the join's configured action.

use crate::effects::Effects;
use crate::fork_join::ForkJoinCoordinator;
use crate::state_machine::StateMachine;
use chrono::{DateTime, Duration, Utc};
use procflow_types::{
    EngineResult, NodeConfig, NodeId, NotificationChannel, NotificationRequest, RunId,
    TimeoutAction, UserId, ValidationInstanceId, WorkflowTemplate,
};
use procflow_types::Run;

/// One thing a timeout sweep did to a run
#[derive(Clone, Debug)]
pub enum TimeoutDecision {
    /// An overdue validation got a reminder
    ValidationReminder {
        run: RunId,
        node: NodeId,
        instance: ValidationInstanceId,
        approver: Option<UserId>,
    },
    /// A validation exhausted its SLA and was closed undecided
    ValidationExpired {
        run: RunId,
        node: NodeId,
        instance: ValidationInstanceId,
    },
    /// A join's branch deadline passed and its action was applied
    JoinTimedOut {
        run: RunId,
        node: NodeId,
        action: TimeoutAction,
    },
}

/// Scans one run for overdue validations and join deadlines
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeoutSweeper {
    fork_join: ForkJoinCoordinator,
    machine: StateMachine,
}

impl TimeoutSweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep one run at `now`. Mutates the run where a deadline
    /// passed and returns every decision taken.
    pub fn sweep(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        now: DateTime<Utc>,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
    ) -> EngineResult<Vec<TimeoutDecision>> {
        let mut decisions = Vec::new();
        if run.is_terminal() {
            return Ok(decisions);
        }
        self.sweep_validations(run, template, now, fx, out, &mut decisions)?;
        self.sweep_join(run, template, now, fx, out, &mut decisions)?;
        Ok(decisions)
    }

    // ── Validations ──────────────────────────────────────────────────

    fn sweep_validations(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        now: DateTime<Utc>,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
        decisions: &mut Vec<TimeoutDecision>,
    ) -> EngineResult<()> {
        struct Overdue {
            instance: ValidationInstanceId,
            node: NodeId,
            due_at: DateTime<Utc>,
            last_reminder_at: Option<DateTime<Utc>>,
            approver: Option<UserId>,
        }

        let overdue: Vec<Overdue> = run
            .open_validations()
            .filter(|v| v.is_triggered())
            .filter_map(|v| {
                v.due_at.filter(|due| now >= *due).map(|due_at| Overdue {
                    instance: v.id.clone(),
                    node: v.node.clone(),
                    due_at,
                    last_reminder_at: v.last_reminder_at,
                    approver: v.approver.clone(),
                })
            })
            .collect();

        for item in overdue {
            let config = match &template.node(&item.node)?.config {
                NodeConfig::Validation(config) => config.clone(),
                _ => continue,
            };

            // Expiry: one full SLA interval past the due date.
            let expired = config
                .sla_hours
                .map(|h| now >= item.due_at + Duration::hours(h))
                .unwrap_or(false);
            if expired {
                if let Some(instance) = run.validation_mut(&item.instance) {
                    instance.expire();
                }
                run.record(
                    Some(item.node.clone()),
                    "validation_expired",
                    "SLA exhausted without a decision",
                );
                tracing::warn!(run_id = %run.id, node = %item.node, "validation expired");
                if let Some(requester) = run.context.requester.clone() {
                    out.push(fx.dispatch(
                        run,
                        &item.node,
                        NotificationChannel::InApp,
                        requester,
                        "Validation expired",
                        "A validation ran out its SLA without a decision",
                    ));
                }
                decisions.push(TimeoutDecision::ValidationExpired {
                    run: run.id.clone(),
                    node: item.node,
                    instance: item.instance,
                });
                continue;
            }

            // Reminders at the configured interval past the due date.
            let interval = match config.reminder_interval_hours {
                Some(hours) => Duration::hours(hours),
                None => continue,
            };
            let remind = match item.last_reminder_at {
                None => true,
                Some(last) => now >= last + interval,
            };
            if !remind {
                continue;
            }
            if let Some(instance) = run.validation_mut(&item.instance) {
                instance.record_reminder(now);
            }
            run.record(
                Some(item.node.clone()),
                "validation_reminder",
                "Decision overdue; reminder sent",
            );
            if let Some(approver) = item.approver.clone() {
                out.push(fx.dispatch(
                    run,
                    &item.node,
                    NotificationChannel::InApp,
                    approver,
                    "Validation overdue",
                    "A workflow step still awaits your decision",
                ));
            }
            decisions.push(TimeoutDecision::ValidationReminder {
                run: run.id.clone(),
                node: item.node,
                instance: item.instance,
                approver: item.approver,
            });
        }
        Ok(())
    }

    // ── Joins ────────────────────────────────────────────────────────

    fn sweep_join(
        &self,
        run: &mut Run,
        template: &WorkflowTemplate,
        now: DateTime<Utc>,
        fx: &Effects<'_>,
        out: &mut Vec<NotificationRequest>,
        decisions: &mut Vec<TimeoutDecision>,
    ) -> EngineResult<()> {
        if !run.has_active_fork() {
            return Ok(());
        }
        // All branches of one region share the same fork node.
        let (fork, earliest) = match run
            .branches()
            .map(|b| (b.fork_node.clone(), b.started_at))
            .min_by_key(|(_, started)| *started)
        {
            Some(pair) => pair,
            None => return Ok(()),
        };
        let join = match template.join_for_fork(&fork) {
            Some(join) => join,
            None => return Ok(()),
        };
        let config = match &join.config {
            NodeConfig::Join(config) => config.clone(),
            _ => return Ok(()),
        };
        let deadline = match config.timeout_hours {
            Some(hours) => earliest + Duration::hours(hours),
            None => return Ok(()),
        };
        if now < deadline {
            return Ok(());
        }
        let join_id = join.id.clone();

        // The Notify action fires once per timeout, not once per sweep.
        let already_reported = run
            .log()
            .iter()
            .any(|e| e.action == "join_timeout" && e.node.as_ref() == Some(&join_id));
        if already_reported && config.on_timeout == TimeoutAction::Notify {
            return Ok(());
        }

        run.record(
            Some(join_id.clone()),
            "join_timeout",
            format!("Branch deadline passed; action is {:?}", config.on_timeout),
        );
        tracing::warn!(
            run_id = %run.id,
            join = %join_id,
            action = ?config.on_timeout,
            "join timed out"
        );

        match config.on_timeout {
            TimeoutAction::Continue => {
                self.fork_join.force_join(run, &join_id)?;
                self.machine
                    .continue_past_join(run, template, &join_id, fx, out)?;
            }
            TimeoutAction::Fail => {
                run.fail("join timed out")?;
            }
            TimeoutAction::Notify => {
                if let Some(requester) = run.context.requester.clone() {
                    out.push(fx.dispatch(
                        run,
                        &join_id,
                        NotificationChannel::InApp,
                        requester,
                        "Parallel branches overdue",
                        "A parallel region missed its deadline and still waits",
                    ));
                }
            }
        }
        decisions.push(TimeoutDecision::JoinTimedOut {
            run: run.id.clone(),
            node: join_id,
            action: config.on_timeout,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDirectory, InMemoryTaskStore, RecordingSender};
    use procflow_types::{
        ApproverSpec, BranchMode, BranchSpec, Edge, JoinConfig, Node, RunContext, RunStatus,
        TaskId, TaskNodeConfig, TemplateStatus, TriggerTask, ValidationConfig, ValidationStatus,
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

    fn validation_template(config: ValidationConfig) -> WorkflowTemplate {
        let mut t = WorkflowTemplate::new("sla-flow");
        t.add_node(Node::start("start")).unwrap();
        t.add_node(Node::validation("approve", config)).unwrap();
        t.add_node(Node::end("end")).unwrap();
        t.add_edge(Edge::new(NodeId::new("start"), NodeId::new("approve")))
            .unwrap();
        t.add_edge(Edge::validated(NodeId::new("approve"), NodeId::new("end")))
            .unwrap();
        t.status = TemplateStatus::Active;
        t
    }

    fn overdue_run(template: &WorkflowTemplate, hours_overdue: i64) -> Run {
        let mut run = Run::start(
            template,
            TaskId::new("task-1"),
            RunContext::new().with_requester(UserId::new("alice")),
        )
        .unwrap();
        run.set_cursor(NodeId::new("approve"), "arrived").unwrap();
        let mut instance =
            procflow_types::ValidationInstance::new(NodeId::new("approve"));
        instance.set_approver(Some(UserId::new("boss")));
        instance.trigger(None, Some(24));
        instance.due_at = Some(Utc::now() - Duration::hours(hours_overdue));
        run.add_validation(instance);
        run.pause("Validation pending").unwrap();
        run
    }

    #[test]
    fn test_not_yet_due_is_untouched() {
        let fixture = Fixture::new();
        let config = ValidationConfig::new(ApproverSpec::User {
            id: UserId::new("boss"),
        })
        .with_sla(24)
        .with_reminders(4);
        let template = validation_template(config);
        let mut run = overdue_run(&template, -10);

        let sweeper = TimeoutSweeper::new();
        let mut out = Vec::new();
        let decisions = sweeper
            .sweep(&mut run, &template, Utc::now(), &fixture.effects(), &mut out)
            .unwrap();
        assert!(decisions.is_empty());
        assert!(out.is_empty());
    }

    #[test]
    fn test_overdue_validation_gets_reminder_at_interval() {
        let fixture = Fixture::new();
        let config = ValidationConfig::new(ApproverSpec::User {
            id: UserId::new("boss"),
        })
        .with_sla(24)
        .with_reminders(4);
        let template = validation_template(config);
        let mut run = overdue_run(&template, 2);

        let sweeper = TimeoutSweeper::new();
        let mut out = Vec::new();
        let now = Utc::now();
        let decisions = sweeper
            .sweep(&mut run, &template, now, &fixture.effects(), &mut out)
            .unwrap();
        assert!(matches!(
            decisions.as_slice(),
            [TimeoutDecision::ValidationReminder { .. }]
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recipient, UserId::new("boss"));

        // Immediately re-sweeping sends nothing; the interval gates it.
        let decisions = sweeper
            .sweep(&mut run, &template, now, &fixture.effects(), &mut out)
            .unwrap();
        assert!(decisions.is_empty());

        // Past the interval a second reminder goes out.
        let decisions = sweeper
            .sweep(
                &mut run,
                &template,
                now + Duration::hours(5),
                &fixture.effects(),
                &mut out,
            )
            .unwrap();
        assert_eq!(decisions.len(), 1);
        let instance = run.validation_for_node(&NodeId::new("approve")).unwrap();
        assert_eq!(instance.reminder_count, 2);
    }

    #[test]
    fn test_expiry_surfaces_without_deciding() {
        let fixture = Fixture::new();
        let config = ValidationConfig::new(ApproverSpec::User {
            id: UserId::new("boss"),
        })
        .with_sla(24);
        let template = validation_template(config);
        // A full SLA interval past due
        let mut run = overdue_run(&template, 25);

        let sweeper = TimeoutSweeper::new();
        let mut out = Vec::new();
        let decisions = sweeper
            .sweep(&mut run, &template, Utc::now(), &fixture.effects(), &mut out)
            .unwrap();
        assert!(matches!(
            decisions.as_slice(),
            [TimeoutDecision::ValidationExpired { .. }]
        ));

        let instance = run.validation_for_node(&NodeId::new("approve")).unwrap();
        assert_eq!(instance.status, ValidationStatus::Expired);
        // The run stays paused; nobody decided anything.
        assert_eq!(run.status(), RunStatus::Paused);
        // Escalation went to the requester
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recipient, UserId::new("alice"));
    }

    fn timed_fork_template(action: TimeoutAction) -> WorkflowTemplate {
        let mut t = WorkflowTemplate::new("timed-fork");
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
        t.add_node(Node::join("join", JoinConfig::all().with_timeout(8, action)))
            .unwrap();
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
        t
    }

    fn forked_run(template: &WorkflowTemplate) -> Run {
        let mut run = Run::start(
            template,
            TaskId::new("task-1"),
            RunContext::new().with_requester(UserId::new("alice")),
        )
        .unwrap();
        let coordinator = ForkJoinCoordinator::new();
        let fork = template.node(&NodeId::new("fork")).unwrap();
        coordinator
            .activate_branches(&mut run, template, fork)
            .unwrap();
        run
    }

    #[test]
    fn test_join_timeout_continue_forces_past() {
        let fixture = Fixture::new();
        let template = timed_fork_template(TimeoutAction::Continue);
        let mut run = forked_run(&template);

        let sweeper = TimeoutSweeper::new();
        let mut out = Vec::new();
        let decisions = sweeper
            .sweep(
                &mut run,
                &template,
                Utc::now() + Duration::hours(9),
                &fixture.effects(),
                &mut out,
            )
            .unwrap();

        assert!(matches!(
            decisions.as_slice(),
            [TimeoutDecision::JoinTimedOut {
                action: TimeoutAction::Continue,
                ..
            }]
        ));
        // Branches were failed, the join consumed, the run finished.
        assert!(run.active_branches().is_empty());
        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.log().iter().any(|e| e.action == "branch_failed"));
    }

    #[test]
    fn test_join_timeout_fail_halts_run() {
        let fixture = Fixture::new();
        let template = timed_fork_template(TimeoutAction::Fail);
        let mut run = forked_run(&template);

        let sweeper = TimeoutSweeper::new();
        let mut out = Vec::new();
        sweeper
            .sweep(
                &mut run,
                &template,
                Utc::now() + Duration::hours(9),
                &fixture.effects(),
                &mut out,
            )
            .unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.failure_reason.as_deref(), Some("join timed out"));
    }

    #[test]
    fn test_join_timeout_notify_fires_once() {
        let fixture = Fixture::new();
        let template = timed_fork_template(TimeoutAction::Notify);
        let mut run = forked_run(&template);

        let sweeper = TimeoutSweeper::new();
        let mut out = Vec::new();
        let late = Utc::now() + Duration::hours(9);
        let decisions = sweeper
            .sweep(&mut run, &template, late, &fixture.effects(), &mut out)
            .unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(out.len(), 1);
        // The region still waits
        assert!(run.has_active_fork());

        // A second sweep does not spam
        let decisions = sweeper
            .sweep(&mut run, &template, late, &fixture.effects(), &mut out)
            .unwrap();
        assert!(decisions.is_empty());
        assert_eq!(out.len(), 1);
    }
}
