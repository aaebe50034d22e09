//! Engine facade: templates, runs, events, sweeps behind one handle
//!
//! Each run lives behind its own mutex, so events against different
//! runs proceed in parallel while events against one run serialize.
//! Two workers completing sibling branches at once both take the lock;
//! neither completion can be lost. The engine owns no clock and no
//! threads; the embedding application calls in.

use crate::collaborators::{Directory, NotificationSender, TaskStore};
use crate::effects::Effects;
use crate::registry::TemplateRegistry;
use crate::state_machine::StateMachine;
use crate::timeouts::{TimeoutDecision, TimeoutSweeper};
use crate::validation_gate::ValidationGate;
use chrono::{DateTime, Utc};
use procflow_types::{
    CanTrigger, EngineError, EngineResult, NodeConfig, NodeId, NotificationRequest,
    PendingManualValidation, Run, RunContext, RunEvent, RunId, RunStatus, TaskId, UserId,
    ValidationInstanceId, WorkflowId, WorkflowTemplate,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// What one event (or run start) did to a run
#[derive(Clone, Debug)]
pub struct AdvanceOutcome {
    pub run: RunId,
    pub status: RunStatus,
    /// Main cursor after advancement; `None` inside a fork region
    /// (individual branch cursors live on the run snapshot)
    pub cursor: Option<NodeId>,
    /// Notifications dispatched while advancing
    pub notifications: Vec<NotificationRequest>,
    /// Set when the event manually triggered a validation
    pub triggered_validation: Option<ValidationInstanceId>,
}

/// The workflow engine. One instance serves every workflow and run.
pub struct WorkflowEngine {
    registry: RwLock<TemplateRegistry>,
    runs: RwLock<HashMap<RunId, Arc<Mutex<Run>>>>,
    tasks: Arc<dyn TaskStore>,
    directory: Arc<dyn Directory>,
    sender: Arc<dyn NotificationSender>,
    machine: StateMachine,
    sweeper: TimeoutSweeper,
}

impl WorkflowEngine {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        directory: Arc<dyn Directory>,
        sender: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            registry: RwLock::new(TemplateRegistry::new()),
            runs: RwLock::new(HashMap::new()),
            tasks,
            directory,
            sender,
            machine: StateMachine::new(),
            sweeper: TimeoutSweeper::new(),
        }
    }

    fn effects(&self) -> Effects<'_> {
        Effects {
            tasks: self.tasks.as_ref(),
            directory: self.directory.as_ref(),
            sender: self.sender.as_ref(),
        }
    }

    // ── Templates ────────────────────────────────────────────────────

    /// Register a template version; the graph is validated here
    pub fn register_template(&self, template: WorkflowTemplate) -> EngineResult<()> {
        self.registry
            .write()
            .map_err(|_| EngineError::LockPoisoned)?
            .register(template)
    }

    pub fn publish_template(&self, id: &WorkflowId, version: u32) -> EngineResult<()> {
        self.registry
            .write()
            .map_err(|_| EngineError::LockPoisoned)?
            .publish(id, version)
    }

    pub fn retire_template(&self, id: &WorkflowId, version: u32) -> EngineResult<()> {
        self.registry
            .write()
            .map_err(|_| EngineError::LockPoisoned)?
            .retire(id, version)
    }

    pub fn template(&self, id: &WorkflowId, version: u32) -> EngineResult<WorkflowTemplate> {
        Ok(self
            .registry
            .read()
            .map_err(|_| EngineError::LockPoisoned)?
            .get(id, version)?
            .clone())
    }

    /// The template a run pinned at start
    fn template_for(&self, run: &Run) -> EngineResult<WorkflowTemplate> {
        self.template(&run.workflow_id, run.workflow_version)
    }

    // ── Runs ─────────────────────────────────────────────────────────

    /// Start a run of a workflow against a trigger task.
    ///
    /// `version: None` resolves the latest Active version; the run pins
    /// whatever it resolved. Advancement chains immediately, so the
    /// outcome already reflects the first waiting node.
    pub fn start_run(
        &self,
        workflow: &WorkflowId,
        version: Option<u32>,
        trigger: TaskId,
        context: RunContext,
    ) -> EngineResult<AdvanceOutcome> {
        let template = {
            let registry = self.registry.read().map_err(|_| EngineError::LockPoisoned)?;
            match version {
                Some(version) => registry.get(workflow, version)?.clone(),
                None => registry.latest_active(workflow)?.clone(),
            }
        };

        let mut run = Run::start(&template, trigger, context)?;
        let mut notifications = Vec::new();
        self.machine
            .launch(&mut run, &template, &self.effects(), &mut notifications)?;
        tracing::info!(
            run_id = %run.id,
            workflow_id = %workflow,
            version = template.version,
            "run started"
        );

        let outcome = AdvanceOutcome {
            run: run.id.clone(),
            status: run.status(),
            cursor: run.current_node().cloned(),
            notifications,
            triggered_validation: None,
        };
        self.runs
            .write()
            .map_err(|_| EngineError::LockPoisoned)?
            .insert(run.id.clone(), Arc::new(Mutex::new(run)));
        Ok(outcome)
    }

    fn run_handle(&self, id: &RunId) -> EngineResult<Arc<Mutex<Run>>> {
        self.runs
            .read()
            .map_err(|_| EngineError::LockPoisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::RunNotFound(id.clone()))
    }

    /// Route one event into a run. Serialized per run by its mutex.
    pub fn advance(&self, id: &RunId, event: RunEvent) -> EngineResult<AdvanceOutcome> {
        let handle = self.run_handle(id)?;
        let mut run = handle.lock().map_err(|_| EngineError::LockPoisoned)?;
        let template = self.template_for(&run)?;

        let mut notifications = Vec::new();
        let triggered_validation = self.machine.handle_event(
            &mut run,
            &template,
            event,
            &self.effects(),
            &mut notifications,
        )?;

        Ok(AdvanceOutcome {
            run: run.id.clone(),
            status: run.status(),
            cursor: run.current_node().cloned(),
            notifications,
            triggered_validation,
        })
    }

    /// Cancel a run: open branches are cancelled, open validations
    /// closed as skipped, and the run goes terminal.
    pub fn cancel_run(&self, id: &RunId, reason: impl Into<String>) -> EngineResult<()> {
        let handle = self.run_handle(id)?;
        let mut run = handle.lock().map_err(|_| EngineError::LockPoisoned)?;
        for branch in run.branches_mut() {
            if branch.is_open() {
                branch.cancel();
            }
        }
        for validation in run.open_validations_mut() {
            validation.skip();
        }
        run.cancel(reason)?;
        tracing::info!(run_id = %id, "run cancelled");
        Ok(())
    }

    /// A point-in-time copy of a run's full state
    pub fn run_snapshot(&self, id: &RunId) -> EngineResult<Run> {
        let handle = self.run_handle(id)?;
        let run = handle.lock().map_err(|_| EngineError::LockPoisoned)?;
        Ok(run.clone())
    }

    /// Runs whose trigger is this task, newest first
    pub fn runs_for_task(&self, task: &TaskId) -> EngineResult<Vec<RunId>> {
        let runs = self.runs.read().map_err(|_| EngineError::LockPoisoned)?;
        let mut found: Vec<(DateTime<Utc>, RunId)> = Vec::new();
        for handle in runs.values() {
            let run = handle.lock().map_err(|_| EngineError::LockPoisoned)?;
            if &run.trigger == task {
                found.push((run.created_at, run.id.clone()));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }

    pub fn active_run_count(&self) -> EngineResult<usize> {
        let runs = self.runs.read().map_err(|_| EngineError::LockPoisoned)?;
        let mut count = 0;
        for handle in runs.values() {
            let run = handle.lock().map_err(|_| EngineError::LockPoisoned)?;
            if !run.is_terminal() {
                count += 1;
            }
        }
        Ok(count)
    }

    // ── Validations ──────────────────────────────────────────────────

    /// Trigger a manual validation; sugar over `advance`
    pub fn trigger_manual_validation(
        &self,
        run: &RunId,
        node: NodeId,
        actor: UserId,
    ) -> EngineResult<AdvanceOutcome> {
        self.advance(run, RunEvent::ManualTriggerRequested { node, actor })
    }

    /// Manual validations a task's runs are parked on, untriggered.
    ///
    /// Computed from cursor positions; there is no stored row to list.
    pub fn pending_manual_validations(
        &self,
        task: &TaskId,
    ) -> EngineResult<Vec<PendingManualValidation>> {
        let gate = ValidationGate::new();
        let mut views = Vec::new();
        for id in self.runs_for_task(task)? {
            let handle = self.run_handle(&id)?;
            let run = handle.lock().map_err(|_| EngineError::LockPoisoned)?;
            if run.is_terminal() {
                continue;
            }
            let template = self.template_for(&run)?;
            for node_id in gate.pending_nodes(&run, &template) {
                let node = template.node(&node_id)?;
                if let NodeConfig::Validation(config) = &node.config {
                    views.push(PendingManualValidation {
                        run: run.id.clone(),
                        node: node_id,
                        label: node.label.clone(),
                        workflow: run.workflow_id.clone(),
                        trigger_allowed_by: config.trigger_allowed_by,
                        approver: config.approver.clone(),
                    });
                }
            }
        }
        Ok(views)
    }

    /// Whether an actor may trigger a run's manual validation now.
    /// Returns a verdict with a reason, never an error, for anything
    /// short of a missing run/node/task.
    pub fn can_trigger(
        &self,
        run_id: &RunId,
        node: &NodeId,
        actor: &UserId,
    ) -> EngineResult<CanTrigger> {
        let handle = self.run_handle(run_id)?;
        let run = handle.lock().map_err(|_| EngineError::LockPoisoned)?;
        let template = self.template_for(&run)?;
        let config = match &template.node(node)?.config {
            NodeConfig::Validation(config) => config.clone(),
            _ => {
                return Err(EngineError::InvalidTransition(format!(
                    "node '{}' is not a validation",
                    node
                )))
            }
        };
        let task = self.tasks.get(&run.trigger)?;
        Ok(ValidationGate::new().check_can_trigger(&task, &run, actor, &config))
    }

    // ── Timeouts ─────────────────────────────────────────────────────

    /// Sweep every active run for SLA and join deadlines at `now`.
    /// Called by an external scheduler; the engine keeps no clock.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> EngineResult<Vec<TimeoutDecision>> {
        let handles: Vec<Arc<Mutex<Run>>> = {
            let runs = self.runs.read().map_err(|_| EngineError::LockPoisoned)?;
            runs.values().cloned().collect()
        };

        let mut decisions = Vec::new();
        for handle in handles {
            let mut run = handle.lock().map_err(|_| EngineError::LockPoisoned)?;
            if run.is_terminal() {
                continue;
            }
            let template = self.template_for(&run)?;
            let mut notifications = Vec::new();
            decisions.extend(self.sweeper.sweep(
                &mut run,
                &template,
                now,
                &self.effects(),
                &mut notifications,
            )?);
        }
        Ok(decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDirectory, InMemoryTaskStore, RecordingSender};
    use procflow_types::{
        BranchStatus, Edge, Node, TaskNodeConfig, TriggerTask, ValidationStatus,
    };

    fn make_engine() -> (Arc<WorkflowEngine>, Arc<InMemoryTaskStore>) {
        let tasks = Arc::new(InMemoryTaskStore::new());
        tasks.insert(TriggerTask::new(TaskId::new("task-1"), "work"));
        let engine = Arc::new(WorkflowEngine::new(
            tasks.clone(),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(RecordingSender::new()),
        ));
        (engine, tasks)
    }

    fn linear_template() -> WorkflowTemplate {
        let mut t = WorkflowTemplate::new("linear");
        t.add_node(Node::start("start")).unwrap();
        t.add_node(Node::task("work", TaskNodeConfig::default()))
            .unwrap();
        t.add_node(Node::end("end")).unwrap();
        t.add_edge(Edge::new(NodeId::new("start"), NodeId::new("work")))
            .unwrap();
        t.add_edge(Edge::new(NodeId::new("work"), NodeId::new("end")))
            .unwrap();
        t
    }

    #[test]
    fn test_start_resolves_latest_active_version() {
        let (engine, _) = make_engine();
        let template = linear_template();
        let workflow = template.id.clone();
        engine.register_template(template.clone()).unwrap();
        engine
            .register_template(template.clone().with_version(2))
            .unwrap();
        engine.publish_template(&workflow, 1).unwrap();
        engine.publish_template(&workflow, 2).unwrap();

        let outcome = engine
            .start_run(&workflow, None, TaskId::new("task-1"), RunContext::new())
            .unwrap();
        let run = engine.run_snapshot(&outcome.run).unwrap();
        assert_eq!(run.workflow_version, 2);
        assert_eq!(outcome.cursor, Some(NodeId::new("work")));
        assert_eq!(engine.active_run_count().unwrap(), 1);
    }

    #[test]
    fn test_start_requires_an_active_version() {
        let (engine, _) = make_engine();
        let template = linear_template();
        let workflow = template.id.clone();
        engine.register_template(template).unwrap();

        let err = engine
            .start_run(&workflow, None, TaskId::new("task-1"), RunContext::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::NoActiveVersion(_)));
    }

    #[test]
    fn test_run_pins_its_version() {
        let (engine, _) = make_engine();
        let template = linear_template();
        let workflow = template.id.clone();
        engine.register_template(template.clone()).unwrap();
        engine.publish_template(&workflow, 1).unwrap();

        let outcome = engine
            .start_run(&workflow, None, TaskId::new("task-1"), RunContext::new())
            .unwrap();

        // A newer version published mid-run changes nothing for it.
        engine
            .register_template(template.with_version(2))
            .unwrap();
        engine.publish_template(&workflow, 2).unwrap();

        let done = engine
            .advance(&outcome.run, RunEvent::TaskCompleted { branch: None })
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        let run = engine.run_snapshot(&outcome.run).unwrap();
        assert_eq!(run.workflow_version, 1);
    }

    #[test]
    fn test_cancel_closes_branches_and_validations() {
        let (engine, _) = make_engine();
        let template = linear_template();
        let workflow = template.id.clone();
        engine.register_template(template).unwrap();
        engine.publish_template(&workflow, 1).unwrap();

        let outcome = engine
            .start_run(&workflow, None, TaskId::new("task-1"), RunContext::new())
            .unwrap();
        engine.cancel_run(&outcome.run, "requester withdrew").unwrap();

        let run = engine.run_snapshot(&outcome.run).unwrap();
        assert_eq!(run.status(), RunStatus::Cancelled);
        assert_eq!(run.failure_reason.as_deref(), Some("requester withdrew"));
        assert!(run
            .branches()
            .all(|b| b.status == BranchStatus::Cancelled || !b.is_open()));
        assert!(run
            .validations()
            .iter()
            .all(|v| v.status != ValidationStatus::Pending));

        // A cancelled run accepts nothing further
        let err = engine
            .advance(&outcome.run, RunEvent::TaskCompleted { branch: None })
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyFinished(_)));
    }

    #[test]
    fn test_unknown_run_is_an_error() {
        let (engine, _) = make_engine();
        assert!(matches!(
            engine.advance(
                &RunId::new("ghost"),
                RunEvent::TaskCompleted { branch: None }
            ),
            Err(EngineError::RunNotFound(_))
        ));
        assert!(matches!(
            engine.run_snapshot(&RunId::new("ghost")),
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[test]
    fn test_runs_for_task_newest_first() {
        let (engine, tasks) = make_engine();
        tasks.insert(TriggerTask::new(TaskId::new("task-2"), "other"));
        let template = linear_template();
        let workflow = template.id.clone();
        engine.register_template(template).unwrap();
        engine.publish_template(&workflow, 1).unwrap();

        let first = engine
            .start_run(&workflow, None, TaskId::new("task-1"), RunContext::new())
            .unwrap();
        let second = engine
            .start_run(&workflow, None, TaskId::new("task-1"), RunContext::new())
            .unwrap();
        engine
            .start_run(&workflow, None, TaskId::new("task-2"), RunContext::new())
            .unwrap();

        let found = engine.runs_for_task(&TaskId::new("task-1")).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&first.run));
        assert!(found.contains(&second.run));
    }
}
