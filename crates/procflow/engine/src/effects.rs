//! Side-effect emitter: the engine's only outward surface
//!
//! Status changes and assignments make exactly one idempotent task
//! call each; notification nodes fan out one request per channel per
//! resolved recipient. Every effect is logged before dispatch, so a
//! crash between log and delivery is detectable and replayable by an
//! external reconciler. The engine never retries delivery.

use crate::collaborators::{Directory, NotificationSender, TaskStore};
use procflow_types::{
    EngineResult, NodeId, NotificationChannel, NotificationConfig, NotificationRequest,
    RecipientSelector, Run, TaskStatus, UserId,
};

/// Borrowed bundle of the collaborator boundaries
#[derive(Clone, Copy)]
pub struct Effects<'a> {
    pub tasks: &'a dyn TaskStore,
    pub directory: &'a dyn Directory,
    pub sender: &'a dyn NotificationSender,
}

impl<'a> Effects<'a> {
    /// Apply a status-change node: one idempotent task write
    pub fn apply_status_change(
        &self,
        run: &mut Run,
        node: &NodeId,
        status: TaskStatus,
    ) -> EngineResult<()> {
        run.record(
            Some(node.clone()),
            "status_change_dispatched",
            format!("Task status set to '{}'", status),
        );
        self.tasks.set_status(&run.trigger, status)?;
        tracing::info!(run_id = %run.id, node = %node, %status, "task status changed");
        Ok(())
    }

    /// Apply an assignment node: one idempotent task write
    pub fn apply_assignment(
        &self,
        run: &mut Run,
        node: &NodeId,
        assignee: &UserId,
    ) -> EngineResult<()> {
        run.record(
            Some(node.clone()),
            "assignment_dispatched",
            format!("Task assigned to '{}'", assignee),
        );
        self.tasks.set_assignee(&run.trigger, assignee)?;
        tracing::info!(run_id = %run.id, node = %node, %assignee, "task assigned");
        Ok(())
    }

    /// Execute a notification node: one request per channel per
    /// resolved recipient. Unresolvable recipients are logged and
    /// skipped; delivery failures are recorded on the request and
    /// never fail the run.
    pub fn emit_notifications(
        &self,
        run: &mut Run,
        node: &NodeId,
        config: &NotificationConfig,
    ) -> Vec<NotificationRequest> {
        let mut requests = Vec::new();
        for selector in &config.recipients {
            let recipient = match self.resolve_recipient(run, selector) {
                Some(user) => user,
                None => {
                    run.record(
                        Some(node.clone()),
                        "recipient_unresolved",
                        format!("Recipient {:?} could not be resolved", selector),
                    );
                    tracing::warn!(run_id = %run.id, node = %node, "notification recipient unresolved");
                    continue;
                }
            };
            for channel in &config.channels {
                requests.push(self.dispatch(
                    run,
                    node,
                    *channel,
                    recipient.clone(),
                    &config.subject,
                    &config.body,
                ));
            }
        }
        requests
    }

    /// Build, log, and dispatch one notification request
    pub fn dispatch(
        &self,
        run: &mut Run,
        node: &NodeId,
        channel: NotificationChannel,
        recipient: UserId,
        subject: &str,
        body: &str,
    ) -> NotificationRequest {
        let mut request = NotificationRequest::new(
            run.id.clone(),
            node.clone(),
            channel,
            recipient,
            subject,
            body,
        );
        // Log before dispatch: a crash past this point is replayable.
        run.record(
            Some(node.clone()),
            "notification_requested",
            format!("{} to '{}': {}", channel, request.recipient, subject),
        );
        match self.sender.send(&request) {
            Ok(()) => request.mark_sent(),
            Err(error) => {
                tracing::warn!(
                    run_id = %run.id,
                    node = %node,
                    %channel,
                    %error,
                    "notification delivery failed"
                );
                run.record(
                    Some(node.clone()),
                    "notification_failed",
                    error.clone(),
                );
                request.mark_failed(error);
            }
        }
        request
    }

    fn resolve_recipient(&self, run: &Run, selector: &RecipientSelector) -> Option<UserId> {
        match selector {
            RecipientSelector::Requester => run.context.requester.clone(),
            RecipientSelector::Assignee => run.context.assignee.clone(),
            RecipientSelector::User { id } => Some(id.clone()),
        }
    }
}
