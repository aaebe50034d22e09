//! Notification requests: the engine's outward message records
//!
//! The engine builds one request per channel per resolved recipient
//! and hands each to the notification sender exactly once. Delivery
//! outcomes are recorded on the request; retries belong to the
//! external sender, never to the engine.

use crate::{NodeId, RunId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery channel of a notification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    InApp,
    Webhook,
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Email => "email",
            Self::InApp => "in_app",
            Self::Webhook => "webhook",
        };
        write!(f, "{}", s)
    }
}

/// Who a notification node addresses, resolved against the run context
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "recipient", rename_all = "snake_case")]
pub enum RecipientSelector {
    /// The run's requester
    Requester,
    /// The run's assignee
    Assignee,
    /// A fixed user
    User { id: UserId },
}

/// Delivery status of a notification request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Built but not yet handed to the sender
    #[default]
    Pending,
    /// Accepted by the sender
    Sent,
    /// Rejected by the sender; see `error`
    Failed,
}

/// One outward notification, built by the side-effect emitter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Unique request id
    pub id: String,
    /// The run that produced this request
    pub run: RunId,
    /// The node whose execution produced it
    pub node: NodeId,
    /// Delivery channel
    pub channel: NotificationChannel,
    /// Resolved recipient
    pub recipient: UserId,
    /// Message subject
    pub subject: String,
    /// Message body
    pub body: String,
    /// Delivery outcome
    pub status: DeliveryStatus,
    /// Sender error, when delivery failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the request was built
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(
        run: RunId,
        node: NodeId,
        channel: NotificationChannel,
        recipient: UserId,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run,
            node,
            channel,
            recipient,
            subject: subject.into(),
            body: body.into(),
            status: DeliveryStatus::Pending,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Record a successful hand-off to the sender
    pub fn mark_sent(&mut self) {
        self.status = DeliveryStatus::Sent;
        self.error = None;
    }

    /// Record a delivery failure; does not fail the owning run
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = DeliveryStatus::Failed;
        self.error = Some(error.into());
    }
}
