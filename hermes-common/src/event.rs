//! Webhook events.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Message, MessageId,
    delivery::{DeliveryReport, DomainOutcome, MessageStatus},
};

/// Subject used in payloads when a message carries none.
pub const NO_SUBJECT: &str = "No Subject";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "email.received", alias = "received")]
    Received,
    #[serde(rename = "email.sent", alias = "sent")]
    Sent,
    #[serde(rename = "email.failed", alias = "failed")]
    Failed,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "email.received",
            Self::Sent => "email.sent",
            Self::Failed => "email.failed",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MessageStatus> for EventKind {
    fn from(value: MessageStatus) -> Self {
        match value {
            MessageStatus::Sent => Self::Sent,
            MessageStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

/// The `email` object of a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSummary {
    pub id: MessageId,
    pub message_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub status: String,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub text_content: Option<String>,
    pub html_content: Option<String>,
    pub attachments: Vec<AttachmentSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivery: Vec<DomainOutcome>,
}

impl EmailSummary {
    #[must_use]
    pub fn from_message(
        id: MessageId,
        message: &Message,
        direction: Direction,
        status: impl Into<String>,
    ) -> Self {
        let content = message.content();

        Self {
            id,
            message_id: message.message_id().map(ToString::to_string),
            from: message.sender().to_string(),
            to: message.recipients().iter().map(ToString::to_string).collect(),
            subject: message
                .subject()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(NO_SUBJECT)
                .to_string(),
            status: status.into(),
            direction,
            created_at: Utc::now(),
            text_content: content.text,
            html_content: content.html,
            attachments: message
                .attachments()
                .iter()
                .map(|a| AttachmentSummary {
                    filename: a.filename.clone(),
                    content_type: a.content_type.clone(),
                    size: a.size(),
                })
                .collect(),
            delivery: Vec::new(),
        }
    }

    /// Summary of an outbound message, carrying per-domain detail.
    #[must_use]
    pub fn from_report(message: &Message, report: &DeliveryReport) -> Self {
        let status = match report.status {
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        };

        Self {
            delivery: report.domains.clone(),
            ..Self::from_message(
                report.message_id.clone(),
                message,
                Direction::Outbound,
                status,
            )
        }
    }
}

/// An immutable notification handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub email: EmailSummary,
}

impl WebhookEvent {
    #[must_use]
    pub fn new(kind: EventKind, email: EmailSummary) -> Self {
        Self {
            kind,
            created_at: Utc::now(),
            email,
        }
    }

    #[must_use]
    pub fn received(id: MessageId, message: &Message) -> Self {
        Self::new(
            EventKind::Received,
            EmailSummary::from_message(id, message, Direction::Inbound, "received"),
        )
    }

    #[must_use]
    pub fn outbound(message: &Message, report: &DeliveryReport) -> Self {
        Self::new(
            report.status.into(),
            EmailSummary::from_report(message, report),
        )
    }
}
