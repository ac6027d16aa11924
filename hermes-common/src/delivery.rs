//! Records produced by the outbound path.
//!
//! A [`DeliveryAttempt`] is written once per (message, host) pair and never
//! changed afterwards. [`DomainOutcome`]s collect the attempts made for one
//! recipient domain and a [`DeliveryReport`] aggregates them per message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Address, Domain, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Delivered,
    Deferred,
    Rejected,
    ConnectionFailed,
}

impl AttemptOutcome {
    /// Classify an SMTP reply code.
    ///
    /// 2xx is success, 4xx deferred, 5xx rejected and anything else means
    /// the peer is not speaking SMTP sensibly.
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            200..=299 => Self::Delivered,
            400..=499 => Self::Deferred,
            500..=599 => Self::Rejected,
            _ => Self::ConnectionFailed,
        }
    }

    /// Whether a different host (or a later retry) might do better.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Deferred | Self::ConnectionFailed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Deferred => "deferred",
            Self::Rejected => "rejected",
            Self::ConnectionFailed => "connection-failed",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reply from a remote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub host: String,
    pub port: u16,
    pub outcome: AttemptOutcome,
    pub reply: Option<Reply>,
    pub timestamp: DateTime<Utc>,
}

/// How a single envelope recipient fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub recipient: Address,
    pub outcome: AttemptOutcome,
    pub reply: Option<Reply>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainOutcome {
    pub domain: Domain,
    pub recipients: Vec<RecipientOutcome>,
    /// Every host tried for this domain, in order.
    pub attempts: Vec<DeliveryAttempt>,
    /// Why the domain failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DomainOutcome {
    /// Delivered only when every recipient in the domain was accepted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && !self.recipients.is_empty()
            && self
                .recipients
                .iter()
                .all(|r| r.outcome == AttemptOutcome::Delivered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub domains: Vec<DomainOutcome>,
}

impl DeliveryReport {
    /// `Sent` iff every domain succeeded.
    #[must_use]
    pub fn from_domains(message_id: MessageId, domains: Vec<DomainOutcome>) -> Self {
        let status = if !domains.is_empty() && domains.iter().all(DomainOutcome::is_success) {
            MessageStatus::Sent
        } else {
            MessageStatus::Failed
        };

        Self {
            message_id,
            status,
            domains,
        }
    }

    pub fn attempts(&self) -> impl Iterator<Item = &DeliveryAttempt> {
        self.domains.iter().flat_map(|d| d.attempts.iter())
    }
}
