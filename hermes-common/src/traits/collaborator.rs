//! Interfaces to the systems around the transport engine.
//!
//! Persistence, subscriber registration and record keeping belong to the API
//! layer. The engine only sees these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Message, MessageId, delivery::DeliveryReport, error::StorageError, event::EventKind,
};

/// Persists a received message.
#[async_trait]
pub trait MessageStore: Send + Sync {
    ///
    /// # Errors
    /// When the message could not be persisted; the sender is then told the
    /// transaction failed.
    ///
    async fn store_message(&self, message: Message) -> Result<MessageId, StorageError>;
}

/// A registered webhook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub url: String,
    /// Used to sign payloads; unsigned when absent.
    #[serde(default)]
    pub secret: Option<String>,
    /// Extra request headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Kinds this endpoint wants. Empty means all of them.
    #[serde(default)]
    pub events: Vec<EventKind>,
}

impl Subscriber {
    #[must_use]
    pub fn wants(&self, kind: EventKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn list_subscribers(&self, kind: EventKind) -> Vec<Subscriber>;
}

/// Receives the final outcome of every outbound message.
#[async_trait]
pub trait OutcomeRecorder: Send + Sync {
    async fn record_outcome(&self, id: &MessageId, report: &DeliveryReport);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_event_filter() {
        let all: Subscriber = serde_json::from_str(r#"{"url": "http://a"}"#).unwrap();
        assert!(all.wants(EventKind::Received));
        assert!(all.wants(EventKind::Failed));

        let some = Subscriber {
            events: vec![EventKind::Sent],
            ..all
        };
        assert!(some.wants(EventKind::Sent));
        assert!(!some.wants(EventKind::Received));
    }
}
