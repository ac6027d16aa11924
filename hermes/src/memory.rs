//! In-process collaborators.
//!
//! Persistence and subscriber management belong to the API layer; when the
//! engine runs on its own these keep everything in memory for the lifetime
//! of the process.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hermes_common::{
    Message, MessageId,
    delivery::DeliveryReport,
    error::StorageError,
    event::EventKind,
    internal,
    traits::collaborator::{MessageStore, OutcomeRecorder, Subscriber, SubscriberDirectory},
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<MessageId, Message>,
}

impl MemoryStore {
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<Message> {
        self.messages.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().map(|entry| entry.value().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store_message(&self, message: Message) -> Result<MessageId, StorageError> {
        let id = MessageId::generate();
        self.messages.insert(id.clone(), message);
        Ok(id)
    }
}

/// The subscribers listed in the configuration.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    subscribers: Vec<Subscriber>,
}

impl StaticDirectory {
    #[must_use]
    pub const fn new(subscribers: Vec<Subscriber>) -> Self {
        Self { subscribers }
    }
}

#[async_trait]
impl SubscriberDirectory for StaticDirectory {
    async fn list_subscribers(&self, kind: EventKind) -> Vec<Subscriber> {
        self.subscribers
            .iter()
            .filter(|subscriber| subscriber.wants(kind))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecorder {
    reports: DashMap<MessageId, DeliveryReport>,
}

impl MemoryRecorder {
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<DeliveryReport> {
        self.reports.get(id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl OutcomeRecorder for MemoryRecorder {
    async fn record_outcome(&self, id: &MessageId, report: &DeliveryReport) {
        internal!(level = DEBUG, "Recording outcome {:?} for {id}", report.status);
        self.reports.insert(id.clone(), report.clone());
    }
}

/// Everything the engine needs from outside, in one place.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub directory: Arc<dyn SubscriberDirectory>,
    pub recorder: Arc<dyn OutcomeRecorder>,
}

impl Collaborators {
    #[must_use]
    pub fn in_memory(subscribers: Vec<Subscriber>) -> Self {
        Self {
            store: Arc::new(MemoryStore::default()),
            directory: Arc::new(StaticDirectory::new(subscribers)),
            recorder: Arc::new(MemoryRecorder::default()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
