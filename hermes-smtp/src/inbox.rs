use std::{fmt, sync::Arc};

use hermes_common::{
    Message, MessageId, error::StorageError, event::WebhookEvent, internal,
    traits::collaborator::MessageStore,
};
use tokio::sync::mpsc;

/// Where completed inbound messages go.
///
/// The message is persisted first; `email.received` is only announced once
/// the store has assigned it an id.
#[derive(Clone)]
pub struct Inbox {
    store: Arc<dyn MessageStore>,
    events: Option<mpsc::Sender<WebhookEvent>>,
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl Inbox {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<WebhookEvent>) -> Self {
        self.events = Some(events);
        self
    }

    ///
    /// # Errors
    /// When the store refuses the message. No event is emitted in that case.
    ///
    #[tracing::instrument(level = "debug", skip_all, fields(recipients = message.recipients().len()))]
    pub async fn accept(&self, message: Message) -> Result<MessageId, StorageError> {
        let id = self.store.store_message(message.clone()).await?;
        internal!(level = INFO, "Stored inbound message {id}");

        if let Some(events) = &self.events
            && events.send(WebhookEvent::received(id.clone(), &message)).await.is_err()
        {
            internal!(
                level = WARN,
                "Event channel closed, email.received for {id} dropped"
            );
        }

        Ok(id)
    }
}
