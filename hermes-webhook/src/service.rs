//! Consumes events from a channel and dispatches each in its own task.

use std::sync::Arc;

use hermes_common::{Signal, event::WebhookEvent, internal, tracing};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
};

use crate::dispatcher::{Dispatcher, WebhookDelivery};

pub struct WebhookService {
    dispatcher: Arc<Dispatcher>,
    events: mpsc::Receiver<WebhookEvent>,
}

impl WebhookService {
    #[must_use]
    pub const fn new(dispatcher: Arc<Dispatcher>, events: mpsc::Receiver<WebhookEvent>) -> Self {
        Self { dispatcher, events }
    }

    /// Run until every sender is gone or `Signal::Shutdown` arrives, then
    /// wait for dispatches already started.
    ///
    /// Returns the records of every dispatch that ran.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn serve(mut self, mut signal: broadcast::Receiver<Signal>) -> Vec<WebhookDelivery> {
        let mut in_flight = JoinSet::new();
        let mut finished = Vec::new();

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        internal!(level = DEBUG, "Event channel closed");
                        break;
                    };

                    let dispatcher = Arc::clone(&self.dispatcher);
                    in_flight.spawn(async move { dispatcher.dispatch(&event).await });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    collect(joined, &mut finished);
                }
                sig = signal.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "Webhook service shutting down, {} dispatch(es) in flight", in_flight.len());
                        break;
                    }
                }
            }
        }

        self.events.close();
        while let Some(event) = self.events.recv().await {
            let dispatcher = Arc::clone(&self.dispatcher);
            in_flight.spawn(async move { dispatcher.dispatch(&event).await });
        }

        while let Some(joined) = in_flight.join_next().await {
            collect(joined, &mut finished);
        }

        finished
    }
}

fn collect(
    joined: Result<Result<Vec<WebhookDelivery>, crate::WebhookError>, tokio::task::JoinError>,
    finished: &mut Vec<WebhookDelivery>,
) {
    match joined {
        Ok(Ok(deliveries)) => finished.extend(deliveries),
        Ok(Err(err)) => tracing::error!("Dispatch failed: {err}"),
        Err(err) => tracing::error!("Dispatch task panicked: {err}"),
    }
}
