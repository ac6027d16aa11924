use futures_util::future::join_all;
use serde::Deserialize;
use tokio::sync::broadcast::Receiver;

use crate::{
    Signal,
    error::{ConfigError, ListenerError},
    internal,
    listener::Listener,
    traits::Protocol,
};

/// Owns every listener for one protocol.
#[derive(Deserialize)]
pub struct Controller<Proto: Protocol> {
    #[serde(alias = "listener", default = "Vec::new")]
    listeners: Vec<Listener<Proto>>,
}

impl<Proto: Protocol> Default for Controller<Proto> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<Proto: Protocol> Controller<Proto> {
    #[must_use]
    pub const fn new(listeners: Vec<Listener<Proto>>) -> Self {
        Self { listeners }
    }

    /// Inject runtime resources that cannot be deserialised into every
    /// listener's arguments.
    pub fn map_args<F>(&mut self, f: F)
    where
        F: Fn(Proto::Args) -> Proto::Args,
    {
        for listener in &mut self.listeners {
            listener.map_args(&f);
        }
    }

    ///
    /// # Errors
    /// If any listener's arguments fail validation.
    ///
    pub fn init(&mut self) -> Result<(), ConfigError> {
        internal!("Initialising Controller for {}", Proto::ty());

        self.listeners.iter_mut().try_for_each(Listener::init)
    }

    ///
    /// # Errors
    /// If any of the listeners have a failure
    ///
    #[tracing::instrument(level = "trace", skip_all, fields(protocol = Proto::ty()))]
    pub async fn control(&self, signal: Receiver<Signal>) -> Result<(), ListenerError> {
        join_all(
            self.listeners
                .iter()
                .map(|l| l.serve(signal.resubscribe())),
        )
        .await
        .into_iter()
        .collect()
    }
}
