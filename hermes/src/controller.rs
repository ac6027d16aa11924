use std::{
    path::Path,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use hermes_common::{
    Domain, Signal, compose::OutboundEmail, controller::Controller, delivery::DeliveryReport,
    event::WebhookEvent, internal, logging, tracing,
};
use hermes_delivery::{DeliveryConfig, DeliveryEngine};
use hermes_dkim::{DkimConfig, DkimSigner};
use hermes_smtp::{Inbox, Smtp};
use hermes_webhook::{Dispatcher, WebhookConfig, WebhookDelivery, WebhookService};
use serde::Deserialize;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::memory::Collaborators;

/// Events buffered between producers and the webhook service.
const EVENT_BUFFER: usize = 1024;

/// The whole configuration file.
///
/// ```ron
/// (
///     smtp: (listeners: [(socket: "[::]:25", args: (catch_all: ["inbound.example.com"]))]),
///     delivery: (helo_domain: "mail.example.com"),
///     dkim: (private_key: Some("/etc/hermes/dkim.pem"), domain: Some("example.com")),
///     webhooks: (subscribers: [(url: "https://hooks.example.com/mail")]),
/// )
/// ```
#[derive(Default, Deserialize)]
pub struct Hermes {
    #[serde(alias = "smtp", default)]
    smtp_controller: Controller<Smtp>,
    #[serde(default)]
    delivery: DeliveryConfig,
    #[serde(default)]
    dkim: DkimConfig,
    #[serde(alias = "webhook", default)]
    webhooks: WebhookConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

impl Hermes {
    ///
    /// # Errors
    /// If the file cannot be read or is not a valid configuration.
    ///
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_ron(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    ///
    /// # Errors
    /// If `content` is not a valid configuration.
    ///
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(content)?)
    }

    #[must_use]
    pub const fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    #[must_use]
    pub const fn webhooks(&self) -> &WebhookConfig {
        &self.webhooks
    }

    /// Connect the listeners to `inbox` and validate every section.
    ///
    /// # Errors
    /// On the first section that does not validate.
    pub fn init(&mut self, inbox: &Inbox) -> anyhow::Result<Option<DkimSigner>> {
        self.smtp_controller
            .map_args(|args| args.with_inbox(inbox.clone()));
        self.smtp_controller.init().context("smtp")?;
        self.delivery.route().context("delivery")?;
        self.webhooks.validate().context("webhooks")?;

        DkimSigner::from_config(&self.dkim).context("dkim")
    }

    /// Validate the configuration without starting anything.
    ///
    /// # Errors
    /// If any section is invalid, including an unreadable DKIM key.
    pub fn check(mut self) -> anyhow::Result<()> {
        let collaborators = Collaborators::in_memory(self.webhooks.subscribers.clone());
        self.init(&Inbox::new(collaborators.store))?;
        DeliveryEngine::new(&self.delivery)?;

        Ok(())
    }

    ///
    /// # Errors
    /// If the delivery route is misconfigured.
    ///
    pub fn engine(
        &self,
        signer: Option<DkimSigner>,
        collaborators: &Collaborators,
        events: mpsc::Sender<WebhookEvent>,
    ) -> anyhow::Result<DeliveryEngine> {
        Ok(DeliveryEngine::new(&self.delivery)?
            .with_signer(signer)
            .with_recorder(Arc::clone(&collaborators.recorder))
            .with_events(events))
    }

    fn webhook_service(
        &self,
        collaborators: &Collaborators,
        events: mpsc::Receiver<WebhookEvent>,
    ) -> anyhow::Result<JoinHandle<Vec<WebhookDelivery>>> {
        let dispatcher = Dispatcher::new(&self.webhooks, Arc::clone(&collaborators.directory))?;
        let service = WebhookService::new(Arc::new(dispatcher), events);

        Ok(tokio::spawn(service.serve(SHUTDOWN_BROADCAST.subscribe())))
    }

    /// Run this controller, and everything it controls
    ///
    /// # Errors
    ///
    /// This function will return an error if the configuration does not
    /// validate or a listener fails.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        logging::init();

        let collaborators = Collaborators::in_memory(self.webhooks.subscribers.clone());
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let inbox = Inbox::new(Arc::clone(&collaborators.store)).with_events(events);
        self.init(&inbox)?;
        drop(inbox);

        let webhooks = self.webhook_service(&collaborators, receiver)?;

        internal!(level = INFO, "Controller running");

        let control = self.smtp_controller.control(SHUTDOWN_BROADCAST.subscribe());
        tokio::pin!(control);

        let ret = tokio::select! {
            r = &mut control => r.map_err(anyhow::Error::from),
            r = shutdown() => match r {
                Ok(()) => tokio::select! {
                    r = &mut control => r.map_err(anyhow::Error::from),
                    _ = tokio::signal::ctrl_c() => {
                        internal!(level = WARN, "Forcing shutdown");
                        Ok(())
                    }
                },
                Err(err) => Err(err),
            },
        };

        internal!(level = INFO, "Shutting down...");

        let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

        match webhooks.await {
            Ok(deliveries) => internal!(
                level = INFO,
                "Webhook service stopped after {} deliveries",
                deliveries.len()
            ),
            Err(err) => tracing::error!("Webhook service failed: {err}"),
        }

        ret
    }

    /// Compose `email`, deliver it once and dispatch the resulting event.
    ///
    /// # Errors
    /// If the configuration is invalid, the email cannot be composed, or the
    /// message cannot be signed. A failed delivery is a report, not an error.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn send(self, email: &OutboundEmail) -> anyhow::Result<DeliveryReport> {
        logging::init();

        self.webhooks.validate().context("webhooks")?;
        let signer = DkimSigner::from_config(&self.dkim).context("dkim")?;

        let collaborators = Collaborators::in_memory(self.webhooks.subscribers.clone());
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let engine = self.engine(signer, &collaborators, events)?;
        let webhooks = self.webhook_service(&collaborators, receiver)?;

        let domain = self
            .dkim
            .domain
            .clone()
            .unwrap_or_else(|| Domain::new(&self.delivery.helo_domain));
        let message = email.compose(&domain)?;

        let report = engine.deliver(message).await;
        drop(engine);

        let deliveries = webhooks.await?;
        internal!(level = DEBUG, "{} webhook deliveries made", deliveries.len());

        Ok(report?)
    }
}

#[cfg(test)]
mod tests {
    use hermes_delivery::Route;
    use pretty_assertions::assert_eq;

    use super::Hermes;

    #[test]
    fn empty_configuration_is_direct_mode() {
        let hermes = Hermes::from_ron("()").unwrap();

        assert_eq!(hermes.delivery().helo_domain, "localhost");
        assert!(matches!(hermes.delivery().route().unwrap(), Route::Direct));
        assert_eq!(hermes.webhooks().max_attempts, 3);
    }

    #[test]
    fn sections_are_read() {
        let hermes = Hermes::from_ron(
            r#"(
                smtp: (
                    listeners: [(
                        socket: "127.0.0.1:2525",
                        args: (catch_all: ["inbound.hermes.test"]),
                    )],
                ),
                delivery: (
                    helo_domain: "mail.hermes.test",
                    local_handoff: Some("127.0.0.1:2526"),
                ),
                webhooks: (
                    max_attempts: 5,
                    subscribers: [(url: "http://127.0.0.1:9000/hook", events: [received])],
                ),
            )"#,
        )
        .unwrap();

        assert_eq!(hermes.delivery().helo_domain, "mail.hermes.test");
        assert!(matches!(
            hermes.delivery().route().unwrap(),
            Route::LocalHandoff(target) if target.port == 2526
        ));
        assert_eq!(hermes.webhooks().max_attempts, 5);
        assert_eq!(hermes.webhooks().subscribers.len(), 1);
    }

    #[test]
    fn malformed_configuration_is_an_error() {
        assert!(Hermes::from_ron("(delivery: (helo_domain: 42))").is_err());
    }
}
