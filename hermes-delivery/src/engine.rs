//! The outbound delivery engine.
//!
//! A message is signed once, split by recipient domain and handed to one
//! task per domain. Each domain walks its candidate hosts in order until
//! every recipient has a final answer or the candidates run out. Every
//! session leaves exactly one [`DeliveryAttempt`] behind.

use std::{fmt, sync::Arc};

use chrono::Utc;
use futures_util::future::join_all;
use hermes_common::{
    Address, Domain, Message, MessageId,
    config::{ClientTimeouts, TimeoutConfig, TlsConfig},
    delivery::{DeliveryAttempt, DeliveryReport, DomainOutcome, RecipientOutcome},
    event::WebhookEvent,
    traits::collaborator::OutcomeRecorder,
    tracing,
};
use hermes_dkim::DkimSigner;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{
    config::{DeliveryConfig, Route, Target},
    dns::{DnsResolver, MailServer, MailServerResolver},
    error::{DeliveryError, TemporaryError},
    smtp_transaction::{SmtpTransaction, TransactionReport, failed_report},
};

enum Targets {
    Resolve(Arc<dyn MailServerResolver>),
    Fixed(Target),
}

pub struct DeliveryEngine {
    route: Route,
    targets: Targets,
    helo_domain: String,
    timeouts: ClientTimeouts,
    tls: TlsConfig,
    signer: Option<Arc<DkimSigner>>,
    recorder: Option<Arc<dyn OutcomeRecorder>>,
    events: Option<mpsc::Sender<WebhookEvent>>,
    /// Append-only.
    attempts: RwLock<Vec<DeliveryAttempt>>,
}

impl fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("route", &self.route)
            .field("helo_domain", &self.helo_domain)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Direct delivery resolves through the system DNS configuration.
    ///
    /// # Errors
    /// If the route is misconfigured or the resolver cannot be built.
    pub fn new(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        Self::build(config, || {
            Ok(Arc::new(DnsResolver::new(&config.dns)?) as Arc<dyn MailServerResolver>)
        })
    }

    /// Like [`Self::new`], with `resolver` answering MX queries in direct
    /// mode.
    ///
    /// # Errors
    /// If the route is misconfigured.
    pub fn with_resolver(
        config: &DeliveryConfig,
        resolver: Arc<dyn MailServerResolver>,
    ) -> Result<Self, DeliveryError> {
        Self::build(config, || Ok(resolver))
    }

    fn build(
        config: &DeliveryConfig,
        resolver: impl FnOnce() -> Result<Arc<dyn MailServerResolver>, DeliveryError>,
    ) -> Result<Self, DeliveryError> {
        let route = config.route()?;
        let targets = match &route {
            Route::Relay(target) | Route::LocalHandoff(target) => Targets::Fixed(target.clone()),
            Route::Direct => Targets::Resolve(resolver()?),
        };

        tracing::info!(route = route.as_str(), "Delivery engine configured");

        Ok(Self {
            route,
            targets,
            helo_domain: config.helo_domain.clone(),
            timeouts: config.timeouts.clone(),
            tls: config.tls,
            signer: None,
            recorder: None,
            events: None,
            attempts: RwLock::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Option<DkimSigner>) -> Self {
        self.signer = signer.map(Arc::new);
        self
    }

    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn OutcomeRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Where `email.sent`/`email.failed` events go.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<WebhookEvent>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub const fn route(&self) -> &Route {
        &self.route
    }

    /// Every attempt made so far, oldest first.
    #[must_use]
    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.attempts.read().clone()
    }

    /// Deliver `message` to all of its recipients.
    ///
    /// The report is also handed to the outcome recorder and turned into an
    /// `email.sent` or `email.failed` event. A failed delivery is a report,
    /// not an error.
    ///
    /// # Errors
    /// Only if the message cannot be signed.
    #[tracing::instrument(
        skip_all,
        fields(message_id = tracing::field::Empty, route = self.route.as_str())
    )]
    pub async fn deliver(&self, mut message: Message) -> Result<DeliveryReport, DeliveryError> {
        let id = message
            .message_id()
            .map_or_else(MessageId::generate, MessageId::new);
        tracing::Span::current().record("message_id", id.as_str());

        if let Some(signer) = &self.signer {
            signer.sign_message(&mut message)?;
        }

        let content = message.to_bytes();
        let domains = join_all(
            group_by_domain(message.recipients())
                .into_iter()
                .map(|(domain, recipients)| {
                    self.deliver_domain(&id, &message, &content, domain, recipients)
                }),
        )
        .await;

        let report = DeliveryReport::from_domains(id, domains);
        tracing::info!(status = ?report.status, domains = report.domains.len(), "Delivery finished");

        if let Some(recorder) = &self.recorder {
            recorder.record_outcome(&report.message_id, &report).await;
        }

        if let Some(events) = &self.events
            && events
                .send(WebhookEvent::outbound(&message, &report))
                .await
                .is_err()
        {
            tracing::warn!("Event channel closed, delivery event dropped");
        }

        Ok(report)
    }

    async fn candidates(&self, domain: &Domain) -> Result<Vec<Target>, DeliveryError> {
        match &self.targets {
            Targets::Fixed(target) => Ok(vec![target.clone()]),
            Targets::Resolve(resolver) => {
                let servers = resolver.resolve_mail_servers(domain).await?;
                Ok(servers.iter().map(|server| self.direct(server)).collect())
            }
        }
    }

    fn direct(&self, server: &MailServer) -> Target {
        Target {
            host: server.host.clone(),
            port: server.port,
            implicit_tls: false,
            tls: self.tls,
            credentials: None,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%domain))]
    async fn deliver_domain(
        &self,
        id: &MessageId,
        message: &Message,
        content: &[u8],
        domain: Domain,
        recipients: Vec<Address>,
    ) -> DomainOutcome {
        let targets = match self.candidates(&domain).await {
            Ok(targets) if !targets.is_empty() => targets,
            Ok(_) => {
                let err = TemporaryError::ConnectionFailed(format!("No candidates for {domain}"));
                return unreachable_domain(domain, &recipients, &err.into());
            }
            Err(err) => {
                tracing::warn!("Resolution failed: {err}");
                return unreachable_domain(domain, &recipients, &err);
            }
        };

        let mut pending = recipients.clone();
        let mut settled: Vec<RecipientOutcome> = Vec::with_capacity(recipients.len());
        let mut retrying: Vec<RecipientOutcome> = Vec::new();
        let mut attempts = Vec::new();
        let mut error = None;

        for target in &targets {
            if pending.is_empty() {
                break;
            }

            let transaction = SmtpTransaction::new(
                target,
                &self.helo_domain,
                message.sender(),
                &pending,
                content,
                &self.timeouts,
            );

            let result =
                match tokio::time::timeout(self.timeouts.session_timeout(), transaction.execute())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TemporaryError::Timeout("session").into()),
                };

            let (report, stop) = match result {
                Ok(report) => {
                    error = None;
                    (report, false)
                }
                Err(err) => {
                    tracing::info!(server = %target.host, "Attempt failed: {err}");
                    let report = failed_report(&err, &pending);
                    let stop = err.is_permanent();
                    error = Some(err.to_string());
                    (report, stop)
                }
            };

            attempts.push(self.record(id, target, &report));

            retrying.clear();
            for outcome in report.recipients {
                if outcome.outcome.is_transient() && !stop {
                    retrying.push(outcome);
                } else {
                    settled.push(outcome);
                }
            }
            pending = retrying.iter().map(|r| r.recipient.clone()).collect();

            if stop {
                break;
            }
        }

        settled.append(&mut retrying);
        settled.sort_by_key(|outcome| recipients.iter().position(|r| *r == outcome.recipient));

        DomainOutcome {
            domain,
            recipients: settled,
            attempts,
            error,
        }
    }

    fn record(&self, id: &MessageId, target: &Target, report: &TransactionReport) -> DeliveryAttempt {
        let attempt = DeliveryAttempt {
            message_id: id.clone(),
            host: target.host.clone(),
            port: target.port,
            outcome: report.outcome,
            reply: report.reply.clone(),
            timestamp: Utc::now(),
        };

        tracing::info!(
            server = %attempt.host,
            port = attempt.port,
            outcome = %attempt.outcome,
            "Delivery attempt recorded"
        );

        self.attempts.write().push(attempt.clone());
        attempt
    }
}

fn unreachable_domain(domain: Domain, recipients: &[Address], err: &DeliveryError) -> DomainOutcome {
    DomainOutcome {
        domain,
        recipients: failed_report(err, recipients).recipients,
        attempts: Vec::new(),
        error: Some(err.to_string()),
    }
}

/// Recipients grouped by domain, in first-seen order, duplicates dropped.
#[must_use]
pub fn group_by_domain(recipients: &[Address]) -> Vec<(Domain, Vec<Address>)> {
    let mut groups: Vec<(Domain, Vec<Address>)> = Vec::new();

    for recipient in recipients {
        match groups
            .iter_mut()
            .find(|(domain, _)| domain == recipient.domain())
        {
            Some((_, members)) if members.contains(recipient) => {}
            Some((_, members)) => members.push(recipient.clone()),
            None => groups.push((recipient.domain().clone(), vec![recipient.clone()])),
        }
    }

    groups
}
