//! One SMTP session against one host.
//!
//! The session carries every recipient of one domain. Recipients the server
//! refuses at `RCPT` are reported individually and do not stop the others;
//! anything that fails for the whole envelope is returned as an error.

use std::time::Duration;

use hermes_common::{
    Address,
    config::{ClientTimeouts, TimeoutConfig},
    delivery::{AttemptOutcome, RecipientOutcome, Reply},
    tracing,
};
use hermes_smtp::client::SmtpClient;

use crate::{
    config::Target,
    error::{DeliveryError, PermanentError, TemporaryError, to_reply},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsNegotiationOutcome {
    Success,
    Skipped,
    /// Opportunistic upgrade failed; start over in plaintext (RFC 3207 §4.1).
    RetryWithoutTls,
}

/// What one session achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReport {
    /// Recorded on the attempt for this host.
    pub outcome: AttemptOutcome,
    pub reply: Option<Reply>,
    /// One entry per recipient handed to the session, in order.
    pub recipients: Vec<RecipientOutcome>,
}

async fn timed<T, E>(
    limit: Duration,
    stage: &'static str,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, DeliveryError>
where
    DeliveryError: From<E>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(DeliveryError::from),
        Err(_) => Err(TemporaryError::Timeout(stage).into()),
    }
}

pub struct SmtpTransaction<'a> {
    target: &'a Target,
    helo_domain: &'a str,
    sender: &'a Address,
    recipients: &'a [Address],
    content: &'a [u8],
    timeouts: &'a ClientTimeouts,
}

impl<'a> SmtpTransaction<'a> {
    #[must_use]
    pub const fn new(
        target: &'a Target,
        helo_domain: &'a str,
        sender: &'a Address,
        recipients: &'a [Address],
        content: &'a [u8],
        timeouts: &'a ClientTimeouts,
    ) -> Self {
        Self {
            target,
            helo_domain,
            sender,
            recipients,
            content,
            timeouts,
        }
    }

    async fn connect_and_greet(&self) -> Result<SmtpClient, DeliveryError> {
        let address = (self.target.host.as_str(), self.target.port);
        let host = self.target.host.clone();
        let accept_invalid = self.target.tls.accept_invalid_certs;

        let connect = async {
            if self.target.implicit_tls {
                SmtpClient::connect_tls(address, host, accept_invalid).await
            } else {
                SmtpClient::connect(address, host)
                    .await
                    .map(|client| client.accept_invalid_certs(accept_invalid))
            }
        };

        let mut client = match tokio::time::timeout(self.timeouts.connect_timeout(), connect).await
        {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => {
                return Err(TemporaryError::ConnectionFailed(format!(
                    "Failed to connect to {}:{}: {err}",
                    self.target.host, self.target.port
                ))
                .into());
            }
            Err(_) => return Err(TemporaryError::Timeout("connect").into()),
        };

        let greeting = timed(
            self.timeouts.command_timeout(),
            "greeting",
            client.read_greeting(),
        )
        .await?;
        DeliveryError::check("greeting", greeting)?;

        Ok(client)
    }

    /// `EHLO`, falling back to `HELO` for servers that refuse it.
    async fn hello(&self, client: &mut SmtpClient) -> Result<(), DeliveryError> {
        let limit = self.timeouts.command_timeout();

        let response = timed(limit, "EHLO", client.ehlo(self.helo_domain)).await?;
        if response.is_success() {
            return Ok(());
        }

        tracing::debug!(response = %response, "EHLO refused, trying HELO");
        let response = timed(limit, "HELO", client.helo(self.helo_domain)).await?;
        DeliveryError::check("HELO", response).map(drop)
    }

    async fn negotiate_tls(
        &self,
        client: &mut SmtpClient,
    ) -> Result<TlsNegotiationOutcome, DeliveryError> {
        let tls = self.target.tls;
        if client.is_tls() || !tls.is_enabled() {
            return Ok(TlsNegotiationOutcome::Skipped);
        }

        if !client.supports("STARTTLS") && !tls.is_required() {
            return Ok(TlsNegotiationOutcome::Skipped);
        }

        let failure = match tokio::time::timeout(self.timeouts.command_timeout(), client.starttls())
            .await
        {
            Ok(Ok(response)) if response.is_success() => None,
            Ok(Ok(response)) => Some(format!("Server rejected STARTTLS: {response}")),
            Ok(Err(err)) => Some(format!("STARTTLS failed: {err}")),
            Err(_) => Some(String::from("STARTTLS timed out")),
        };

        if let Some(reason) = failure {
            if tls.is_required() {
                return Err(PermanentError::TlsRequired(reason).into());
            }

            tracing::info!(
                server = %self.target.host,
                %reason,
                "Opportunistic STARTTLS failed, retrying without TLS"
            );
            return Ok(TlsNegotiationOutcome::RetryWithoutTls);
        }

        self.hello(client).await?;
        tracing::debug!(server = %self.target.host, "TLS negotiated via STARTTLS");
        Ok(TlsNegotiationOutcome::Success)
    }

    async fn open(&self) -> Result<SmtpClient, DeliveryError> {
        let mut client = self.connect_and_greet().await?;
        self.hello(&mut client).await?;

        if self.negotiate_tls(&mut client).await? == TlsNegotiationOutcome::RetryWithoutTls {
            drop(client);
            client = self.connect_and_greet().await?;
            self.hello(&mut client).await?;
        }

        if let Some(credentials) = &self.target.credentials {
            timed(
                self.timeouts.command_timeout(),
                "AUTH",
                client.authenticate(&credentials.user, &credentials.password),
            )
            .await?;
            tracing::debug!(user = %credentials.user, "Authenticated");
        }

        Ok(client)
    }

    /// Run the session to completion.
    ///
    /// # Errors
    /// When the connection fails or the server refuses the envelope as a
    /// whole (greeting, `EHLO`, `STARTTLS`, `AUTH`, `MAIL FROM`, `DATA`).
    #[tracing::instrument(
        level = "info",
        skip(self),
        fields(server = %self.target.host, port = self.target.port, recipients = self.recipients.len())
    )]
    pub async fn execute(self) -> Result<TransactionReport, DeliveryError> {
        if self.target.tls.accept_invalid_certs {
            tracing::warn!(
                server = %self.target.host,
                "TLS certificate validation is disabled for this connection"
            );
        }

        let mut client = self.open().await?;
        let limit = self.timeouts.command_timeout();

        let response = timed(
            limit,
            "MAIL FROM",
            client.mail_from(&self.sender.to_string(), Some(self.content.len())),
        )
        .await?;
        DeliveryError::check("MAIL FROM", response)?;

        let mut recipients = Vec::with_capacity(self.recipients.len());
        let mut last_reply = None;
        for recipient in self.recipients {
            let response = timed(limit, "RCPT TO", client.rcpt_to(&recipient.to_string())).await?;
            let reply = to_reply(&response);
            let outcome = AttemptOutcome::from_code(response.code);

            if outcome != AttemptOutcome::Delivered {
                tracing::info!(%recipient, %reply, "Recipient refused");
            }

            last_reply = Some(reply.clone());
            recipients.push(RecipientOutcome {
                recipient: recipient.clone(),
                outcome,
                reply: Some(reply),
            });
        }

        let accepted = recipients
            .iter()
            .filter(|r| r.outcome == AttemptOutcome::Delivered)
            .count();

        if accepted == 0 {
            self.quit(client).await;

            let outcome = if recipients.iter().any(|r| r.outcome.is_transient()) {
                AttemptOutcome::Deferred
            } else {
                AttemptOutcome::Rejected
            };

            return Ok(TransactionReport {
                outcome,
                reply: last_reply,
                recipients,
            });
        }

        let response = timed(limit, "DATA", client.data()).await?;
        if response.code != 354 {
            DeliveryError::check("DATA", response.clone())?;
            return Err(
                TemporaryError::Protocol(format!("Unexpected reply to DATA: {response}")).into(),
            );
        }

        let response = timed(
            self.timeouts.data_timeout(),
            "message content",
            client.send_data(self.content),
        )
        .await?;
        let reply = to_reply(&response);
        let outcome = AttemptOutcome::from_code(response.code);

        for recipient in recipients
            .iter_mut()
            .filter(|r| r.outcome == AttemptOutcome::Delivered)
        {
            recipient.outcome = outcome;
            recipient.reply = Some(reply.clone());
        }

        tracing::info!(%reply, accepted, "Message content sent");
        self.quit(client).await;

        Ok(TransactionReport {
            outcome,
            reply: Some(reply),
            recipients,
        })
    }

    /// Never fails the delivery.
    async fn quit(&self, mut client: SmtpClient) {
        match tokio::time::timeout(self.timeouts.quit_timeout(), client.quit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::debug!(server = %self.target.host, "QUIT failed: {err}"),
            Err(_) => tracing::debug!(server = %self.target.host, "QUIT timed out"),
        }
    }
}

/// The attempt record for a session that ended in `err`.
#[must_use]
pub fn failed_report(err: &DeliveryError, recipients: &[Address]) -> TransactionReport {
    let outcome = err.outcome();
    let reply = err.reply().cloned();

    TransactionReport {
        outcome,
        reply: reply.clone(),
        recipients: recipients
            .iter()
            .map(|recipient| RecipientOutcome {
                recipient: recipient.clone(),
                outcome,
                reply: reply.clone(),
            })
            .collect(),
    }
}
