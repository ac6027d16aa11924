use std::time::Duration;

use chrono::Utc;
use hermes_common::{
    Address, Message, MessageId, Signal, error::SessionError, error::StorageError, incoming,
    internal, traits::fsm::FiniteStateMachine, tracing,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::{codec, command::Command, state::State};

/// RFC 5321 §4.5.3.1.4 allows 512; be lenient with long ESMTP parameters.
const MAX_COMMAND_LINE: usize = 2048;

/// RFC 5321 §4.5.3.1.6 allows 1000 including CRLF.
const MAX_TEXT_LINE: usize = 4096;

enum Read {
    Line(Vec<u8>),
    Eof,
    Shutdown,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Read one line, giving up on shutdown or once `timeout_secs` pass.
    async fn read(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
        timeout_secs: u64,
        limit: usize,
    ) -> Result<Read, SessionError> {
        let mut line = Vec::new();

        tokio::select! {
            _ = signal.recv() => Ok(Read::Shutdown),
            result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                self.connection.read_line(&mut line, limit),
            ) => match result {
                Err(_) => {
                    tracing::warn!(
                        peer = %self.peer,
                        state = %self.state,
                        timeout_secs,
                        "Client connection timed out"
                    );
                    Err(SessionError::Timeout(timeout_secs))
                }
                Ok(Err(err)) => {
                    internal!("Error: {err}");
                    Err(SessionError::Protocol(err.to_string()))
                }
                Ok(Ok(0)) => Ok(Read::Eof),
                Ok(Ok(_)) => Ok(Read::Line(line)),
            }
        }
    }

    /// Read and act on the next command.
    pub(super) async fn receive_command(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let timeout_secs = self.get_timeout_secs(false);

        match self.read(signal, timeout_secs, MAX_COMMAND_LINE).await? {
            Read::Shutdown => {
                self.state = self.state.shutdown(&mut self.context);
            }
            Read::Eof => {
                internal!("Client closed the connection");
                self.state = State::Closed;
            }
            Read::Line(line) if line.len() >= MAX_COMMAND_LINE && !line.ends_with(b"\n") => {
                let dropped = self
                    .connection
                    .discard_line()
                    .await
                    .map_err(|err| SessionError::Protocol(err.to_string()))?;
                internal!(
                    level = WARN,
                    "Command line from {} exceeded {MAX_COMMAND_LINE} bytes ({dropped} more dropped)",
                    self.peer
                );
                self.state = self.state.line_too_long(&mut self.context);
            }
            Read::Line(line) => {
                let command = Command::try_from(line.as_slice()).unwrap_or_else(|e| e);
                incoming!("{command}");

                self.state = self.state.transition(command, &mut self.context);
                tracing::debug!("Transitioned to {}", self.state);
            }
        }

        Ok(())
    }

    /// Read message content up to the terminating `.` line, then hand the
    /// message on.
    pub(super) async fn receive_body(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let limit = self.context.max_message_size;
        let mut body = Vec::with_capacity(
            self.context
                .envelope
                .declared_size
                .unwrap_or_default()
                .min(limit),
        );
        let mut first = true;
        let mut at_line_start = true;

        loop {
            let timeout_secs = self.get_timeout_secs(first);
            first = false;

            let line = match self.read(signal, timeout_secs, MAX_TEXT_LINE).await? {
                Read::Line(line) => line,
                Read::Shutdown => {
                    self.state = self.state.shutdown(&mut self.context);
                    return Ok(());
                }
                Read::Eof => {
                    internal!(level = WARN, "Client closed the connection during DATA");
                    self.state = State::Closed;
                    return Ok(());
                }
            };

            let content = if at_line_start {
                codec::unstuff_line(&line)
            } else {
                Some(line.as_slice())
            };
            at_line_start = line.ends_with(b"\n");

            let Some(content) = content else {
                break;
            };

            if limit > 0 && body.len() + content.len() > limit {
                internal!(
                    level = WARN,
                    "Message from {} exceeded {limit} bytes",
                    self.peer
                );
                self.state = self.state.size_exceeded(&mut self.context);
                return Ok(());
            }

            body.extend_from_slice(content);
        }

        self.state = self.state.body_received();

        let timeout_secs = self.get_timeout_secs(false);
        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), self.deliver(body))
            .await
            .unwrap_or_else(|_| {
                Err(StorageError::Unavailable(format!(
                    "Storage did not answer within {timeout_secs} seconds"
                )))
            });

        if let Err(err) = &outcome {
            internal!(level = ERROR, "Unable to accept message: {err}");
        }

        self.state = self.state.message_handled(&outcome, &mut self.context);
        Ok(())
    }

    /// Rebuild the message from the envelope and the unstuffed content.
    async fn deliver(&self, body: Vec<u8>) -> Result<MessageId, StorageError> {
        let Some(inbox) = self.inbox.as_ref() else {
            return Err(StorageError::Unavailable(String::from(
                "No message store configured",
            )));
        };

        let envelope = &self.context.envelope;
        let sender = match &envelope.sender {
            Some(sender) => sender.clone(),
            None => format!("MAILER-DAEMON@{}", self.context.banner)
                .parse::<Address>()
                .map_err(|err| StorageError::Rejected(err.to_string()))?,
        };

        let mut message = Message::from_raw(Some(sender), envelope.recipients.clone(), &body)
            .map_err(|err| StorageError::Rejected(err.to_string()))?;

        message.headers_mut().prepend(
            "Received",
            format!(
                "from {} ({}) by {} with {}; {}",
                self.context.client_id.as_deref().unwrap_or("unknown"),
                self.peer.ip(),
                self.context.banner,
                if self.context.tls_active { "ESMTPS" } else { "ESMTP" },
                Utc::now().format("%a, %d %b %Y %H:%M:%S +0000"),
            ),
        );

        inbox.accept(message).await
    }
}
