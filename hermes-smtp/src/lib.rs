//! SMTP for Hermes: the inbound listener protocol and the outbound client.
//!
//! The receiving side is a [`state::State`] machine driven by a
//! [`session::Session`] per connection; completed messages go to an
//! [`inbox::Inbox`]. The sending side is [`client::SmtpClient`].

pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod inbox;
pub mod response;
pub mod session;
pub mod state;

use std::{fmt, net::SocketAddr};

use hermes_common::{
    Domain, Signal,
    config::ServerTimeouts,
    error::{ConfigError, SessionError},
    traits::protocol::{Protocol, SessionHandler},
};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

pub use crate::{
    inbox::Inbox,
    session::{Session, SessionConfig, TlsContext},
    state::State,
};

#[derive(Default, Deserialize)]
pub struct Smtp;

/// Per-listener settings, read from the `args` of an SMTP listener.
#[derive(Clone, Deserialize)]
pub struct SmtpArgs {
    /// Hostname announced in the greeting; `$HOSTNAME` when empty.
    #[serde(default)]
    pub banner: String,
    /// Domains whose every local part is accepted.
    #[serde(default)]
    pub catch_all: Vec<Domain>,
    /// Zero disables the limit.
    ///
    /// Default: 10 MiB
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,
    /// Enables STARTTLS when present.
    #[serde(default)]
    pub tls: Option<TlsContext>,
    #[serde(default)]
    pub timeouts: ServerTimeouts,
    #[serde(skip)]
    acceptor: Option<TlsAcceptor>,
    #[serde(skip)]
    inbox: Option<Inbox>,
}

impl Default for SmtpArgs {
    fn default() -> Self {
        Self {
            banner: String::new(),
            catch_all: Vec::new(),
            max_message_size: defaults::max_message_size(),
            tls: None,
            timeouts: ServerTimeouts::default(),
            acceptor: None,
            inbox: None,
        }
    }
}

impl fmt::Debug for SmtpArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpArgs")
            .field("banner", &self.banner)
            .field("catch_all", &self.catch_all)
            .field("max_message_size", &self.max_message_size)
            .field("tls", &self.tls)
            .field("timeouts", &self.timeouts)
            .field("inbox", &self.inbox)
            .finish_non_exhaustive()
    }
}

impl SmtpArgs {
    #[must_use]
    pub fn builder() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    #[must_use]
    pub fn with_catch_all(mut self, domains: Vec<Domain>) -> Self {
        self.catch_all = domains;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsContext>) -> Self {
        self.tls = tls;
        self
    }

    /// Where accepted messages are handed; set at startup, never configured.
    #[must_use]
    pub fn with_inbox(mut self, inbox: Inbox) -> Self {
        self.inbox = Some(inbox);
        self
    }
}

impl Protocol for Smtp {
    type Session = Session<TcpStream>;
    type Args = SmtpArgs;

    fn ty() -> &'static str {
        "SMTP"
    }

    #[tracing::instrument(level = "trace", skip(self, stream, args))]
    fn handle(&self, stream: TcpStream, peer: SocketAddr, args: &Self::Args) -> Self::Session {
        Session::create(
            stream,
            peer,
            SessionConfig::builder()
                .with_banner(args.banner.clone())
                .with_catch_all(args.catch_all.clone())
                .with_max_message_size(args.max_message_size)
                .with_acceptor(args.acceptor.clone())
                .with_inbox(args.inbox.clone())
                .with_timeouts(args.timeouts.clone())
                .build(),
        )
    }

    #[tracing::instrument(skip(self, args))]
    fn validate(&self, args: &mut Self::Args) -> Result<(), ConfigError> {
        if args.catch_all.is_empty() {
            return Err(ConfigError::MissingField("catch_all"));
        }

        if let Some(tls) = args.tls.as_ref() {
            let acceptor = connection::acceptor(tls).map_err(|err| ConfigError::Invalid {
                field: String::from("tls"),
                reason: err.to_string(),
            })?;
            args.acceptor = Some(acceptor);
        }

        if args.inbox.is_none() {
            tracing::warn!("SMTP listener has no message store, every message will be refused");
        }

        Ok(())
    }
}

impl SessionHandler for Session<TcpStream> {
    async fn run(self, signal: tokio::sync::broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        Self::run(self, signal).await
    }
}

pub(crate) mod defaults {
    pub const fn max_message_size() -> usize {
        10 * 1024 * 1024
    }
}
