//! Error types shared across the Hermes crates.
//!
//! [`TransportError`] is the coarse classification every component reports
//! failures in. The finer-grained enums below describe what actually went
//! wrong and convert into it.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Coarse failure classes for anything that moves a message.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused, reset or timed out. Eligible for retry.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// A 5xx reply or a malformed envelope. Never retried.
    #[error("Permanent protocol error: {0}")]
    PermanentProtocol(String),

    /// Invalid signing key, unparsable relay settings and the like.
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// No MX or address record for a domain.
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// The message is larger than the configured limit.
    #[error("Message of {size} bytes exceeds the limit of {limit} bytes")]
    Capacity { size: usize, limit: usize },
}

impl TransportError {
    /// Returns `true` if a later attempt might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

/// Errors detected while loading or validating configuration.
///
/// These are only ever raised at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration field is missing.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A configuration value is invalid.
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// A file referenced by the configuration could not be read.
    #[error("Unable to read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that can occur during session handling.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Failed to initialize the session.
    #[error("Session initialization failed: {0}")]
    InitFailed(String),

    /// Protocol error occurred during session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// Session was cancelled (e.g., client disconnected).
    #[error("Session cancelled")]
    Cancelled,

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,

    /// Session timed out.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Cancelled)
    }

    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Errors that can occur in the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),

    /// Protocol arguments did not validate.
    #[error("Invalid listener configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors that can occur while turning received bytes into a [`crate::Message`].
#[derive(Debug, Error)]
pub enum MessageParseError {
    /// The header block could not be parsed.
    #[error("Malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),

    /// Envelope sender or recipients are missing.
    #[error("Incomplete envelope: {0}")]
    IncompleteEnvelope(&'static str),
}

/// Raised by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Message rejected by storage: {0}")]
    Rejected(String),
}
