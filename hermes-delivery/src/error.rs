//! Failures of an outbound delivery.
//!
//! Errors are split the way the outcome records are: permanent failures
//! (5xx replies, refused credentials, missing TLS) end a domain, temporary
//! ones move on to the next candidate host.

use hermes_common::{
    delivery::{AttemptOutcome, Reply},
    error::{ConfigError, TransportError},
};
use hermes_dkim::DkimError;
use hermes_smtp::client::{ClientError, Response};
use thiserror::Error;

use crate::dns::DnsError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error(transparent)]
    Resolution(#[from] DnsError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Signing(#[from] DkimError),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    /// A 5xx reply to a command every recipient depends on.
    #[error("{stage} rejected: {reply}")]
    Rejected { stage: &'static str, reply: Reply },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS required: {0}")]
    TlsRequired(String),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    /// A 4xx reply to a command every recipient depends on.
    #[error("{stage} deferred: {reply}")]
    Deferred { stage: &'static str, reply: Reply },

    /// A reply outside 2xx/4xx/5xx, or one that could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Temporary(_) => true,
            Self::Resolution(err) => err.is_temporary(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        !self.is_temporary()
    }

    /// The outcome an attempt ending in this error is recorded with.
    #[must_use]
    pub const fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Temporary(TemporaryError::Deferred { .. }) => AttemptOutcome::Deferred,
            Self::Temporary(_) => AttemptOutcome::ConnectionFailed,
            Self::Resolution(err) if err.is_temporary() => AttemptOutcome::Deferred,
            _ => AttemptOutcome::Rejected,
        }
    }

    /// The server reply behind the failure, if there was one.
    #[must_use]
    pub const fn reply(&self) -> Option<&Reply> {
        match self {
            Self::Permanent(PermanentError::Rejected { reply, .. })
            | Self::Temporary(TemporaryError::Deferred { reply, .. }) => Some(reply),
            _ => None,
        }
    }

    /// Turn a reply to `stage` into an error unless it is a 2xx.
    ///
    /// # Errors
    /// For any reply other than 2xx.
    pub fn check(stage: &'static str, response: Response) -> Result<Response, Self> {
        match AttemptOutcome::from_code(response.code) {
            AttemptOutcome::Delivered => Ok(response),
            AttemptOutcome::Deferred => Err(TemporaryError::Deferred {
                stage,
                reply: to_reply(&response),
            }
            .into()),
            AttemptOutcome::Rejected => Err(PermanentError::Rejected {
                stage,
                reply: to_reply(&response),
            }
            .into()),
            AttemptOutcome::ConnectionFailed => Err(TemporaryError::Protocol(format!(
                "Unexpected reply to {stage}: {response}"
            ))
            .into()),
        }
    }
}

impl From<ClientError> for DeliveryError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::AuthFailed(reason) => PermanentError::AuthenticationFailed(reason).into(),
            ClientError::TlsError(reason) => TemporaryError::TlsHandshakeFailed(reason).into(),
            err if err.is_transport() => TemporaryError::ConnectionFailed(err.to_string()).into(),
            err => TemporaryError::Protocol(err.to_string()).into(),
        }
    }
}

impl From<DeliveryError> for TransportError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Configuration(err) => Self::Configuration(err),
            DeliveryError::Signing(err) => Self::Configuration(err.into()),
            DeliveryError::Resolution(err) if err.is_temporary() => {
                Self::TransientNetwork(err.to_string())
            }
            DeliveryError::Resolution(err) => Self::Resolution(err.to_string()),
            DeliveryError::Temporary(err) => Self::TransientNetwork(err.to_string()),
            DeliveryError::Permanent(err) => Self::PermanentProtocol(err.to_string()),
        }
    }
}

/// The reply as recorded on attempts and recipient outcomes.
#[must_use]
pub fn to_reply(response: &Response) -> Reply {
    Reply {
        code: response.code,
        text: response.message(),
    }
}
