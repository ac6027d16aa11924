use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered with a code the current step does not allow.
    #[error("Unexpected SMTP status code: {code} - {message}")]
    UnexpectedResponse { code: u16, message: String },

    #[error("TLS error: {0}")]
    TlsError(String),

    /// No mechanism both sides support, or the credentials were refused.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Whether the failure happened below SMTP, before a reply could be read.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::TlsError(_) | Self::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
