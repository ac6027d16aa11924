use std::{io, path::PathBuf};

use hermes_common::error::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DkimError {
    #[error("Unable to read DKIM key {}: {source}", path.display())]
    KeyUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Neither PKCS#8 nor PKCS#1 PEM, or not an RSA key.
    #[error("Invalid DKIM private key: {0}")]
    InvalidKey(String),

    #[error("DKIM is enabled but {0} is not set")]
    MissingField(&'static str),

    #[error("Unable to compute DKIM signature: {0}")]
    Signing(#[from] rsa::signature::Error),
}

impl DkimError {
    /// Whether the problem lies in the configuration rather than a message.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        !matches!(self, Self::Signing(_))
    }
}

impl From<DkimError> for ConfigError {
    fn from(value: DkimError) -> Self {
        match value {
            DkimError::KeyUnreadable { path, source } => Self::Unreadable { path, source },
            DkimError::MissingField(field) => Self::MissingField(field),
            other => Self::Invalid {
                field: String::from("dkim"),
                reason: other.to_string(),
            },
        }
    }
}
