//! DKIM signing for outbound mail (RFC 6376, `rsa-sha256`).
//!
//! [`DkimSigner`] is built once at startup from [`DkimConfig`]. Signing is a
//! pure computation over the message; the resulting header is prepended
//! before the message is handed to SMTP.

pub mod canonical;
pub mod error;
pub mod signature;
mod signer;

use std::path::PathBuf;

use hermes_common::Domain;
use serde::Deserialize;

pub use crate::{
    canonical::{Canonicalization, CanonicalizationPair},
    error::DkimError,
    signature::DkimSignature,
    signer::DkimSigner,
};

/// The `dkim` section of the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DkimConfig {
    /// PEM encoded RSA key. Signing is disabled when absent.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Default: `default`
    #[serde(default = "defaults::selector")]
    pub selector: String,
    /// The `d=` domain.
    #[serde(default)]
    pub domain: Option<Domain>,
    #[serde(default)]
    pub canonicalization: CanonicalizationPair,
    /// Default: `from:to:subject:date:message-id`
    #[serde(default = "defaults::signed_headers")]
    pub signed_headers: Vec<String>,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            selector: defaults::selector(),
            domain: None,
            canonicalization: CanonicalizationPair::default(),
            signed_headers: defaults::signed_headers(),
        }
    }
}

pub(crate) mod defaults {
    pub fn selector() -> String {
        String::from("default")
    }

    pub fn signed_headers() -> Vec<String> {
        ["from", "to", "subject", "date", "message-id"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}
