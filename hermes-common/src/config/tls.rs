//! STARTTLS policy for outbound connections.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Upgrade when the server advertises STARTTLS. If the upgrade fails the
    /// session is retried in plaintext (RFC 3207 §4.1).
    #[default]
    Opportunistic,

    /// Fail the attempt unless the connection can be upgraded.
    Required,

    /// Never upgrade.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub policy: TlsPolicy,

    /// Skip certificate verification. Only meant for test setups with
    /// self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    #[must_use]
    pub const fn required() -> Self {
        Self {
            policy: TlsPolicy::Required,
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            policy: TlsPolicy::Disabled,
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub const fn is_required(&self) -> bool {
        matches!(self.policy, TlsPolicy::Required)
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self.policy, TlsPolicy::Disabled)
    }
}
