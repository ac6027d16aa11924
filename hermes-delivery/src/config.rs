//! Outbound delivery settings.
//!
//! ```ron
//! delivery: (
//!     helo_domain: "mail.example.com",
//!     relay: Some((
//!         host: "smtp.provider.net",
//!         user: Some("apikey"),
//!         password: Some("secret"),
//!     )),
//!     tls: (policy: opportunistic),
//! )
//! ```
//!
//! A relay with a non-empty host wins over local handoff, which wins over
//! direct MX delivery.

use std::fmt;

use hermes_common::{
    config::{ClientTimeouts, TlsConfig},
    error::ConfigError,
};
use serde::Deserialize;

use crate::dns::DnsConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Name sent in `EHLO`.
    ///
    /// Default: "localhost"
    #[serde(default = "defaults::helo_domain")]
    pub helo_domain: String,

    #[serde(default)]
    pub relay: Option<RelayConfig>,

    /// `host:port` of a local MTA that accepts everything.
    #[serde(default)]
    pub local_handoff: Option<String>,

    #[serde(default)]
    pub timeouts: ClientTimeouts,

    /// STARTTLS behaviour for direct delivery.
    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            helo_domain: defaults::helo_domain(),
            relay: None,
            local_handoff: None,
            timeouts: ClientTimeouts::default(),
            tls: TlsConfig::default(),
            dns: DnsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaySecurity {
    /// Plaintext connect, then a mandatory STARTTLS.
    #[default]
    Starttls,
    /// TLS from the first byte.
    Implicit,
    None,
}

impl RelaySecurity {
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Starttls => 587,
            Self::Implicit => 465,
            Self::None => 25,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub host: String,
    /// Derived from `security` when absent.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub security: RelaySecurity,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// A fixed next hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// TLS from the first byte rather than STARTTLS.
    pub implicit_tls: bool,
    /// STARTTLS behaviour once connected.
    pub tls: TlsConfig,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Look up the MX hosts of every recipient domain.
    Direct,
    Relay(Target),
    LocalHandoff(Target),
}

impl Route {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Relay(_) => "relay",
            Self::LocalHandoff(_) => "local",
        }
    }
}

impl DeliveryConfig {
    /// Decide how mail leaves this process.
    ///
    /// # Errors
    /// If the relay or local handoff settings are inconsistent.
    pub fn route(&self) -> Result<Route, ConfigError> {
        if let Some(relay) = self.relay.as_ref().filter(|relay| !relay.host.is_empty()) {
            return relay.target().map(Route::Relay);
        }

        if let Some(address) = &self.local_handoff {
            let (host, port) = split_host_port(address)?;
            return Ok(Route::LocalHandoff(Target {
                host,
                port,
                implicit_tls: false,
                tls: TlsConfig::disabled(),
                credentials: None,
            }));
        }

        Ok(Route::Direct)
    }
}

impl RelayConfig {
    fn target(&self) -> Result<Target, ConfigError> {
        let port = self.port.unwrap_or_else(|| self.security.default_port());
        if port == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("relay.port"),
                reason: String::from("port must be non-zero"),
            });
        }

        let credentials = match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(Credentials {
                user: user.clone(),
                password: password.clone(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingField("relay.password")),
            (None, Some(_)) => return Err(ConfigError::MissingField("relay.user")),
        };

        let tls = match self.security {
            RelaySecurity::Starttls => TlsConfig::required(),
            RelaySecurity::Implicit | RelaySecurity::None => TlsConfig::disabled(),
        };

        Ok(Target {
            host: self.host.clone(),
            port,
            implicit_tls: self.security == RelaySecurity::Implicit,
            tls: TlsConfig {
                accept_invalid_certs: self.accept_invalid_certs,
                ..tls
            },
            credentials,
        })
    }
}

fn split_host_port(address: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        field: String::from("local_handoff"),
        reason: format!("{reason}: {address}"),
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port = port
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| invalid("invalid port"))?;

    Ok((host.to_string(), port))
}

mod defaults {
    pub fn helo_domain() -> String {
        String::from("localhost")
    }
}

#[cfg(test)]
mod tests {
    use hermes_common::{
        config::{TlsConfig, TlsPolicy},
        error::ConfigError,
    };
    use pretty_assertions::assert_eq;

    use super::{DeliveryConfig, RelaySecurity, Route};

    #[test]
    fn direct_by_default() {
        let config: DeliveryConfig = ron::from_str("()").unwrap();
        assert_eq!(config.helo_domain, "localhost");
        assert_eq!(config.route().unwrap(), Route::Direct);
        assert_eq!(config.tls.policy, TlsPolicy::Opportunistic);
    }

    #[test]
    fn relay_wins_when_host_set() {
        let config: DeliveryConfig = ron::from_str(
            r#"(
                relay: Some((
                    host: "smtp.provider.net",
                    user: Some("apikey"),
                    password: Some("secret"),
                )),
                local_handoff: Some("127.0.0.1:2525"),
            )"#,
        )
        .unwrap();

        let Route::Relay(target) = config.route().unwrap() else {
            panic!("expected relay route");
        };
        assert_eq!(target.host, "smtp.provider.net");
        assert_eq!(target.port, 587);
        assert_eq!(target.tls, TlsConfig::required());
        assert_eq!(target.credentials.unwrap().user, "apikey");
    }

    #[test]
    fn empty_relay_host_falls_through() {
        let config: DeliveryConfig = ron::from_str(
            r#"(
                relay: Some((host: "")),
                local_handoff: Some("[::1]:2525"),
            )"#,
        )
        .unwrap();

        let Route::LocalHandoff(target) = config.route().unwrap() else {
            panic!("expected local handoff");
        };
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 2525);
        assert!(!target.tls.is_enabled());
    }

    #[test]
    fn implicit_tls_port() {
        let config: DeliveryConfig =
            ron::from_str(r#"(relay: Some((host: "relay.test", security: implicit)))"#).unwrap();

        let Route::Relay(target) = config.route().unwrap() else {
            panic!("expected relay route");
        };
        assert_eq!(RelaySecurity::Implicit.default_port(), target.port);
        assert!(target.implicit_tls);
    }

    #[test]
    fn user_without_password_is_invalid() {
        let config: DeliveryConfig =
            ron::from_str(r#"(relay: Some((host: "relay.test", user: Some("me"))))"#).unwrap();

        assert!(matches!(
            config.route(),
            Err(ConfigError::MissingField("relay.password"))
        ));
    }

    #[test]
    fn malformed_handoff_address() {
        let config = DeliveryConfig {
            local_handoff: Some(String::from("localhost")),
            ..DeliveryConfig::default()
        };
        assert!(matches!(config.route(), Err(ConfigError::Invalid { .. })));
    }
}
