//! Outbound delivery.
//!
//! - [`dns`]: MX resolution with a per-domain TTL cache
//! - [`smtp_transaction`]: one SMTP session against one host
//! - [`engine`]: signing, per-domain fan-out, host fallback and reporting

pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod smtp_transaction;

pub use config::{Credentials, DeliveryConfig, RelayConfig, RelaySecurity, Route, Target};
pub use dns::{DnsConfig, DnsError, DnsResolver, MailServer, MailServerResolver, MxCache};
pub use engine::DeliveryEngine;
pub use error::{DeliveryError, PermanentError, TemporaryError};
pub use smtp_transaction::{SmtpTransaction, TransactionReport};
