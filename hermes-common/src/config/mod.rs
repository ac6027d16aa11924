//! Configuration shared between the inbound and outbound sides.
//!
//! - [`timeouts`]: per-operation timeouts for SMTP sessions
//! - [`tls`]: STARTTLS policy for outbound connections

pub mod timeouts;
pub mod tls;

pub use timeouts::{ClientTimeouts, ServerTimeouts, TimeoutConfig};
pub use tls::{TlsConfig, TlsPolicy};
