//! The sending side of SMTP: one connection to one host.
//!
//! [`SmtpClient`] exposes each step of the dialogue and leaves the order and
//! the timeouts to the caller. Every step returns the server's [`Response`];
//! a 4xx or 5xx reply is a value, not an error.

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{AuthMechanism, SmtpClient};
