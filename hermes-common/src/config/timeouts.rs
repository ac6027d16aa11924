//! Timeouts for SMTP sessions.
//!
//! The receiving side follows the RFC 5321 §4.5.3.2 minimums. The sending
//! side is tighter so that a dead MX host is abandoned quickly and the next
//! one in preference order gets its turn.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub trait TimeoutConfig {
    /// Timeout for a single command/reply round-trip.
    fn command_timeout(&self) -> Duration;

    /// Timeout for transferring message content.
    fn data_timeout(&self) -> Duration;

    /// Upper bound on the whole session.
    fn session_timeout(&self) -> Duration;
}

/// Timeouts for inbound sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Waiting for the next command.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::server_command_secs")]
    pub command_secs: u64,

    /// Waiting for the first chunk after the 354 reply.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::server_data_init_secs")]
    pub data_init_secs: u64,

    /// Waiting for each subsequent chunk of message content.
    ///
    /// Default: 180 seconds
    #[serde(default = "defaults::server_data_block_secs")]
    pub data_block_secs: u64,

    /// Processing time granted after the terminating dot.
    ///
    /// Default: 600 seconds
    #[serde(default = "defaults::server_data_termination_secs")]
    pub data_termination_secs: u64,

    /// Maximum total session length.
    ///
    /// Default: 1800 seconds
    #[serde(default = "defaults::server_connection_secs")]
    pub connection_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::server_command_secs(),
            data_init_secs: defaults::server_data_init_secs(),
            data_block_secs: defaults::server_data_block_secs(),
            data_termination_secs: defaults::server_data_termination_secs(),
            connection_secs: defaults::server_connection_secs(),
        }
    }
}

impl TimeoutConfig for ServerTimeouts {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_block_secs)
    }

    fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_secs)
    }
}

/// Timeouts for outbound sessions.
///
/// Exceeding any of these ends the attempt as `connection-failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Default: 30 seconds
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// Greeting, EHLO, STARTTLS, AUTH, MAIL and RCPT round-trips.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_command_secs")]
    pub command_secs: u64,

    /// Transfer of the message content and the final reply.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::client_data_secs")]
    pub data_secs: u64,

    /// Never fails a delivery on its own.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::client_quit_secs")]
    pub quit_secs: u64,

    /// The whole session, from connect to QUIT.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::client_session_secs")]
    pub session_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            command_secs: defaults::client_command_secs(),
            data_secs: defaults::client_data_secs(),
            quit_secs: defaults::client_quit_secs(),
            session_secs: defaults::client_session_secs(),
        }
    }
}

impl ClientTimeouts {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn quit_timeout(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }
}

impl TimeoutConfig for ClientTimeouts {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }
}

mod defaults {
    pub const fn server_command_secs() -> u64 {
        300
    }
    pub const fn server_data_init_secs() -> u64 {
        120
    }
    pub const fn server_data_block_secs() -> u64 {
        180
    }
    pub const fn server_data_termination_secs() -> u64 {
        600
    }
    pub const fn server_connection_secs() -> u64 {
        1800
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }
    pub const fn client_command_secs() -> u64 {
        30
    }
    pub const fn client_data_secs() -> u64 {
        120
    }
    pub const fn client_quit_secs() -> u64 {
        10
    }
    pub const fn client_session_secs() -> u64 {
        300
    }
}
