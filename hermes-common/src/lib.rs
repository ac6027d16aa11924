//! Shared building blocks for the Hermes transport engine.
//!
//! Everything that more than one of the protocol crates needs lives here: the
//! [`message::Message`] model, addresses, reply codes, the error taxonomy,
//! configuration shared between client and server, logging, and the
//! collaborator traits the engine consumes.

pub mod address;
pub mod compose;
pub mod config;
pub mod controller;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod event;
pub mod listener;
pub mod logging;
pub mod message;
pub mod status;
pub mod traits;

pub use address::Address;
pub use domain::Domain;
pub use message::{Attachment, Headers, Message, MessageId};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
