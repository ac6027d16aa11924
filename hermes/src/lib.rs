//! The Hermes process: configuration, wiring and lifecycle.
//!
//! [`controller::Hermes`] is deserialised from the RON configuration file and
//! owns the SMTP listeners. At startup it connects them to the in-memory
//! collaborators in [`memory`], starts the webhook service and waits for a
//! termination signal.

pub mod config;
pub mod controller;
pub mod memory;

pub use controller::Hermes;
