//! Webhook notifications.
//!
//! Events produced by the listener and the delivery engine are posted as
//! JSON to every interested subscriber, signed with the subscriber's secret
//! and retried with capped exponential backoff.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod service;
pub mod signature;

pub use config::{Backoff, WebhookConfig};
pub use dispatcher::{DeliveryState, Dispatcher, WebhookDelivery};
pub use error::WebhookError;
pub use service::WebhookService;
