use hmac::digest::InvalidLength;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Failed to serialise event: {0}")]
    Serialise(#[from] serde_json::Error),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Unusable signing secret")]
    InvalidSecret(#[from] InvalidLength),

    /// Connection refused, reset or timed out.
    #[error("Request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Anything but a 2xx.
    #[error("Subscriber answered {status}")]
    Status { status: u16 },
}

impl WebhookError {
    /// Whether another attempt might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { .. })
    }
}
