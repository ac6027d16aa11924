//! HTTP delivery of events to subscribers.
//!
//! Every interested subscriber gets its own sequence of attempts; the
//! sequences run side by side so a slow endpoint holds up nobody else.
//! Within one sequence, attempts are strictly one after another with a
//! capped exponential delay in between.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::join_all;
use hermes_common::{
    MessageId,
    event::{EventKind, WebhookEvent},
    traits::collaborator::{Subscriber, SubscriberDirectory},
    tracing,
};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use crate::{
    config::{Backoff, WebhookConfig},
    error::WebhookError,
    signature::{SIGNATURE_HEADER, sign},
};

pub const USER_AGENT: &str = "Hermes-Email-Service/1.0";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Characters of the response body kept on the delivery record.
pub const RESPONSE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Succeeded,
    Failed,
}

/// One event to one subscriber. Terminal once `state` leaves `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookDelivery {
    pub event: EventKind,
    pub message_id: MessageId,
    pub endpoint: String,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_status: Option<u16>,
    /// Truncated to [`RESPONSE_LIMIT`] characters.
    pub last_response: Option<String>,
    pub last_error: Option<String>,
    /// Only set while a retry is scheduled.
    pub next_retry: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    fn new(event: &WebhookEvent, endpoint: &str) -> Self {
        Self {
            event: event.kind,
            message_id: event.email.id.clone(),
            endpoint: endpoint.to_string(),
            state: DeliveryState::Pending,
            attempts: 0,
            last_status: None,
            last_response: None,
            last_error: None,
            next_retry: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == DeliveryState::Succeeded
    }
}

pub struct Dispatcher {
    client: reqwest::Client,
    directory: Arc<dyn SubscriberDirectory>,
    max_attempts: u32,
    backoff: Backoff,
}

impl Dispatcher {
    ///
    /// # Errors
    /// If the HTTP client cannot be created.
    ///
    pub fn new(
        config: &WebhookConfig,
        directory: Arc<dyn SubscriberDirectory>,
    ) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(WebhookError::Client)?;

        Ok(Self {
            client,
            directory,
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
        })
    }

    /// Deliver `event` to every subscriber interested in its kind.
    ///
    /// # Errors
    /// Only if the event cannot be serialised. Failed deliveries are
    /// reported in the returned records.
    #[tracing::instrument(skip_all, fields(event = event.kind.as_str(), id = %event.email.id))]
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<Vec<WebhookDelivery>, WebhookError> {
        let subscribers: Vec<Subscriber> = self
            .directory
            .list_subscribers(event.kind)
            .await
            .into_iter()
            .filter(|subscriber| subscriber.wants(event.kind))
            .collect();

        if subscribers.is_empty() {
            tracing::debug!("No subscribers");
            return Ok(Vec::new());
        }

        let body = serde_json::to_vec(event)?;
        Ok(join_all(
            subscribers
                .iter()
                .map(|subscriber| self.deliver(event, &body, subscriber)),
        )
        .await)
    }

    async fn deliver(
        &self,
        event: &WebhookEvent,
        body: &[u8],
        subscriber: &Subscriber,
    ) -> WebhookDelivery {
        let mut delivery = WebhookDelivery::new(event, &subscriber.url);

        let headers = match request_headers(event.kind, body, subscriber) {
            Ok(headers) => headers,
            Err(err) => {
                tracing::warn!(endpoint = %subscriber.url, "Not delivering: {err}");
                delivery.state = DeliveryState::Failed;
                delivery.last_error = Some(err.to_string());
                return delivery;
            }
        };

        for attempt in 1..=self.max_attempts {
            delivery.attempts = attempt;
            delivery.next_retry = None;

            let error = match self.attempt(&subscriber.url, headers.clone(), body).await {
                Ok((status, response)) => {
                    delivery.last_status = Some(status);
                    delivery.last_response = Some(response.chars().take(RESPONSE_LIMIT).collect());
                    delivery.last_error = None;

                    if (200..300).contains(&status) {
                        tracing::info!(endpoint = %subscriber.url, attempt, status, "Webhook delivered");
                        delivery.state = DeliveryState::Succeeded;
                        return delivery;
                    }

                    WebhookError::Status { status }
                }
                Err(err) => {
                    delivery.last_status = None;
                    delivery.last_response = None;
                    err
                }
            };

            delivery.last_error = Some(error.to_string());

            if attempt == self.max_attempts || !error.is_retryable() {
                break;
            }

            let delay = self.backoff.delay(attempt);
            delivery.next_retry = TimeDelta::from_std(delay).ok().map(|delay| Utc::now() + delay);
            tracing::info!(
                endpoint = %subscriber.url,
                attempt,
                ?delay,
                "Webhook attempt failed: {error}"
            );
            tokio::time::sleep(delay).await;
        }

        tracing::warn!(
            endpoint = %subscriber.url,
            attempts = delivery.attempts,
            "Webhook delivery failed permanently"
        );
        delivery.state = DeliveryState::Failed;
        delivery.next_retry = None;
        delivery
    }

    async fn attempt(
        &self,
        url: &str,
        headers: HeaderMap,
        body: &[u8],
    ) -> Result<(u16, String), WebhookError> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body.to_vec())
            .send()
            .await
            .map_err(WebhookError::Request)?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

fn request_headers(
    kind: EventKind,
    body: &[u8],
    subscriber: &Subscriber,
) -> Result<HeaderMap, WebhookError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static("x-webhook-event"),
        HeaderValue::from_static(kind.as_str()),
    );

    for (name, value) in &subscriber.headers {
        let invalid = |reason: String| WebhookError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| invalid(err.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|err| invalid(err.to_string()))?;
        headers.insert(name, value);
    }

    if let Some(secret) = &subscriber.secret {
        let signature = sign(secret, body)?;
        let value = HeaderValue::from_str(&signature).map_err(|err| WebhookError::InvalidHeader {
            name: SIGNATURE_HEADER.to_string(),
            reason: err.to_string(),
        })?;
        headers.insert(HeaderName::from_static("x-webhook-signature"), value);
    }

    Ok(headers)
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use hermes_common::{event::EventKind, traits::collaborator::Subscriber};

    use super::{EVENT_HEADER, request_headers};
    use crate::signature::{SIGNATURE_HEADER, verify};

    fn subscriber() -> Subscriber {
        Subscriber {
            url: String::from("http://127.0.0.1/hook"),
            secret: None,
            headers: vec![(String::from("X-Api-Key"), String::from("k-123"))],
            events: Vec::new(),
        }
    }

    #[test]
    fn unsigned_without_secret() {
        let headers = request_headers(EventKind::Sent, b"{}", &subscriber()).unwrap();

        assert_eq!(headers[EVENT_HEADER], "email.sent");
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["x-api-key"], "k-123");
        assert!(!headers.contains_key(SIGNATURE_HEADER));
    }

    #[test]
    fn signed_with_secret() {
        let subscriber = Subscriber {
            secret: Some(String::from("s3cret")),
            ..subscriber()
        };
        let headers = request_headers(EventKind::Failed, b"{\"a\":1}", &subscriber).unwrap();

        let signature = headers[SIGNATURE_HEADER].to_str().unwrap();
        assert!(signature.starts_with("sha256="));
        assert!(verify("s3cret", b"{\"a\":1}", signature));
    }

    #[test]
    fn invalid_static_header() {
        let subscriber = Subscriber {
            headers: vec![(String::from("Bad Header"), String::from("x"))],
            ..subscriber()
        };

        assert!(request_headers(EventKind::Sent, b"{}", &subscriber).is_err());
    }
}
