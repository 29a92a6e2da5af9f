use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::auth::PolicyAction;
use crate::message::InboundMessage;
use crate::metrics::Metrics;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct Notification<'a> {
    id: &'a str,
    action: PolicyAction,
    sender: &'a str,
    recipient: &'a str,
    size_bytes: usize,
}

/// Best-effort notification to the configured downstream endpoint. Fired
/// after the message is persisted; never blocks or fails the acceptance
/// response.
#[derive(Clone)]
pub struct WebhookClient {
    endpoint: Option<Url>,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl WebhookClient {
    pub fn new(endpoint: Option<Url>, max_idle_conns: usize, metrics: Arc<Metrics>) -> WebhookClient {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .pool_max_idle_per_host(max_idle_conns)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        WebhookClient {
            endpoint,
            client,
            metrics,
        }
    }

    /// Spawn the delivery in the background and return immediately.
    pub fn notify(&self, message: &InboundMessage) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        let payload = match serde_json::to_value(Notification {
            id: &message.id,
            action: message.auth.action,
            sender: &message.sender,
            recipient: &message.recipient,
            size_bytes: message.size_bytes,
        }) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let client = self.client.clone();
        let metrics = self.metrics.clone();
        let id = message.id.clone();

        tokio::spawn(async move {
            let result = client.post(endpoint.clone()).json(&payload).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(id, "webhook delivered");
                }
                Ok(response) => {
                    metrics.webhook_failures.inc();
                    warn!(id, status = %response.status(), "webhook rejected notification");
                }
                Err(e) => {
                    metrics.webhook_failures.inc();
                    warn!(id, "webhook delivery failed: {e}");
                }
            }
        });
    }
}
