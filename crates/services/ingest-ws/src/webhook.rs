//! Webhook delivery module
//!
//! Delivers published alerts to configured webhook endpoints with retry
//! logic and exponential backoff. Each endpoint gets a [`WebhookSink`] that
//! queues alerts to a dedicated worker, so deliveries to one endpoint stay in
//! publish order and never hold up the hub.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use crate::alert::Alert;
use crate::config::WebhookConfig;
use crate::metrics::Metrics;
use crate::sink::{AlertSink, SinkError};

/// Upper bound on any single backoff delay
const MAX_BACKOFF_MS: u64 = 10_000;

/// Webhook payload sent to the endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Event type (`alert.medium`, `alert.high`, ...)
    pub event_type: String,

    /// Stream the alert was raised for
    pub source: String,

    /// ISO 8601 timestamp of the alert
    pub timestamp: String,

    /// The alert itself
    pub data: Alert,
}

impl WebhookPayload {
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            event_type: format!("alert.{}", alert.severity.as_str().to_lowercase()),
            source: alert.source.clone(),
            timestamp: alert.timestamp.to_rfc3339(),
            data: alert.clone(),
        }
    }
}

/// Result of a webhook delivery attempt
#[derive(Debug, Clone)]
pub struct WebhookDeliveryResult {
    /// Whether delivery succeeded
    pub success: bool,

    /// HTTP status code (if request completed)
    pub status_code: Option<u16>,

    /// Number of attempts made
    pub attempts: u32,

    /// Error message (if failed)
    pub error: Option<String>,

    /// Total time taken for all attempts
    pub total_duration_ms: u64,
}

/// Webhook sender for delivering alerts to a URL
pub struct WebhookSender {
    client: Client,
    url: String,
    config: WebhookConfig,
    metrics: Arc<Metrics>,
}

impl WebhookSender {
    pub fn new(
        url: String,
        config: WebhookConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            url,
            config,
            metrics,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send an alert to the webhook
    pub async fn send(&self, alert: &Alert) -> WebhookDeliveryResult {
        let payload = WebhookPayload::from_alert(alert);
        self.send_payload(&payload).await
    }

    /// Send a payload to the webhook with retry logic
    pub async fn send_payload(&self, payload: &WebhookPayload) -> WebhookDeliveryResult {
        let start = std::time::Instant::now();
        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = 0;
        let mut last_error: Option<String> = None;
        let mut last_status: Option<u16> = None;

        while attempts < max_attempts {
            attempts += 1;
            self.metrics.webhook_attempted();

            match self.try_send(payload).await {
                Ok(status) if (200..300).contains(&status) => {
                    let duration = start.elapsed().as_millis() as u64;
                    self.metrics.webhook_succeeded();
                    tracing::info!(
                        url = %self.url,
                        event_type = %payload.event_type,
                        status,
                        attempts,
                        duration_ms = duration,
                        "Webhook delivered"
                    );

                    return WebhookDeliveryResult {
                        success: true,
                        status_code: Some(status),
                        attempts,
                        error: None,
                        total_duration_ms: duration,
                    };
                }
                Ok(status) => {
                    last_status = Some(status);
                    last_error = Some(format!("HTTP status {}", status));

                    if !is_retryable_status(status) {
                        tracing::warn!(
                            url = %self.url,
                            event_type = %payload.event_type,
                            status,
                            "Webhook delivery failed with non-retryable status"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        url = %self.url,
                        event_type = %payload.event_type,
                        attempt = attempts,
                        error = %e,
                        "Webhook delivery attempt failed"
                    );
                    last_error = Some(e.to_string());
                }
            }

            if attempts < max_attempts {
                sleep(Duration::from_millis(self.calculate_backoff(attempts))).await;
            }
        }

        let duration = start.elapsed().as_millis() as u64;
        self.metrics.webhook_failed();

        tracing::error!(
            url = %self.url,
            event_type = %payload.event_type,
            attempts,
            duration_ms = duration,
            error = ?last_error,
            "Webhook delivery failed after all retries"
        );

        WebhookDeliveryResult {
            success: false,
            status_code: last_status,
            attempts,
            error: last_error,
            total_duration_ms: duration,
        }
    }

    async fn try_send(&self, payload: &WebhookPayload) -> Result<u16, reqwest::Error> {
        let response = self
            .client
            .post(&self.url)
            .header("User-Agent", "transitwatch-ingest/1.0")
            .json(payload)
            .send()
            .await?;

        Ok(response.status().as_u16())
    }

    /// Exponential backoff with +/-25% jitter
    fn calculate_backoff(&self, attempt: u32) -> u64 {
        let base = self.config.retry_backoff_ms;
        let exponential = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));

        let jitter_range = (exponential / 4) as i64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        exponential.saturating_add_signed(jitter).min(MAX_BACKOFF_MS)
    }
}

/// Retry on server errors and on timeout / rate-limit client errors
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Alert sink that forwards to a webhook endpoint
///
/// `deliver` only enqueues; the worker task performs the HTTP calls. The
/// sink reports itself closed once the worker has exited.
pub struct WebhookSink {
    id: Uuid,
    url: String,
    queue: mpsc::UnboundedSender<Alert>,
}

impl WebhookSink {
    /// Create the sink and spawn its delivery worker
    pub fn spawn(
        url: String,
        config: WebhookConfig,
        metrics: Arc<Metrics>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), reqwest::Error> {
        let sender = WebhookSender::new(url.clone(), config, metrics)?;
        let (queue, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(sender, rx));

        let sink = Arc::new(Self {
            id: Uuid::new_v4(),
            url,
            queue,
        });
        Ok((sink, handle))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AlertSink for WebhookSink {
    fn id(&self) -> Uuid {
        self.id
    }

    fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        self.queue.send(alert.clone()).map_err(|_| SinkError::Closed)
    }
}

async fn run_worker(sender: WebhookSender, mut rx: mpsc::UnboundedReceiver<Alert>) {
    tracing::info!(url = %sender.url(), "Webhook worker started");

    while let Some(alert) = rx.recv().await {
        sender.send(&alert).await;
    }

    tracing::info!(url = %sender.url(), "Webhook worker stopped");
}
