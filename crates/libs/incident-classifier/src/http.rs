//! HTTP vision classifier
//!
//! Posts a downscaled JPEG to a vision endpoint and parses the verdict it
//! returns. The request itself is async (`reqwest`); `analyze` bridges it
//! onto the runtime captured at construction, so it must be called from a
//! blocking-capable thread (e.g. inside `tokio::task::spawn_blocking`).

use std::time::Duration;

use image::DynamicImage;
use reqwest::Client;
use serde::Serialize;
use tokio::runtime::Handle;

use crate::verdict::extract_verdict;
use crate::{prepare_frame, Classification, Classifier, ClassifierError};

/// Prompt asking for a compact JSON verdict
pub const DEFAULT_PROMPT: &str = r#"Quick CCTV analysis. JSON only:
{
  "level": "NORMAL|DANGEROUS|CRITICAL",
  "reason": "Brief reason"
}

NORMAL: Normal operations
DANGEROUS: Fights, crowds, suspicious activity
CRITICAL: Weapons, violence, panic"#;

/// HTTP classifier configuration
#[derive(Debug, Clone)]
pub struct HttpClassifierConfig {
    /// Endpoint receiving the classification request
    pub endpoint: String,

    /// Optional model identifier forwarded to the endpoint
    pub model: Option<String>,

    /// Optional bearer token
    pub api_key: Option<String>,

    /// Instruction sent alongside the image
    pub prompt: String,

    /// Request timeout
    pub timeout: Duration,

    /// Frames wider than this are downscaled before upload
    pub max_width: u32,

    /// JPEG quality used for the upload
    pub jpeg_quality: u8,
}

impl HttpClassifierConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: None,
            api_key: None,
            prompt: DEFAULT_PROMPT.to_string(),
            timeout: Duration::from_secs(30),
            max_width: 640,
            jpeg_quality: 60,
        }
    }
}

#[derive(Debug, Serialize)]
struct ImagePayload<'a> {
    media_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
    image: ImagePayload<'a>,
}

/// `Classifier` backed by an HTTP vision endpoint
pub struct HttpClassifier {
    client: Client,
    config: HttpClassifierConfig,
    runtime: Handle,
}

impl HttpClassifier {
    /// Create a classifier bound to the current tokio runtime
    pub fn new(config: HttpClassifierConfig) -> Result<Self, ClassifierError> {
        let runtime = Handle::try_current()
            .map_err(|e| ClassifierError::Runtime(e.to_string()))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClassifierError::Request(e.to_string()))?;

        Ok(Self {
            client,
            config,
            runtime,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    async fn request(&self, body: &ClassifyRequest<'_>) -> Result<String, ClassifierError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("User-Agent", "transitwatch-ingest/1.0")
            .json(body);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Status(status.as_u16()));
        }

        Ok(response.text().await?)
    }
}

impl Classifier for HttpClassifier {
    fn analyze(&self, frame: &DynamicImage) -> Result<Classification, ClassifierError> {
        let prepared = prepare_frame(frame, self.config.max_width, self.config.jpeg_quality)?;

        let body = ClassifyRequest {
            model: self.config.model.as_deref(),
            prompt: &self.config.prompt,
            image: ImagePayload {
                media_type: prepared.media_type,
                data: &prepared.data,
            },
        };

        tracing::debug!(
            endpoint = %self.config.endpoint,
            width = prepared.width,
            height = prepared.height,
            payload_bytes = prepared.data.len(),
            "Sending frame for classification"
        );

        let text = self.runtime.block_on(self.request(&body))?;
        extract_verdict(&text)
    }

    fn name(&self) -> &str {
        "vision-http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_runtime() {
        let result = HttpClassifier::new(HttpClassifierConfig::new("http://localhost:9/classify"));
        assert!(matches!(result, Err(ClassifierError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_new_inside_runtime() {
        let classifier =
            HttpClassifier::new(HttpClassifierConfig::new("http://localhost:9/classify")).unwrap();
        assert_eq!(classifier.endpoint(), "http://localhost:9/classify");
        assert_eq!(classifier.name(), "vision-http");
    }

    #[test]
    fn test_request_serialization() {
        let body = ClassifyRequest {
            model: None,
            prompt: "p",
            image: ImagePayload {
                media_type: "image/jpeg",
                data: "abc",
            },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("model"));
        assert!(json.contains("\"media_type\":\"image/jpeg\""));
    }

    #[test]
    fn test_config_defaults() {
        let config = HttpClassifierConfig::new("http://example.com");
        assert_eq!(config.max_width, 640);
        assert_eq!(config.jpeg_quality, 60);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.prompt.contains("DANGEROUS"));
    }
}
