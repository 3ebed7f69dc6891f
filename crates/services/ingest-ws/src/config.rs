//! Configuration for the ingest service
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the ingest service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Frame buffer configuration
    #[serde(default)]
    pub buffer: BufferConfig,

    /// HLS transcoder configuration
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// Incident classification configuration
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Alert hub configuration
    #[serde(default)]
    pub alerts: AlertConfig,

    /// MJPEG preview configuration
    #[serde(default)]
    pub preview: PreviewConfig,

    /// Webhook configuration
    #[serde(default)]
    pub webhooks: WebhookConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port (API, WebSockets, preview, HLS output)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Seconds without a frame before the producer session is ended
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

fn default_http_port() -> u16 {
    3000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_idle_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            host: default_host(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

/// Frame buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Number of most recent frames retained
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

fn default_buffer_capacity() -> usize {
    10
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
        }
    }
}

/// HLS transcoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Path to the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Directory receiving the playlist and segments
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Target segment duration in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Input frame rate assumed for the image stream
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Video codec passed to ffmpeg
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Segments kept in the playlist (older ones are deleted)
    #[serde(default = "default_segment_count")]
    pub segment_count: u32,

    /// Per-stage shutdown wait in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./hls")
}

fn default_segment_seconds() -> u32 {
    2
}

fn default_frame_rate() -> u32 {
    15
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_segment_count() -> u32 {
    6
}

fn default_shutdown_timeout() -> u64 {
    3000
}

impl TranscodeConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            output_dir: default_output_dir(),
            segment_seconds: default_segment_seconds(),
            frame_rate: default_frame_rate(),
            codec: default_codec(),
            segment_count: default_segment_count(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Incident classification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Minimum seconds between classification calls
    #[serde(default = "default_interval")]
    pub interval_seconds: f64,

    /// Upper bound on a single classification call
    #[serde(default = "default_classification_timeout")]
    pub timeout_seconds: u64,

    /// Vision endpoint; classification is disabled when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Model identifier forwarded to the endpoint
    #[serde(default)]
    pub model: Option<String>,

    /// Bearer token for the endpoint
    #[serde(default)]
    pub api_key: Option<String>,

    /// Frames wider than this are downscaled before upload
    #[serde(default = "default_max_width")]
    pub max_width: u32,

    /// JPEG quality for uploads
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_interval() -> f64 {
    5.0
}

fn default_classification_timeout() -> u64 {
    30
}

fn default_max_width() -> u32 {
    640
}

fn default_jpeg_quality() -> u8 {
    60
}

impl ClassificationConfig {
    /// Interval as a `Duration`
    ///
    /// Negative values mean no interval. Values a `Duration` cannot hold
    /// (infinite, NaN, overflowing) fall back to the default.
    pub fn interval(&self) -> Duration {
        if self.interval_seconds.is_nan() {
            return Duration::from_secs_f64(default_interval());
        }
        Duration::try_from_secs_f64(self.interval_seconds.max(0.0)).unwrap_or_else(|_| {
            tracing::warn!(
                interval_seconds = self.interval_seconds,
                "Classification interval out of range, using default"
            );
            Duration::from_secs_f64(default_interval())
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            timeout_seconds: default_classification_timeout(),
            endpoint: None,
            model: None,
            api_key: None,
            max_width: default_max_width(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Alert hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Alerts retained for history queries
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    200
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// MJPEG preview configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Poll interval while a stream is live (~30 fps)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Back-off interval while no producer is connected
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    33
}

fn default_idle_interval() -> u64 {
    100
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            idle_interval_ms: default_idle_interval(),
        }
    }
}

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoints receiving every published alert
    #[serde(default)]
    pub urls: Vec<String>,

    /// Request timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,

    /// Maximum number of attempts per alert
    #[serde(default = "default_webhook_retries")]
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_webhook_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    100
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            timeout_seconds: default_webhook_timeout(),
            max_retries: default_webhook_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply `TRANSITWATCH_*` overrides obtained through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        // Server
        if let Some(p) = parsed(lookup("TRANSITWATCH_HTTP_PORT")) {
            config.server.http_port = p;
        }
        if let Some(host) = lookup("TRANSITWATCH_HOST") {
            config.server.host = host;
        }
        if let Some(t) = parsed(lookup("TRANSITWATCH_IDLE_TIMEOUT")) {
            config.server.idle_timeout_seconds = t;
        }

        // Buffer
        if let Some(c) = parsed(lookup("TRANSITWATCH_BUFFER_CAPACITY")) {
            config.buffer.capacity = c;
        }

        // Transcode
        if let Some(path) = lookup("TRANSITWATCH_FFMPEG_PATH") {
            config.transcode.ffmpeg_path = path;
        }
        if let Some(dir) = lookup("TRANSITWATCH_HLS_DIR") {
            config.transcode.output_dir = PathBuf::from(dir);
        }
        if let Some(s) = parsed(lookup("TRANSITWATCH_SEGMENT_SECONDS")) {
            config.transcode.segment_seconds = s;
        }
        if let Some(f) = parsed(lookup("TRANSITWATCH_FRAME_RATE")) {
            config.transcode.frame_rate = f;
        }
        if let Some(codec) = lookup("TRANSITWATCH_CODEC") {
            config.transcode.codec = codec;
        }
        if let Some(n) = parsed(lookup("TRANSITWATCH_SEGMENT_COUNT")) {
            config.transcode.segment_count = n;
        }
        if let Some(ms) = parsed(lookup("TRANSITWATCH_SHUTDOWN_TIMEOUT_MS")) {
            config.transcode.shutdown_timeout_ms = ms;
        }

        // Classification
        if let Some(i) = parsed::<f64>(lookup("TRANSITWATCH_CLASSIFY_INTERVAL")).filter(|i| i.is_finite()) {
            config.classification.interval_seconds = i;
        }
        if let Some(t) = parsed(lookup("TRANSITWATCH_CLASSIFY_TIMEOUT")) {
            config.classification.timeout_seconds = t;
        }
        if let Some(endpoint) = lookup("TRANSITWATCH_CLASSIFIER_URL").filter(|v| !v.is_empty()) {
            config.classification.endpoint = Some(endpoint);
        }
        if let Some(model) = lookup("TRANSITWATCH_CLASSIFIER_MODEL").filter(|v| !v.is_empty()) {
            config.classification.model = Some(model);
        }
        if let Some(key) = lookup("TRANSITWATCH_CLASSIFIER_API_KEY").filter(|v| !v.is_empty()) {
            config.classification.api_key = Some(key);
        }

        // Alerts
        if let Some(c) = parsed(lookup("TRANSITWATCH_ALERT_HISTORY")) {
            config.alerts.history_capacity = c;
        }

        // Webhooks
        if let Some(urls) = lookup("TRANSITWATCH_WEBHOOK_URLS") {
            config.webhooks.urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.http_port, 3000);
        assert_eq!(config.buffer.capacity, 10);
        assert_eq!(config.transcode.shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(config.alerts.history_capacity, 200);
        assert_eq!(config.preview.poll_interval_ms, 33);
        assert!(config.classification.endpoint.is_none());
        assert!(config.webhooks.urls.is_empty());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[server]
http_port = 8088

[buffer]
capacity = 4

[transcode]
output_dir = "/tmp/hls-test"
frame_rate = 25
codec = "libx265"

[classification]
interval_seconds = 3.0
endpoint = "http://vision.local/classify"

[alerts]
history_capacity = 50
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.http_port, 8088);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.buffer.capacity, 4);
        assert_eq!(config.transcode.output_dir, PathBuf::from("/tmp/hls-test"));
        assert_eq!(config.transcode.frame_rate, 25);
        assert_eq!(config.transcode.segment_seconds, 2);
        assert_eq!(config.classification.interval(), Duration::from_secs(3));
        assert_eq!(
            config.classification.endpoint.as_deref(),
            Some("http://vision.local/classify")
        );
        assert_eq!(config.alerts.history_capacity, 50);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TRANSITWATCH_HTTP_PORT", "9999"),
            ("TRANSITWATCH_BUFFER_CAPACITY", "25"),
            ("TRANSITWATCH_CLASSIFY_INTERVAL", "2.5"),
            ("TRANSITWATCH_SEGMENT_COUNT", "not-a-number"),
            ("TRANSITWATCH_WEBHOOK_URLS", "http://a.example/hook, ,http://b.example/hook"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.server.http_port, 9999);
        assert_eq!(config.buffer.capacity, 25);
        assert_eq!(config.classification.interval(), Duration::from_millis(2500));
        // unparseable values keep the default
        assert_eq!(config.transcode.segment_count, 6);
        assert_eq!(
            config.webhooks.urls,
            vec!["http://a.example/hook", "http://b.example/hook"]
        );
    }

    #[test]
    fn test_non_finite_interval_falls_back() {
        for raw in ["inf", "-inf", "NaN", "1e300"] {
            let config = Config::from_lookup(|k| {
                (k == "TRANSITWATCH_CLASSIFY_INTERVAL").then(|| raw.to_string())
            });
            assert_eq!(config.classification.interval(), Duration::from_secs(5), "{}", raw);
        }

        for value in [f64::INFINITY, f64::NAN, 1e300] {
            let config = ClassificationConfig {
                interval_seconds: value,
                ..ClassificationConfig::default()
            };
            assert_eq!(config.interval(), Duration::from_secs(5), "{}", value);
        }

        let config = ClassificationConfig {
            interval_seconds: -3.0,
            ..ClassificationConfig::default()
        };
        assert_eq!(config.interval(), Duration::ZERO);
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let config = Config::load(Some("/nonexistent/transitwatch.toml")).unwrap();
        assert_eq!(config.buffer.capacity, Config::default().buffer.capacity);
    }
}
