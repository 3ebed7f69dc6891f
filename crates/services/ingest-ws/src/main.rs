//! Transitwatch ingest binary
//!
//! Entry point for the live camera ingest service.

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transitwatch_classifier::{Classifier, HttpClassifier, HttpClassifierConfig};
use transitwatch_ingest::{
    api::{build_router, AppState},
    config::Config,
    metrics::Metrics,
    session::{EndReason, IngestPipeline},
    sink::AlertSink,
    webhook::WebhookSink,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    tracing::info!("Starting transitwatch ingest...");

    let config_path = std::env::var("TRANSITWATCH_CONFIG").ok();
    let config = Arc::new(Config::load(config_path.as_deref())?);

    tracing::info!(
        "Configuration: HTTP port={}, buffer={}, hls_dir={}, classify_interval={}s",
        config.server.http_port,
        config.buffer.capacity,
        config.transcode.output_dir.display(),
        config.classification.interval_seconds,
    );

    let metrics = Arc::new(Metrics::new());

    let classifier = build_classifier(&config)?;
    let pipeline = Arc::new(IngestPipeline::new(&config, classifier, metrics.clone()));
    pipeline.setup().await?;

    // The hub only holds weak references; keep webhook sinks alive here
    let mut webhooks: Vec<Arc<dyn AlertSink>> = Vec::new();
    for url in &config.webhooks.urls {
        let (sink, _worker) =
            WebhookSink::spawn(url.clone(), config.webhooks.clone(), metrics.clone())?;
        let sink: Arc<dyn AlertSink> = sink;
        pipeline.hub().subscribe(&sink);
        tracing::info!(url = %url, "Webhook subscribed to alerts");
        webhooks.push(sink);
    }

    let state = AppState::new(pipeline.clone(), config.clone());
    let router = build_router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    let shutdown_pipeline = pipeline.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
            // ending the session stops the transcoder and releases the producer
            shutdown_pipeline.end_active(EndReason::Shutdown).await;
        })
        .await?;

    // in case a producer slipped in after the signal
    pipeline.end_active(EndReason::Shutdown).await;
    drop(webhooks);

    tracing::info!("Transitwatch ingest shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());

    let json = std::env::var("TRANSITWATCH_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn build_classifier(config: &Config) -> Result<Option<Arc<dyn Classifier>>> {
    let classification = &config.classification;
    let Some(endpoint) = classification.endpoint.clone() else {
        tracing::warn!("No classifier endpoint configured, incident classification disabled");
        return Ok(None);
    };

    let mut http_config = HttpClassifierConfig::new(endpoint);
    http_config.model = classification.model.clone();
    http_config.api_key = classification.api_key.clone();
    http_config.timeout = classification.timeout();
    http_config.max_width = classification.max_width;
    http_config.jpeg_quality = classification.jpeg_quality;

    let classifier = HttpClassifier::new(http_config)?;
    tracing::info!(endpoint = %classifier.endpoint(), "Incident classification enabled");

    let classifier: Arc<dyn Classifier> = Arc::new(classifier);
    Ok(Some(classifier))
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
