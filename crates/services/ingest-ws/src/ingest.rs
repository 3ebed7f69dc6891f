//! Producer WebSocket connection handler
//!
//! A producer (the browser webcam page) sends each encoded frame as one
//! binary message. The same connection receives, as JSON text, any alert
//! raised from its own frames. Only one producer may stream at a time; a
//! second one is closed with a policy-violation frame.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::Instrument;
use uuid::Uuid;

use crate::session::{EndReason, IngestPipeline};
use crate::sink::{AlertSink, ChannelSink};

/// Handle one producer connection until it ends
pub async fn handle_producer(socket: WebSocket, pipeline: Arc<IngestPipeline>, idle_timeout: Duration) {
    let (mut sender, receiver) = socket.split();

    let connection_id = match pipeline.begin() {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting producer connection");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::from("another producer is already streaming"),
                })))
                .await;
            return;
        }
    };

    let span = tracing::info_span!("ingest_connection", connection_id = %connection_id);
    run_session(sender, receiver, pipeline, connection_id, idle_timeout)
        .instrument(span)
        .await;
}

async fn run_session(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    mut receiver: futures::stream::SplitStream<WebSocket>,
    pipeline: Arc<IngestPipeline>,
    connection_id: Uuid,
    idle_timeout: Duration,
) {
    tracing::info!("Producer connected");

    let (sink, mut alerts) = ChannelSink::new();
    let sink: Arc<dyn AlertSink> = Arc::new(sink);

    // alerts raised from this producer's frames go back down its socket
    let writer = tokio::spawn(
        async move {
            while let Some(alert) = alerts.recv().await {
                let json = match alert.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialise alert");
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let mut session = pipeline.subscribe_state();
    let mut frames = 0u64;

    let reason = loop {
        tokio::select! {
            // a session taken away must win over a frame that is already waiting
            biased;

            changed = session.changed() => {
                let still_owner = changed.is_ok() && pipeline.is_owner(connection_id);
                if !still_owner {
                    break EndReason::Shutdown;
                }
            }
            next = tokio::time::timeout(idle_timeout, receiver.next()) => match next {
                Err(_) => {
                    tracing::warn!(timeout_secs = idle_timeout.as_secs(), "No frame received, ending session");
                    break EndReason::IdleTimeout;
                }
                Ok(None) => break EndReason::ProducerDisconnect,
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, "Producer read failed");
                    break EndReason::ReadError(e.to_string());
                }
                Ok(Some(Ok(message))) => match message {
                    Message::Binary(data) => {
                        if let Err(e) = pipeline.on_frame(connection_id, Bytes::from(data), Some(&sink)).await {
                            tracing::info!(error = %e, "Session no longer owned, dropping producer");
                            break EndReason::Shutdown;
                        }
                        frames += 1;
                    }
                    Message::Close(_) => break EndReason::ProducerDisconnect,
                    Message::Text(text) => {
                        tracing::debug!(len = text.len(), "Ignoring text message from producer");
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                },
            },
        }
    };

    pipeline.end(connection_id, reason.clone()).await;
    writer.abort();

    tracing::info!(frames, reason = %reason, "Producer disconnected");
}
