//! Alert history and subscriber WebSocket
//!
//! - `GET /api/alerts?limit=N`
//! - `GET /api/alerts/ws?history=N`

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::alert::{Alert, AlertHub};
use crate::sink::{AlertSink, ChannelSink};

/// Alerts replayed to a new subscriber when `history` is not given
pub const DEFAULT_REPLAY: usize = 20;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AlertList {
    pub alerts: Vec<Alert>,
}

/// Recent alerts, most recent first
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<AlertList> {
    Json(AlertList {
        alerts: state.pipeline.hub().history(query.limit),
    })
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub history: Option<usize>,
}

/// Alert subscriber WebSocket upgrade
pub async fn alerts_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> impl IntoResponse {
    let hub = state.pipeline.hub().clone();
    let replay = query.history.unwrap_or(DEFAULT_REPLAY);
    ws.on_upgrade(move |socket| handle_subscriber(socket, hub, replay))
}

async fn handle_subscriber(socket: WebSocket, hub: Arc<AlertHub>, replay: usize) {
    let (mut sender, mut receiver) = socket.split();

    let (sink, mut alerts) = ChannelSink::new();
    let sink: Arc<dyn AlertSink> = Arc::new(sink);
    let sink_id = sink.id();

    // subscribe before taking the snapshot so nothing falls in between;
    // anything that lands in both is skipped on the live side
    hub.subscribe(&sink);
    let snapshot = hub.history(Some(replay));
    let replayed: HashSet<_> = snapshot.iter().map(|a| a.id).collect();

    tracing::info!(sink_id = %sink_id, replay = snapshot.len(), "Alert subscriber connected");

    let mut send_task = tokio::spawn(async move {
        // oldest first, so the client sees them in the order they happened
        for alert in snapshot.iter().rev() {
            if send_alert(&mut sender, alert).await.is_err() {
                return;
            }
        }

        while let Some(alert) = alerts.recv().await {
            if replayed.contains(&alert.id) {
                continue;
            }
            if send_alert(&mut sender, &alert).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Alert subscriber socket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unsubscribe(sink_id);
    tracing::info!(sink_id = %sink_id, "Alert subscriber disconnected");
}

async fn send_alert(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    alert: &Alert,
) -> Result<(), axum::Error> {
    match alert.to_json() {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialise alert");
            Ok(())
        }
    }
}
