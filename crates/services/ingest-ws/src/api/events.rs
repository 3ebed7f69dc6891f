//! SSE alert endpoint
//!
//! GET /api/alerts/events
//!
//! Each client is an alert sink for as long as its stream lives; when the
//! client goes away the stream (and with it the sink) is dropped and the hub
//! prunes the subscription at its next publish.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::AppState;
use crate::alert::Alert;
use crate::sink::{AlertSink, ChannelSink};

/// SSE stream of live alerts
pub async fn alerts_events(State(state): State<AppState>) -> Sse<AlertEventStream> {
    let (sink, receiver) = ChannelSink::new();
    let sink: Arc<dyn AlertSink> = Arc::new(sink);
    state.pipeline.hub().subscribe(&sink);

    tracing::debug!(sink_id = %sink.id(), "SSE alert client attached");

    Sse::new(AlertEventStream::new(receiver, sink)).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Converts delivered alerts into SSE events and owns the client's sink
pub struct AlertEventStream {
    inner: UnboundedReceiverStream<Alert>,
    _sink: Arc<dyn AlertSink>,
}

impl AlertEventStream {
    fn new(receiver: tokio::sync::mpsc::UnboundedReceiver<Alert>, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(receiver),
            _sink: sink,
        }
    }
}

impl Stream for AlertEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(alert)) => match alert.to_json() {
                    Ok(json) => {
                        let event = Event::default()
                            .event("alert")
                            .id(alert.id.to_string())
                            .data(json);
                        return Poll::Ready(Some(Ok(event)));
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize alert: {}", e);
                        // skip it and try the next one
                    }
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
