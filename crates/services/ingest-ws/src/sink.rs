//! Alert sink trait and in-process implementations
//!
//! A sink is any open channel that wants published alerts: a subscriber
//! WebSocket, an SSE stream, the producer connection itself, or a webhook.
//! `deliver` must not block; slow transports queue internally.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::alert::Alert;

/// Trait for alert delivery targets
pub trait AlertSink: Send + Sync {
    /// Stable identity used for subscribe/unsubscribe
    fn id(&self) -> Uuid;

    /// Hand an alert to this sink
    ///
    /// An error means the sink is gone; the hub unsubscribes it.
    fn deliver(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Error type for sink operations
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
}

/// Sink backed by an unbounded channel
///
/// Used by connection handlers: the handler owns the sink and drains the
/// receiver into its socket. Once the receiver is dropped every delivery
/// fails with [`SinkError::Closed`].
pub struct ChannelSink {
    id: Uuid,
    sender: mpsc::UnboundedSender<Alert>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }
}

impl AlertSink for ChannelSink {
    fn id(&self) -> Uuid {
        self.id
    }

    fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        self.sender
            .send(alert.clone())
            .map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSeverity;

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        let alert = Alert::new(AlertSeverity::High, "weapon", "webcam");

        sink.deliver(&alert).unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.id, alert.id);
    }

    #[test]
    fn test_channel_sink_fails_after_receiver_drop() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);

        let alert = Alert::new(AlertSeverity::Medium, "crowd", "webcam");
        assert!(matches!(sink.deliver(&alert), Err(SinkError::Closed)));
    }

    #[test]
    fn test_sink_ids_unique() {
        let (a, _ra) = ChannelSink::new();
        let (b, _rb) = ChannelSink::new();
        assert_ne!(a.id(), b.id());
    }
}
