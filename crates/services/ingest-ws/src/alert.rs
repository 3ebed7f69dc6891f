//! Alerts and the in-memory alert hub
//!
//! The hub fans every published alert out to its subscribers and keeps a
//! bounded, most-recent-first history for pull queries. Subscribers are held
//! by `Weak` reference: whoever owns a connection owns its sink, and a sink
//! dropped by its owner simply disappears from the set at the next publish.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use transitwatch_classifier::ThreatLevel;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::sink::AlertSink;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl AlertSeverity {
    /// Map a classifier verdict onto an alert severity
    ///
    /// `Normal` produces no alert.
    pub fn from_threat(level: ThreatLevel) -> Option<Self> {
        match level {
            ThreatLevel::Critical => Some(AlertSeverity::High),
            ThreatLevel::Dangerous => Some(AlertSeverity::Medium),
            ThreatLevel::Normal => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "LOW",
            AlertSeverity::Medium => "MEDIUM",
            AlertSeverity::High => "HIGH",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published alert
///
/// Serialises as `{"type":"alert","id":…,"severity":…,"reason":…,"source":…,"time":…}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "alert")]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub reason: String,

    /// Stream the alert was raised for
    pub source: String,

    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, reason: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            reason: reason.into(),
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome of a single publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Sinks that accepted the alert
    pub delivered: usize,

    /// Sinks removed because delivery failed or their owner dropped them
    pub pruned: usize,
}

/// In-memory pub/sub hub for alerts
pub struct AlertHub {
    subscribers: RwLock<HashMap<Uuid, Weak<dyn AlertSink>>>,
    history: Mutex<VecDeque<Alert>>,
    history_capacity: usize,
    metrics: Arc<Metrics>,
}

impl AlertHub {
    pub fn new(history_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            metrics,
        }
    }

    /// Register a sink. Subscribing the same sink twice is a no-op.
    pub fn subscribe(&self, sink: &Arc<dyn AlertSink>) {
        let id = sink.id();
        let mut subscribers = self.subscribers.write();
        if subscribers.insert(id, Arc::downgrade(sink)).is_none() {
            tracing::debug!(sink_id = %id, subscribers = subscribers.len(), "Alert sink subscribed");
        }
    }

    /// Remove a sink. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.write().remove(&id).is_some() {
            tracing::debug!(sink_id = %id, "Alert sink unsubscribed");
        }
    }

    pub fn is_subscribed(&self, id: Uuid) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Record `alert` and deliver it to every subscriber
    ///
    /// `extra` receives the alert too unless it is already subscribed, so it
    /// never sees the same alert twice. A subscriber whose delivery fails is
    /// dropped from the set; the remaining subscribers are unaffected.
    pub fn publish(&self, alert: Alert, extra: Option<&Arc<dyn AlertSink>>) -> PublishReport {
        {
            let mut history = self.history.lock();
            history.push_front(alert.clone());
            history.truncate(self.history_capacity);
        }
        self.metrics.alert_published();

        let snapshot: Vec<(Uuid, Weak<dyn AlertSink>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect();

        let mut report = PublishReport::default();
        let mut failed = Vec::new();

        for (id, weak) in &snapshot {
            let Some(sink) = weak.upgrade() else {
                failed.push(*id);
                continue;
            };
            match sink.deliver(&alert) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::debug!(sink_id = %id, error = %e, "Alert delivery failed, removing sink");
                    failed.push(*id);
                }
            }
        }

        if let Some(sink) = extra {
            let already = snapshot.iter().any(|(id, _)| *id == sink.id());
            if !already {
                match sink.deliver(&alert) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        tracing::debug!(sink_id = %sink.id(), error = %e, "Alert delivery to origin failed");
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in &failed {
                subscribers.remove(id);
            }
            report.pruned = failed.len();
            self.metrics.sinks_pruned(failed.len() as u64);
        }

        tracing::info!(
            alert_id = %alert.id,
            severity = %alert.severity,
            source = %alert.source,
            delivered = report.delivered,
            pruned = report.pruned,
            "Alert published"
        );

        report
    }

    /// Recent alerts, most recent first, optionally truncated to `limit`
    pub fn history(&self, limit: Option<usize>) -> Vec<Alert> {
        let history = self.history.lock();
        let take = limit.unwrap_or(history.len());
        history.iter().take(take).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelSink, SinkError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenSink {
        id: Uuid,
        attempts: AtomicUsize,
    }

    impl AlertSink for BrokenSink {
        fn id(&self) -> Uuid {
            self.id
        }

        fn deliver(&self, _alert: &Alert) -> Result<(), SinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Closed)
        }
    }

    fn hub(capacity: usize) -> AlertHub {
        AlertHub::new(capacity, Arc::new(Metrics::new()))
    }

    fn alert(reason: &str) -> Alert {
        Alert::new(AlertSeverity::Medium, reason, "webcam")
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(AlertSeverity::from_threat(ThreatLevel::Critical), Some(AlertSeverity::High));
        assert_eq!(AlertSeverity::from_threat(ThreatLevel::Dangerous), Some(AlertSeverity::Medium));
        assert_eq!(AlertSeverity::from_threat(ThreatLevel::Normal), None);
    }

    #[test]
    fn test_alert_json_shape() {
        let alert = Alert::new(AlertSeverity::High, "Knife visible", "webcam");
        let value: serde_json::Value = serde_json::from_str(&alert.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "alert");
        assert_eq!(value["severity"], "HIGH");
        assert_eq!(value["reason"], "Knife visible");
        assert_eq!(value["source"], "webcam");
        assert_eq!(value["id"], alert.id.to_string());
        assert!(value["time"].is_string());

        let back: Alert = serde_json::from_value(value).unwrap();
        assert_eq!(back, alert);
    }

    #[test]
    fn test_defective_subscriber_removed() {
        let hub = hub(10);

        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let a: Arc<dyn AlertSink> = Arc::new(a);
        let b: Arc<dyn AlertSink> = Arc::new(b);
        let broken = Arc::new(BrokenSink {
            id: Uuid::new_v4(),
            attempts: AtomicUsize::new(0),
        });
        let broken_dyn: Arc<dyn AlertSink> = broken.clone();

        hub.subscribe(&a);
        hub.subscribe(&b);
        hub.subscribe(&broken_dyn);
        assert_eq!(hub.subscriber_count(), 3);

        let report = hub.publish(alert("first"), None);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, 1);
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(rx_a.try_recv().unwrap().reason, "first");
        assert_eq!(rx_b.try_recv().unwrap().reason, "first");

        // the defective sink is not tried again
        hub.publish(alert("second"), None);
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(rx_a.try_recv().unwrap().reason, "second");
    }

    #[test]
    fn test_subscribe_idempotent() {
        let hub = hub(10);
        let (sink, mut rx) = ChannelSink::new();
        let sink: Arc<dyn AlertSink> = Arc::new(sink);

        hub.subscribe(&sink);
        hub.subscribe(&sink);
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(alert("once"), None);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        hub.unsubscribe(sink.id());
        hub.unsubscribe(sink.id());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_sink_pruned() {
        let hub = hub(10);
        let (sink, _rx) = ChannelSink::new();
        let sink: Arc<dyn AlertSink> = Arc::new(sink);
        hub.subscribe(&sink);
        drop(sink);

        let report = hub.publish(alert("nobody home"), None);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.pruned, 1);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_extra_sink_receives_once() {
        let hub = hub(10);
        let (origin, mut rx) = ChannelSink::new();
        let origin: Arc<dyn AlertSink> = Arc::new(origin);

        // not subscribed: still receives through the extra slot
        hub.publish(alert("direct"), Some(&origin));
        assert_eq!(rx.try_recv().unwrap().reason, "direct");
        assert!(!hub.is_subscribed(origin.id()));

        // subscribed and passed as extra: exactly one copy
        hub.subscribe(&origin);
        hub.publish(alert("dedup"), Some(&origin));
        assert_eq!(rx.try_recv().unwrap().reason, "dedup");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_history_bounded_most_recent_first() {
        let hub = hub(200);
        for i in 0..250 {
            hub.publish(alert(&format!("alert-{}", i)), None);
        }

        let history = hub.history(None);
        assert_eq!(history.len(), 200);
        assert_eq!(history[0].reason, "alert-249");
        assert_eq!(history[199].reason, "alert-50");

        let limited = hub.history(Some(5));
        assert_eq!(limited.len(), 5);
        assert_eq!(limited[4].reason, "alert-245");
    }
}
