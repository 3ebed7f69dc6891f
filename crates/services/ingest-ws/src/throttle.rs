//! Throttled, single-flight incident classification
//!
//! The ingest path offers every frame; at most one is accepted per interval
//! and only while no earlier call is outstanding. Accepted frames are decoded
//! and classified on the blocking pool by a spawned task, and the verdict
//! reaches consumers only through [`AlertHub::publish`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use transitwatch_classifier::{decode_frame, Classification, Classifier};

use crate::alert::{Alert, AlertHub, AlertSeverity};
use crate::frame_buffer::Frame;
use crate::metrics::Metrics;
use crate::sink::AlertSink;

/// Result of offering a frame to the throttle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// A classification task was spawned for the frame
    Dispatched,

    /// An earlier classification is still running
    InFlight,

    /// The interval since the last completed call has not elapsed
    TooSoon,
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_dispatch: Option<Instant>,
    in_flight: bool,
}

/// Serialisable view of the throttle for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStatus {
    pub classifier: String,
    pub in_flight: bool,
    pub interval_seconds: f64,
    pub seconds_since_last: Option<f64>,
}

/// Single-flight guard around the classifier
///
/// The guard is moved into the blocking call, so a call that outlives its
/// timeout still holds the gate until it actually returns.
#[derive(Clone, Default)]
struct ClassifierGate(Arc<tokio::sync::Mutex<()>>);

impl ClassifierGate {
    async fn acquire(&self) -> tokio::sync::OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }
}

/// Clears `in_flight` and stamps the dispatch time when dropped
struct InFlight {
    state: Arc<Mutex<ThrottleState>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        state.last_dispatch = Some(Instant::now());
    }
}

/// Rate limiter and dispatcher for classification calls
pub struct ClassificationThrottle {
    state: Arc<Mutex<ThrottleState>>,
    interval: Duration,
    timeout: Duration,
    source: String,
    gate: ClassifierGate,
    classifier: Arc<dyn Classifier>,
    hub: Arc<AlertHub>,
    metrics: Arc<Metrics>,
}

impl ClassificationThrottle {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        hub: Arc<AlertHub>,
        interval: Duration,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ThrottleState::default())),
            interval,
            timeout,
            source: "webcam".to_string(),
            gate: ClassifierGate::default(),
            classifier,
            hub,
            metrics,
        }
    }

    /// Forget the last dispatch so the next frame is eligible immediately
    ///
    /// An outstanding call keeps its in-flight mark.
    pub fn reset(&self) {
        self.state.lock().last_dispatch = None;
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    pub fn status(&self) -> ThrottleStatus {
        let state = self.state.lock();
        ThrottleStatus {
            classifier: self.classifier.name().to_string(),
            in_flight: state.in_flight,
            interval_seconds: self.interval.as_secs_f64(),
            seconds_since_last: state.last_dispatch.map(|t| t.elapsed().as_secs_f64()),
        }
    }

    /// Offer a frame for classification. Never blocks.
    ///
    /// `origin` is the producer connection's sink; it receives the resulting
    /// alert even if it is not subscribed to the hub.
    pub fn maybe_dispatch(
        &self,
        frame: Frame,
        origin: Option<Arc<dyn AlertSink>>,
        now: Instant,
    ) -> DispatchDecision {
        {
            let mut state = self.state.lock();
            if state.in_flight {
                return DispatchDecision::InFlight;
            }
            if let Some(last) = state.last_dispatch {
                if now.saturating_duration_since(last) < self.interval {
                    return DispatchDecision::TooSoon;
                }
            }
            state.in_flight = true;
        }

        self.metrics.classification_dispatched();
        tracing::debug!(seq = frame.seq, bytes = frame.len(), "Dispatching frame for classification");

        let task = ClassificationTask {
            _in_flight: InFlight {
                state: self.state.clone(),
            },
            timeout: self.timeout,
            source: self.source.clone(),
            gate: self.gate.clone(),
            classifier: self.classifier.clone(),
            hub: self.hub.clone(),
            metrics: self.metrics.clone(),
        };
        tokio::spawn(task.run(frame, origin));

        DispatchDecision::Dispatched
    }
}

/// Dropping the task (on any exit path of `run`) releases the in-flight mark
struct ClassificationTask {
    _in_flight: InFlight,
    timeout: Duration,
    source: String,
    gate: ClassifierGate,
    classifier: Arc<dyn Classifier>,
    hub: Arc<AlertHub>,
    metrics: Arc<Metrics>,
}

impl ClassificationTask {
    async fn run(self, frame: Frame, origin: Option<Arc<dyn AlertSink>>) {
        let seq = frame.seq;

        let image = match tokio::task::spawn_blocking(move || decode_frame(&frame.data)).await {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                tracing::debug!(seq, error = %e, "Discarding undecodable frame");
                self.metrics.classification_skipped();
                return;
            }
            Err(e) => {
                tracing::warn!(seq, error = %e, "Frame decode task failed");
                self.metrics.classification_skipped();
                return;
            }
        };

        let guard = self.gate.acquire().await;
        let classifier = self.classifier.clone();
        let call = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            classifier.analyze(&image)
        });

        let classification = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(classification))) => classification,
            Ok(Ok(Err(e))) => {
                tracing::warn!(seq, classifier = self.classifier.name(), error = %e, "Classification failed");
                self.metrics.classification_failed();
                return;
            }
            Ok(Err(e)) => {
                tracing::error!(seq, error = %e, "Classification task panicked");
                self.metrics.classification_failed();
                return;
            }
            Err(_) => {
                tracing::warn!(
                    seq,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Classification timed out"
                );
                self.metrics.classification_failed();
                return;
            }
        };

        self.metrics.classification_completed();
        self.publish(seq, classification, origin);
    }

    fn publish(&self, seq: u64, classification: Classification, origin: Option<Arc<dyn AlertSink>>) {
        tracing::info!(
            seq,
            level = %classification.level,
            reason = %classification.reason,
            "Frame classified"
        );

        let Some(severity) = AlertSeverity::from_threat(classification.level) else {
            return;
        };

        let alert = Alert::new(severity, classification.reason, self.source.clone());
        self.hub.publish(alert, origin.as_ref());
    }
}
