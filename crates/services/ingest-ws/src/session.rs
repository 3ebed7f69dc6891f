//! Ingest pipeline and producer session lifecycle
//!
//! [`IngestPipeline`] owns every shared component (frame buffer, transcoder,
//! classification throttle, alert hub) and tracks the single producer
//! session: `Idle -> Active -> Draining -> Idle`. Connection handlers drive
//! it through [`IngestPipeline::begin`], [`IngestPipeline::on_frame`] and
//! [`IngestPipeline::end`].
//!
//! Only the owner of an `Active` session may ingest. `Draining` covers the
//! teardown (buffer cleared, transcoder stopped) so no new session can start
//! underneath it.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use transitwatch_classifier::Classifier;
use uuid::Uuid;

use crate::alert::AlertHub;
use crate::config::Config;
use crate::frame_buffer::FrameBuffer;
use crate::metrics::Metrics;
use crate::sink::AlertSink;
use crate::throttle::{ClassificationThrottle, DispatchDecision, ThrottleStatus};
use crate::transcode::{
    SegmenterCommand, ShutdownOutcome, TranscodeError, TranscodeProcess, TranscodeState,
    WriteOutcome,
};

/// Session state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// No producer connected
    Idle,

    /// A producer is streaming frames
    Active {
        connection_id: Uuid,
        started_at: DateTime<Utc>,
    },

    /// The session is being torn down
    Draining { connection_id: Uuid },
}

/// Reason for session ending
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// Producer closed the connection
    ProducerDisconnect,

    /// No frame arrived within the idle timeout
    IdleTimeout,

    /// Reading from the producer connection failed
    ReadError(String),

    /// Service is shutting down
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::ProducerDisconnect => write!(f, "producer_disconnect"),
            EndReason::IdleTimeout => write!(f, "idle_timeout"),
            EndReason::ReadError(e) => write!(f, "read_error: {}", e),
            EndReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a producer is already streaming (connection {0})")]
    AlreadyActive(Uuid),

    #[error("previous session {0} is still shutting down")]
    Draining(Uuid),

    #[error("connection {0} does not own the active session")]
    NotOwner(Uuid),
}

/// What happened to one ingested frame
#[derive(Debug, Clone, Copy)]
pub struct FrameReport {
    pub seq: u64,
    pub write: WriteOutcome,

    /// `None` when classification is disabled
    pub dispatch: Option<DispatchDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub frames: usize,
    pub capacity: usize,
    pub evicted: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscodeStatus {
    pub state: TranscodeState,
    pub pid: Option<u32>,
    pub restarts: u64,
}

/// Pipeline status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub session: SessionState,
    pub buffer: BufferStatus,
    pub transcode: TranscodeStatus,
    pub classification: Option<ThrottleStatus>,
    pub subscribers: usize,
}

/// The ingest pipeline
pub struct IngestPipeline {
    buffer: Arc<FrameBuffer>,
    transcode: TranscodeProcess,
    throttle: Option<ClassificationThrottle>,
    hub: Arc<AlertHub>,
    metrics: Arc<Metrics>,

    /// Current session; handlers watch it to learn about external ends
    state: watch::Sender<SessionState>,
}

impl IngestPipeline {
    /// Build the pipeline with the configured ffmpeg segmenter
    ///
    /// Classification is disabled when `classifier` is `None`.
    pub fn new(
        config: &Config,
        classifier: Option<Arc<dyn Classifier>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_segmenter(
            config,
            SegmenterCommand::ffmpeg(&config.transcode),
            classifier,
            metrics,
        )
    }

    /// Build the pipeline with an explicit segmenter command line
    pub fn with_segmenter(
        config: &Config,
        segmenter: SegmenterCommand,
        classifier: Option<Arc<dyn Classifier>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let buffer = Arc::new(FrameBuffer::new(config.buffer.capacity));
        let hub = Arc::new(AlertHub::new(config.alerts.history_capacity, metrics.clone()));
        let transcode = TranscodeProcess::new(
            segmenter,
            config.transcode.output_dir.clone(),
            config.transcode.shutdown_timeout(),
            metrics.clone(),
        );
        let throttle = classifier.map(|classifier| {
            ClassificationThrottle::new(
                classifier,
                hub.clone(),
                config.classification.interval(),
                config.classification.timeout(),
                metrics.clone(),
            )
        });

        Self {
            buffer,
            transcode,
            throttle,
            hub,
            metrics,
            state: watch::channel(SessionState::Idle).0,
        }
    }

    /// Prepare the transcoder output directory
    pub async fn setup(&self) -> Result<(), TranscodeError> {
        self.transcode.setup().await
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    pub fn hub(&self) -> &Arc<AlertHub> {
        &self.hub
    }

    pub fn transcode(&self) -> &TranscodeProcess {
        &self.transcode
    }

    pub fn throttle(&self) -> Option<&ClassificationThrottle> {
        self.throttle.as_ref()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Active { .. })
    }

    /// Whether `connection_id` owns the active session
    pub fn is_owner(&self, connection_id: Uuid) -> bool {
        state_owned_by(&self.state.borrow(), connection_id)
    }

    /// Receiver notified on every session transition
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Start a producer session
    ///
    /// Fails if another producer is streaming or a previous session is still
    /// draining. On success the frame buffer is emptied and marked active,
    /// the transcoder accepts writes again and the throttle clock is reset
    /// so the first frame can be classified straight away.
    pub fn begin(&self) -> Result<Uuid, SessionError> {
        let connection_id = Uuid::new_v4();
        let mut rejected = None;

        self.state.send_if_modified(|state| match state {
            SessionState::Idle => {
                *state = SessionState::Active {
                    connection_id,
                    started_at: Utc::now(),
                };
                true
            }
            SessionState::Active { connection_id: owner, .. } => {
                rejected = Some(SessionError::AlreadyActive(*owner));
                false
            }
            SessionState::Draining { connection_id: owner } => {
                rejected = Some(SessionError::Draining(*owner));
                false
            }
        });

        if let Some(err) = rejected {
            return Err(err);
        }

        self.buffer.clear();
        self.buffer.set_active(true);
        self.transcode.resume();
        if let Some(throttle) = &self.throttle {
            throttle.reset();
        }

        self.metrics.session_started();
        tracing::info!(connection_id = %connection_id, "Producer session started");
        Ok(connection_id)
    }

    /// Ingest one encoded frame from the session owner
    ///
    /// Buffers it, hands it to the transcoder (in arrival order) and offers
    /// it to the classification throttle, which returns immediately. Frames
    /// from anyone but the owner of the active session are refused without
    /// touching the buffer or the transcoder.
    pub async fn on_frame(
        &self,
        connection_id: Uuid,
        data: Bytes,
        origin: Option<&Arc<dyn AlertSink>>,
    ) -> Result<FrameReport, SessionError> {
        if !self.is_owner(connection_id) {
            return Err(SessionError::NotOwner(connection_id));
        }

        let len = data.len() as u64;
        let evicted_before = self.buffer.evicted();
        let Some(frame) = self.buffer.push_if_active(data) else {
            return Err(SessionError::NotOwner(connection_id));
        };

        self.metrics.frame_received(len);
        if self.buffer.evicted() > evicted_before {
            self.metrics.frame_evicted();
        }
        let seq = frame.seq;

        let write = self.transcode.write(&frame.data).await;
        if write != WriteOutcome::Written {
            tracing::trace!(seq, outcome = ?write, "Frame not transcoded");
        }

        let dispatch = self
            .throttle
            .as_ref()
            .map(|throttle| throttle.maybe_dispatch(frame, origin.cloned(), Instant::now()));

        Ok(FrameReport {
            seq,
            write,
            dispatch,
        })
    }

    /// End the session owned by `connection_id`
    ///
    /// Returns `None` if that connection does not own the active session.
    pub async fn end(&self, connection_id: Uuid, reason: EndReason) -> Option<ShutdownOutcome> {
        let draining = self.state.send_if_modified(|state| {
            if !state_owned_by(state, connection_id) {
                return false;
            }
            *state = SessionState::Draining { connection_id };
            true
        });
        if !draining {
            return None;
        }

        self.buffer.set_active(false);
        self.buffer.clear();
        let outcome = self.transcode.stop().await;

        self.state.send_replace(SessionState::Idle);
        self.metrics.session_ended();
        tracing::info!(
            connection_id = %connection_id,
            reason = %reason,
            transcoder = ?outcome,
            "Producer session ended"
        );
        Some(outcome)
    }

    /// End whatever session is active (used on service shutdown)
    pub async fn end_active(&self, reason: EndReason) -> Option<ShutdownOutcome> {
        let connection_id = match &*self.state.borrow() {
            SessionState::Active { connection_id, .. } => *connection_id,
            SessionState::Idle | SessionState::Draining { .. } => return None,
        };
        self.end(connection_id, reason).await
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            session: self.state(),
            buffer: BufferStatus {
                frames: self.buffer.len(),
                capacity: self.buffer.capacity(),
                evicted: self.buffer.evicted(),
                active: self.buffer.is_active(),
            },
            transcode: TranscodeStatus {
                state: self.transcode.state(),
                pid: self.transcode.pid(),
                restarts: self.transcode.restarts(),
            },
            classification: self.throttle.as_ref().map(|t| t.status()),
            subscribers: self.hub.subscriber_count(),
        }
    }
}

fn state_owned_by(state: &SessionState, connection_id: Uuid) -> bool {
    matches!(state, SessionState::Active { connection_id: owner, .. } if *owner == connection_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn degraded_pipeline() -> IngestPipeline {
        let mut config = Config::default();
        config.buffer.capacity = 3;
        config.transcode.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        config.transcode.shutdown_timeout_ms = 200;
        IngestPipeline::new(&config, None, Arc::new(Metrics::new()))
    }

    #[test]
    fn test_end_reason_display() {
        assert_eq!(EndReason::ProducerDisconnect.to_string(), "producer_disconnect");
        assert_eq!(EndReason::IdleTimeout.to_string(), "idle_timeout");
        assert_eq!(
            EndReason::ReadError("reset".to_string()).to_string(),
            "read_error: reset"
        );
    }

    #[tokio::test]
    async fn test_single_active_session() {
        let pipeline = degraded_pipeline();
        assert!(!pipeline.is_active());

        let first = pipeline.begin().unwrap();
        assert!(pipeline.is_active());
        assert!(pipeline.buffer().is_active());

        match pipeline.begin() {
            Err(SessionError::AlreadyActive(owner)) => assert_eq!(owner, first),
            other => panic!("expected AlreadyActive, got {:?}", other),
        }

        // a stranger cannot end the session
        assert!(pipeline.end(Uuid::new_v4(), EndReason::ProducerDisconnect).await.is_none());
        assert!(pipeline.is_active());

        assert_eq!(
            pipeline.end(first, EndReason::ProducerDisconnect).await,
            Some(ShutdownOutcome::NotRunning)
        );
        assert_eq!(pipeline.state(), SessionState::Idle);

        // a new producer may start now
        pipeline.begin().unwrap();
    }

    #[tokio::test]
    async fn test_state_watch_sees_external_end() {
        let pipeline = degraded_pipeline();
        let id = pipeline.begin().unwrap();
        let mut rx = pipeline.subscribe_state();
        assert!(pipeline.is_owner(id));

        pipeline.end_active(EndReason::Shutdown).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Idle);
        assert!(!pipeline.is_owner(id));
    }

    #[tokio::test]
    async fn test_frames_buffered_without_transcoder() {
        let pipeline = degraded_pipeline();
        let id = pipeline.begin().unwrap();

        for i in 0..5u8 {
            let report = pipeline.on_frame(id, Bytes::from(vec![i]), None).await.unwrap();
            assert_eq!(report.write, WriteOutcome::Unavailable);
            assert!(report.dispatch.is_none());
        }

        assert_eq!(pipeline.buffer().len(), 3);
        assert_eq!(pipeline.buffer().latest().unwrap().data.as_ref(), &[4]);

        let snapshot = pipeline.metrics().snapshot();
        assert_eq!(snapshot.frames_received, 5);
        assert_eq!(snapshot.frames_evicted, 2);
        assert_eq!(snapshot.transcode_launch_failures, 5);

        pipeline.end(id, EndReason::ProducerDisconnect).await;
        assert!(pipeline.buffer().latest().is_none());
        assert!(!pipeline.buffer().is_active());
    }

    #[tokio::test]
    async fn test_begin_clears_stale_frames() {
        let pipeline = degraded_pipeline();
        pipeline.buffer().push(Bytes::from_static(b"stale"));

        pipeline.begin().unwrap();
        assert!(pipeline.buffer().latest().is_none());
    }

    #[tokio::test]
    async fn test_end_active_on_shutdown() {
        let pipeline = degraded_pipeline();
        assert!(pipeline.end_active(EndReason::Shutdown).await.is_none());

        pipeline.begin().unwrap();
        assert!(pipeline.end_active(EndReason::Shutdown).await.is_some());
        assert!(!pipeline.is_active());

        let snapshot = pipeline.metrics().snapshot();
        assert_eq!(snapshot.sessions_started, 1);
        assert_eq!(snapshot.sessions_ended, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_end_stops_transcoder() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.transcode.output_dir = dir.path().to_path_buf();
        config.transcode.shutdown_timeout_ms = 500;

        let pipeline = IngestPipeline::with_segmenter(
            &config,
            SegmenterCommand::new("cat", vec![]),
            None,
            Arc::new(Metrics::new()),
        );
        pipeline.setup().await.unwrap();

        let id = pipeline.begin().unwrap();
        let report = pipeline.on_frame(id, Bytes::from_static(b"jpeg"), None).await.unwrap();
        assert_eq!(report.write, WriteOutcome::Written);
        assert_eq!(pipeline.transcode().state(), TranscodeState::Running);

        let outcome = pipeline.end(id, EndReason::IdleTimeout).await;
        assert_eq!(outcome, Some(ShutdownOutcome::Exited));
        assert_eq!(pipeline.transcode().state(), TranscodeState::Stopped);

        // a frame that arrives after the end leaves everything idle
        assert!(matches!(
            pipeline.on_frame(id, Bytes::from_static(b"late"), None).await,
            Err(SessionError::NotOwner(_))
        ));
        assert_eq!(pipeline.state(), SessionState::Idle);
        assert_eq!(pipeline.transcode().state(), TranscodeState::Stopped);
        assert!(pipeline.transcode().pid().is_none());
        assert!(pipeline.buffer().is_empty());
        assert!(!pipeline.buffer().is_active());

        // the next session gets a working transcoder again
        let next = pipeline.begin().unwrap();
        let report = pipeline.on_frame(next, Bytes::from_static(b"jpeg"), None).await.unwrap();
        assert_eq!(report.write, WriteOutcome::Written);
        assert_eq!(
            pipeline.end(next, EndReason::ProducerDisconnect).await,
            Some(ShutdownOutcome::Exited)
        );
    }

    #[tokio::test]
    async fn test_frames_from_non_owner_refused() {
        let pipeline = degraded_pipeline();
        let stranger = Uuid::new_v4();
        assert!(pipeline.on_frame(stranger, Bytes::from_static(b"x"), None).await.is_err());

        let owner = pipeline.begin().unwrap();
        assert!(pipeline.on_frame(stranger, Bytes::from_static(b"x"), None).await.is_err());
        assert!(pipeline.buffer().is_empty());
        assert_eq!(pipeline.metrics().snapshot().frames_received, 0);

        pipeline.on_frame(owner, Bytes::from_static(b"y"), None).await.unwrap();
        assert_eq!(pipeline.buffer().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_begin_refused_while_draining() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.transcode.output_dir = dir.path().to_path_buf();
        config.transcode.shutdown_timeout_ms = 400;

        // ignores stdin EOF, so stop has to wait out the first timeout
        let pipeline = Arc::new(IngestPipeline::with_segmenter(
            &config,
            SegmenterCommand::new("sh", vec!["-c".into(), "while true; do sleep 0.1; done".into()]),
            None,
            Arc::new(Metrics::new()),
        ));

        let id = pipeline.begin().unwrap();
        let report = pipeline.on_frame(id, Bytes::from_static(b"jpeg"), None).await.unwrap();
        assert_eq!(report.write, WriteOutcome::Written);

        let ending = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.end(id, EndReason::ProducerDisconnect).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pipeline.state(), SessionState::Draining { connection_id: id });
        assert!(!pipeline.is_active());
        assert!(matches!(pipeline.begin(), Err(SessionError::Draining(owner)) if owner == id));
        assert!(pipeline.on_frame(id, Bytes::from_static(b"late"), None).await.is_err());

        assert_eq!(ending.await.unwrap(), Some(ShutdownOutcome::Terminated));
        assert_eq!(pipeline.state(), SessionState::Idle);
        pipeline.begin().unwrap();
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let pipeline = degraded_pipeline();
        let id = pipeline.begin().unwrap();
        pipeline.on_frame(id, Bytes::from_static(b"x"), None).await.unwrap();

        let status = pipeline.status();
        assert_eq!(status.buffer.frames, 1);
        assert_eq!(status.buffer.capacity, 3);
        assert!(status.classification.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["session"]["state"], "active");
        assert_eq!(json["transcode"]["state"], "stopped");
    }
}
