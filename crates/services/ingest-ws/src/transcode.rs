//! HLS transcoder subprocess supervision
//!
//! Frames are piped as a raw image stream into a long-lived segmenter
//! (ffmpeg by default) which writes an HLS playlist and segments to the
//! output directory. The subprocess is launched lazily on the first write,
//! relaunched when a write fails, and stopped with a bounded escalation:
//! close stdin, wait, SIGTERM, wait, SIGKILL.
//!
//! Every operation that touches the child (write, relaunch, stop) runs under
//! one async mutex, so frames reach stdin in arrival order and a stop never
//! races a relaunch. After `stop` the transcoder refuses writes until
//! [`TranscodeProcess::resume`] is called, so a late frame cannot bring the
//! subprocess back up.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::config::TranscodeConfig;
use crate::metrics::Metrics;

/// Playlist file name inside the output directory
pub const PLAYLIST_NAME: &str = "stream.m3u8";

/// Transcoder lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Stopping,
}

impl TranscodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TranscodeState::Starting,
            2 => TranscodeState::Running,
            3 => TranscodeState::Restarting,
            4 => TranscodeState::Stopping,
            _ => TranscodeState::Stopped,
        }
    }
}

/// Result of handing one frame to the transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Frame reached the subprocess stdin
    Written,

    /// Write failed; the subprocess was relaunched and the frame dropped
    Restarted,

    /// No subprocess could be launched; the frame was dropped
    Unavailable,

    /// The transcoder was stopped and not resumed; the frame was dropped
    Closed,
}

/// How `stop` brought the subprocess down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Nothing was running
    NotRunning,

    /// Exited on its own after stdin closed
    Exited,

    /// Exited after SIGTERM
    Terminated,

    /// Had to be killed
    Killed,
}

/// Transcoder errors
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Program and arguments used to launch the segmenter
#[derive(Debug, Clone)]
pub struct SegmenterCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SegmenterCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// ffmpeg reading concatenated JPEGs from stdin and writing live HLS
    pub fn ffmpeg(config: &TranscodeConfig) -> Self {
        let dir = &config.output_dir;
        let fps = config.frame_rate.max(1);
        let gop = fps * config.segment_seconds.max(1);

        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "image2pipe".to_string(),
            "-framerate".to_string(),
            fps.to_string(),
            "-i".to_string(),
            "-".to_string(),
            "-c:v".to_string(),
            config.codec.clone(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-tune".to_string(),
            "zerolatency".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-g".to_string(),
            gop.to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            config.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            config.segment_count.to_string(),
            "-hls_flags".to_string(),
            "delete_segments".to_string(),
            "-hls_segment_filename".to_string(),
            dir.join("segment_%03d.ts").to_string_lossy().into_owned(),
            dir.join(PLAYLIST_NAME).to_string_lossy().into_owned(),
        ];

        Self::new(config.ffmpeg_path.clone(), args)
    }
}

struct Inner {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    launch_failures: u64,
}

/// Supervised segmenter subprocess
pub struct TranscodeProcess {
    command: SegmenterCommand,
    output_dir: PathBuf,
    shutdown_timeout: Duration,
    inner: Mutex<Inner>,

    /// Mirrors of the guarded state, readable without the lock
    state: AtomicU8,
    pid: AtomicU32,
    restarts: AtomicU64,

    /// Cleared by `stop` under the lock, set again by `resume`
    accepting: AtomicBool,

    metrics: Arc<Metrics>,
}

impl TranscodeProcess {
    pub fn new(
        command: SegmenterCommand,
        output_dir: impl Into<PathBuf>,
        shutdown_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            command,
            output_dir: output_dir.into(),
            shutdown_timeout,
            inner: Mutex::new(Inner {
                child: None,
                stdin: None,
                launch_failures: 0,
            }),
            state: AtomicU8::new(TranscodeState::Stopped as u8),
            pid: AtomicU32::new(0),
            restarts: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            metrics,
        }
    }

    /// Build from configuration with the ffmpeg command line
    pub fn from_config(config: &TranscodeConfig, metrics: Arc<Metrics>) -> Self {
        Self::new(
            SegmenterCommand::ffmpeg(config),
            config.output_dir.clone(),
            config.shutdown_timeout(),
            metrics,
        )
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn state(&self) -> TranscodeState {
        TranscodeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// PID of the running subprocess
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Relaunches caused by failed writes
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TranscodeState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Create the output directory and remove stale playlists and segments
    pub async fn setup(&self) -> Result<(), TranscodeError> {
        let dir = &self.output_dir;
        let io_err = |source| TranscodeError::Io {
            path: dir.clone(),
            source,
        };

        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;

        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let stale = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("ts") | Some("m3u8")
            );
            if stale {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale HLS file");
                } else {
                    removed += 1;
                }
            }
        }

        tracing::info!(dir = %dir.display(), removed, "HLS output directory ready");
        Ok(())
    }

    /// Accept writes again after a `stop`
    pub fn resume(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Stream one encoded frame into the subprocess
    ///
    /// Never fails: a missing binary or broken pipe is logged and reported
    /// through the outcome.
    pub async fn write(&self, frame: &[u8]) -> WriteOutcome {
        let mut inner = self.inner.lock().await;

        if !self.accepting.load(Ordering::SeqCst) {
            return WriteOutcome::Closed;
        }

        if inner.child.is_none() && !self.launch(&mut inner) {
            return WriteOutcome::Unavailable;
        }

        let result = match inner.stdin.as_mut() {
            Some(stdin) => stdin.write_all(frame).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin not available",
            )),
        };

        match result {
            Ok(()) => {
                self.metrics.frame_transcoded();
                WriteOutcome::Written
            }
            Err(e) => {
                tracing::warn!(
                    pid = ?self.pid(),
                    error = %e,
                    "Transcoder write failed, relaunching"
                );
                self.set_state(TranscodeState::Restarting);
                self.teardown(&mut inner).await;

                self.restarts.fetch_add(1, Ordering::SeqCst);
                self.metrics.transcode_restarted();

                if self.launch(&mut inner) {
                    WriteOutcome::Restarted
                } else {
                    WriteOutcome::Unavailable
                }
            }
        }
    }

    /// Stop the subprocess with bounded escalation
    ///
    /// Each stage waits at most the configured shutdown timeout. Never fails.
    pub async fn stop(&self) -> ShutdownOutcome {
        let mut inner = self.inner.lock().await;
        self.accepting.store(false, Ordering::SeqCst);

        let Some(mut child) = inner.child.take() else {
            inner.stdin = None;
            self.set_state(TranscodeState::Stopped);
            return ShutdownOutcome::NotRunning;
        };

        self.set_state(TranscodeState::Stopping);
        // closing stdin is the segmenter's cue to flush and exit
        drop(inner.stdin.take());

        let outcome = shutdown_child(&mut child, self.shutdown_timeout).await;

        self.pid.store(0, Ordering::SeqCst);
        self.set_state(TranscodeState::Stopped);
        tracing::info!(outcome = ?outcome, "Transcoder stopped");
        outcome
    }

    fn launch(&self, inner: &mut Inner) -> bool {
        self.set_state(TranscodeState::Starting);

        let spawned = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                inner.stdin = child.stdin.take();
                let pid = child.id().unwrap_or(0);
                inner.child = Some(child);
                inner.launch_failures = 0;

                self.pid.store(pid, Ordering::SeqCst);
                self.set_state(TranscodeState::Running);
                self.metrics.transcode_launched();
                tracing::info!(program = %self.command.program, pid, "Transcoder launched");
                true
            }
            Err(e) => {
                inner.launch_failures += 1;
                self.set_state(TranscodeState::Stopped);
                self.metrics.transcode_launch_failed();

                // a missing binary fails on every frame; only shout once
                if inner.launch_failures == 1 {
                    tracing::error!(
                        program = %self.command.program,
                        error = %e,
                        "Failed to launch transcoder, continuing without HLS output"
                    );
                } else {
                    tracing::debug!(
                        program = %self.command.program,
                        error = %e,
                        attempts = inner.launch_failures,
                        "Transcoder launch retry failed"
                    );
                }
                false
            }
        }
    }

    async fn teardown(&self, inner: &mut Inner) {
        drop(inner.stdin.take());
        if let Some(mut child) = inner.child.take() {
            let _ = child.start_kill();
            if tokio::time::timeout(self.shutdown_timeout, child.wait())
                .await
                .is_err()
            {
                tracing::warn!(pid = ?child.id(), "Transcoder did not exit after kill");
            }
        }
        self.pid.store(0, Ordering::SeqCst);
    }
}

async fn shutdown_child(child: &mut Child, timeout: Duration) -> ShutdownOutcome {
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(?pid, %status, "Transcoder exited after stdin closed");
            return ShutdownOutcome::Exited;
        }
        Ok(Err(e)) => {
            tracing::warn!(?pid, error = %e, "Failed to wait for transcoder");
        }
        Err(_) => {}
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(raw) = pid {
            tracing::debug!(pid = raw, "Sending SIGTERM to transcoder");
            let _ = kill(Pid::from_raw(raw as i32), Signal::SIGTERM);

            if let Ok(Ok(status)) = tokio::time::timeout(timeout, child.wait()).await {
                tracing::debug!(pid = raw, %status, "Transcoder exited after SIGTERM");
                return ShutdownOutcome::Terminated;
            }
        }
    }

    tracing::warn!(?pid, "Transcoder did not terminate gracefully, forcing kill");
    let _ = child.start_kill();
    let _ = tokio::time::timeout(timeout, child.wait()).await;
    ShutdownOutcome::Killed
}
