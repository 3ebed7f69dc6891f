//! Transitwatch live camera ingest
//!
//! A browser pushes webcam frames (one JPEG per binary WebSocket message).
//! The service keeps a short buffer of recent frames, pipes them into an HLS
//! segmenter, periodically asks a vision classifier whether the scene looks
//! dangerous, and fans resulting alerts out to every connected client. A
//! multipart MJPEG endpoint offers a low-latency preview of the same frames.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           transitwatch-ingest                            │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  producer WS ──▶ IngestPipeline::on_frame                                │
//! │                    │                                                     │
//! │                    ├──▶ FrameBuffer (last N frames) ──▶ MJPEG preview    │
//! │                    │                                                     │
//! │                    ├──▶ TranscodeProcess (ffmpeg stdin) ──▶ /hls/*.m3u8  │
//! │                    │                                                     │
//! │                    └──▶ ClassificationThrottle ─ spawn ─▶ Classifier     │
//! │                                                             │            │
//! │                                                             ▼            │
//! │           subscriber WS / SSE / webhooks / producer ◀── AlertHub         │
//! │                                                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod alert;
pub mod api;
pub mod config;
pub mod frame_buffer;
pub mod ingest;
pub mod metrics;
pub mod preview;
pub mod session;
pub mod sink;
pub mod throttle;
pub mod transcode;
pub mod webhook;
