//! Bounded buffer of recent camera frames
//!
//! Keeps the last `capacity` frames with a drop-oldest policy. Readers only
//! ever need the newest frame, so there is no pop; the preview and the
//! classifier both go through [`FrameBuffer::latest`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// An encoded (JPEG) camera frame
///
/// `data` is reference counted, so cloning a frame never copies the payload
/// and a consumer holding one is unaffected by later eviction.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number, unique for the lifetime of the buffer
    pub seq: u64,

    /// Encoded image bytes
    pub data: Bytes,

    /// When the frame arrived
    pub received_at: DateTime<Utc>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct Inner {
    frames: VecDeque<Frame>,
    next_seq: u64,
}

/// Bounded frame buffer with drop-oldest policy
pub struct FrameBuffer {
    inner: Mutex<Inner>,

    /// Maximum number of frames retained
    capacity: usize,

    /// Whether a producer is currently streaming
    active: AtomicBool,

    /// Total frames evicted to make room
    evicted: AtomicU64,
}

impl FrameBuffer {
    /// Create a buffer retaining at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
            capacity,
            active: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
        }
    }

    /// Append a frame, evicting the oldest when full. Returns the stored frame.
    pub fn push(&self, data: Bytes) -> Frame {
        let mut inner = self.inner.lock();
        self.store(&mut inner, data)
    }

    /// Append a frame only while a producer is streaming
    ///
    /// The activity flag is read under the buffer lock, so a frame racing
    /// with the end of a session either lands before the final `clear` or
    /// is refused.
    pub fn push_if_active(&self, data: Bytes) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if !self.is_active() {
            return None;
        }
        Some(self.store(&mut inner, data))
    }

    fn store(&self, inner: &mut Inner, data: Bytes) -> Frame {
        let frame = Frame {
            seq: inner.next_seq,
            data,
            received_at: Utc::now(),
        };
        inner.next_seq += 1;

        while inner.frames.len() >= self.capacity {
            inner.frames.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        inner.frames.push_back(frame.clone());

        frame
    }

    /// Most recently pushed frame, if any
    pub fn latest(&self) -> Option<Frame> {
        self.inner.lock().frames.back().cloned()
    }

    /// Drop every buffered frame. Sequence numbers keep counting.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if !inner.frames.is_empty() {
            tracing::debug!(frames = inner.frames.len(), "Clearing frame buffer");
        }
        inner.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted since creation
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Mark whether a producer is streaming
    pub fn set_active(&self, active: bool) {
        let previous = self.active.swap(active, Ordering::SeqCst);
        if previous != active {
            tracing::debug!(active, "Frame buffer activity changed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_oldest() {
        let buffer = FrameBuffer::new(3);

        for i in 0..10u8 {
            buffer.push(Bytes::from(vec![i]));
            assert!(buffer.len() <= 3);
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.evicted(), 7);
        assert_eq!(buffer.latest().unwrap().data.as_ref(), &[9]);
    }

    #[test]
    fn test_latest_tracks_last_push() {
        let buffer = FrameBuffer::new(10);
        assert!(buffer.latest().is_none());

        let first = buffer.push(Bytes::from_static(b"a"));
        let second = buffer.push(Bytes::from_static(b"b"));

        let latest = buffer.latest().unwrap();
        assert_eq!(latest.seq, second.seq);
        assert!(second.seq > first.seq);
        assert_eq!(latest.data, Bytes::from_static(b"b"));
    }

    #[test]
    fn test_clear() {
        let buffer = FrameBuffer::new(4);
        let before = buffer.push(Bytes::from_static(b"x"));
        buffer.clear();

        assert!(buffer.latest().is_none());
        assert!(buffer.is_empty());

        // sequence numbers are never reused
        let after = buffer.push(Bytes::from_static(b"y"));
        assert!(after.seq > before.seq);
    }

    #[test]
    fn test_held_frame_survives_eviction() {
        let buffer = FrameBuffer::new(1);
        let held = buffer.push(Bytes::from_static(b"first"));
        buffer.push(Bytes::from_static(b"second"));

        assert_eq!(held.data, Bytes::from_static(b"first"));
        assert_eq!(buffer.latest().unwrap().data, Bytes::from_static(b"second"));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let buffer = FrameBuffer::new(0);
        buffer.push(Bytes::from_static(b"a"));
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_active_flag() {
        let buffer = FrameBuffer::new(2);
        assert!(!buffer.is_active());
        buffer.set_active(true);
        assert!(buffer.is_active());
        buffer.set_active(false);
        assert!(!buffer.is_active());
    }

    #[test]
    fn test_inactive_buffer_refuses_frames() {
        let buffer = FrameBuffer::new(2);
        assert!(buffer.push_if_active(Bytes::from_static(b"early")).is_none());
        assert!(buffer.is_empty());

        buffer.set_active(true);
        let frame = buffer.push_if_active(Bytes::from_static(b"live")).unwrap();
        assert_eq!(buffer.latest().unwrap().seq, frame.seq);

        buffer.set_active(false);
        buffer.clear();
        assert!(buffer.push_if_active(Bytes::from_static(b"late")).is_none());
        assert!(buffer.latest().is_none());
    }
}
