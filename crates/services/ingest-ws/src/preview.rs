//! MJPEG live preview
//!
//! Each consumer gets its own [`PreviewCursor`] over the shared frame
//! buffer. The cursor polls the newest frame and yields a multipart part
//! only when it changed since the last one it emitted; a slow consumer
//! simply skips frames instead of building a backlog.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;

use crate::config::PreviewConfig;
use crate::frame_buffer::FrameBuffer;

/// Multipart boundary token
pub const BOUNDARY: &str = "frame";

/// `Content-Type` of the preview response
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wrap one JPEG in a multipart part
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header);
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Per-consumer position in the frame buffer
pub struct PreviewCursor {
    buffer: Arc<FrameBuffer>,
    last_seq: Option<u64>,
    poll_interval: Duration,
    idle_interval: Duration,
}

impl PreviewCursor {
    pub fn new(buffer: Arc<FrameBuffer>, config: &PreviewConfig) -> Self {
        Self::with_intervals(
            buffer,
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_millis(config.idle_interval_ms),
        )
    }

    pub fn with_intervals(
        buffer: Arc<FrameBuffer>,
        poll_interval: Duration,
        idle_interval: Duration,
    ) -> Self {
        Self {
            buffer,
            last_seq: None,
            poll_interval,
            idle_interval,
        }
    }

    /// Wait for the next changed frame and return it as a multipart part
    pub async fn next_part(&mut self) -> Bytes {
        loop {
            match self.buffer.latest() {
                Some(frame) if self.last_seq != Some(frame.seq) => {
                    self.last_seq = Some(frame.seq);
                    return multipart_part(&frame.data);
                }
                Some(_) => tokio::time::sleep(self.poll_interval).await,
                None if self.buffer.is_active() => tokio::time::sleep(self.poll_interval).await,
                None => tokio::time::sleep(self.idle_interval).await,
            }
        }
    }

    /// Endless stream of parts, suitable for a streaming response body
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        async_stream::stream! {
            loop {
                yield Ok(self.next_part().await);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn cursor(buffer: &Arc<FrameBuffer>) -> PreviewCursor {
        PreviewCursor::with_intervals(
            buffer.clone(),
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(b"JPEG");
        assert_eq!(
            part.as_ref(),
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
        );
    }

    #[tokio::test]
    async fn test_emits_latest_frame() {
        let buffer = Arc::new(FrameBuffer::new(4));
        buffer.push(Bytes::from_static(b"old"));
        buffer.push(Bytes::from_static(b"new"));

        let mut cursor = cursor(&buffer);
        let part = cursor.next_part().await;
        assert!(part.ends_with(b"new\r\n"));
    }

    #[tokio::test]
    async fn test_unchanged_frame_not_repeated() {
        let buffer = Arc::new(FrameBuffer::new(4));
        buffer.push(Bytes::from_static(b"one"));

        let mut cursor = cursor(&buffer);
        cursor.next_part().await;

        let waited =
            tokio::time::timeout(Duration::from_millis(50), cursor.next_part()).await;
        assert!(waited.is_err(), "cursor re-emitted an unchanged frame");

        buffer.push(Bytes::from_static(b"two"));
        let part = tokio::time::timeout(Duration::from_millis(200), cursor.next_part())
            .await
            .unwrap();
        assert!(part.ends_with(b"two\r\n"));
    }

    #[tokio::test]
    async fn test_identical_bytes_new_frame_emitted() {
        let buffer = Arc::new(FrameBuffer::new(4));
        buffer.push(Bytes::from_static(b"same"));

        let mut cursor = cursor(&buffer);
        cursor.next_part().await;

        // a fresh push is a new frame even with identical content
        buffer.push(Bytes::from_static(b"same"));
        let part = tokio::time::timeout(Duration::from_millis(200), cursor.next_part())
            .await
            .unwrap();
        assert!(part.ends_with(b"same\r\n"));
    }

    #[tokio::test]
    async fn test_idle_until_first_frame() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let mut stream = Box::pin(cursor(&buffer).into_stream());

        let pending = tokio::time::timeout(Duration::from_millis(40), stream.next()).await;
        assert!(pending.is_err());

        buffer.set_active(true);
        buffer.push(Bytes::from_static(b"live"));
        let part = tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(part.starts_with(b"--frame\r\n"));
    }

    #[tokio::test]
    async fn test_independent_cursors() {
        let buffer = Arc::new(FrameBuffer::new(4));
        buffer.push(Bytes::from_static(b"shared"));

        let mut a = cursor(&buffer);
        let mut b = cursor(&buffer);
        a.next_part().await;

        // b has not seen the frame yet
        let part = tokio::time::timeout(Duration::from_millis(50), b.next_part())
            .await
            .unwrap();
        assert!(part.ends_with(b"shared\r\n"));
    }
}
