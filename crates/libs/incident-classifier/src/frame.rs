//! Frame decode and preparation for remote classifiers

use std::io::Cursor;

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::ClassifierError;

/// A frame re-encoded for upload
#[derive(Debug, Clone)]
pub struct PreparedFrame {
    /// Base64-encoded JPEG
    pub data: String,

    /// MIME type of the encoded image
    pub media_type: &'static str,

    pub width: u32,
    pub height: u32,
}

/// Decode an encoded image payload (JPEG, PNG, ...)
pub fn decode_frame(bytes: &[u8]) -> Result<DynamicImage, ClassifierError> {
    image::load_from_memory(bytes).map_err(|e| ClassifierError::Decode(e.to_string()))
}

/// Downscale to at most `max_width` (keeping aspect ratio), re-encode as
/// JPEG at `quality` and base64 the result.
///
/// Smaller uploads keep per-call latency and cost down; classification
/// does not need full resolution.
pub fn prepare_frame(
    frame: &DynamicImage,
    max_width: u32,
    quality: u8,
) -> Result<PreparedFrame, ClassifierError> {
    let (width, height) = (frame.width(), frame.height());

    let scaled;
    let source = if max_width > 0 && width > max_width {
        let new_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
        scaled = frame.resize_exact(max_width, new_height, FilterType::Triangle);
        &scaled
    } else {
        frame
    };

    let rgb = source.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| ClassifierError::Encode(e.to_string()))?;

    Ok(PreparedFrame {
        data: base64::engine::general_purpose::STANDARD.encode(buffer.into_inner()),
        media_type: "image/jpeg",
        width: rgb.width(),
        height: rgb.height(),
    })
}
