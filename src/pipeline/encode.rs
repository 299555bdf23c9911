//! Image encoding: rendered page → PNG bytes → base64 `ImageData`.
//!
//! The renderer hands the orchestrator PNG bytes; the vision service wraps
//! them as a base64 data part. PNG keeps text edges crisp, which matters more
//! for OCR accuracy than payload size. `detail: "high"` lets GPT-4-class
//! models tile the full image instead of a single low-resolution overview.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as PNG.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        width = img.width(),
        height = img.height(),
        bytes = buf.len(),
        "encoded page as PNG"
    );
    Ok(buf)
}

/// Wrap PNG bytes for a multimodal chat message.
pub fn to_image_data(png: &[u8]) -> ImageData {
    ImageData::new(STANDARD.encode(png), "image/png").with_detail("high")
}
