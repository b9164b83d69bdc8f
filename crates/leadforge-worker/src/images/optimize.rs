// Image validation and optimization

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader};
use tracing::{info, warn};

use leadforge_core::{Result, WorkerError};

pub const MAX_IMAGE_SIZE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_IMAGE_WIDTH_PX: u32 = 2048;

/// Reject images above the hard cap; warn above 80% of it.
pub fn validate_size(bytes: &[u8]) -> Result<()> {
    let size = bytes.len();
    if size > MAX_IMAGE_SIZE_BYTES {
        let size_mb = size as f64 / (1024.0 * 1024.0);
        let max_mb = MAX_IMAGE_SIZE_BYTES as f64 / (1024.0 * 1024.0);
        return Err(WorkerError::ImagePipeline(format!(
            "Image size {size_mb:.2}MB exceeds maximum {max_mb}MB"
        )));
    }
    if size > MAX_IMAGE_SIZE_BYTES * 8 / 10 {
        warn!(image_size_bytes = size, "Large image detected, may need optimization");
    }
    Ok(())
}

/// Bytes must decode as PNG/JPEG/GIF/WebP. Returns the detected MIME type.
pub fn validate_format(bytes: &[u8]) -> Result<&'static str> {
    if bytes.is_empty() {
        return Err(WorkerError::ImagePipeline("Image bytes are empty".to_string()));
    }
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| WorkerError::ImagePipeline(format!("Invalid image format: {e}")))?;
    let format = reader
        .format()
        .ok_or_else(|| WorkerError::ImagePipeline("Unrecognized image format".to_string()))?;
    let mime = match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        other => {
            return Err(WorkerError::ImagePipeline(format!(
                "Unsupported image format: {other:?}"
            )))
        }
    };
    // Decode to confirm the body is not just a valid header
    reader
        .decode()
        .map_err(|e| WorkerError::ImagePipeline(format!("Invalid image format: {e}")))?;
    Ok(mime)
}

/// Resize overly wide images and recompress. Opaque PNGs above 2 MB are
/// converted to JPEG. Failure falls back to the original bytes.
pub fn optimize(bytes: &[u8], content_type: &str) -> (Vec<u8>, String) {
    match try_optimize(bytes, content_type) {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Failed to optimize image, using original");
            (bytes.to_vec(), content_type.to_string())
        }
    }
}

fn try_optimize(bytes: &[u8], content_type: &str) -> Result<(Vec<u8>, String)> {
    let original_size = bytes.len();
    let mut img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| WorkerError::ImagePipeline(e.to_string()))?
        .decode()
        .map_err(|e| WorkerError::ImagePipeline(e.to_string()))?;

    if img.width() > MAX_IMAGE_WIDTH_PX {
        let ratio = MAX_IMAGE_WIDTH_PX as f64 / img.width() as f64;
        let new_height = (img.height() as f64 * ratio) as u32;
        info!(
            original = format!("{}x{}", img.width(), img.height()),
            resized = format!("{}x{}", MAX_IMAGE_WIDTH_PX, new_height),
            "Resized image"
        );
        img = img.resize_exact(
            MAX_IMAGE_WIDTH_PX,
            new_height.max(1),
            image::imageops::FilterType::Lanczos3,
        );
    }

    let mut out = Vec::new();
    let new_type = match content_type {
        "image/jpeg" | "image/jpg" => {
            encode_jpeg(&img, 85, &mut out)?;
            "image/jpeg".to_string()
        }
        "image/webp" => {
            // The webp encoder here is lossless; size still drops with resize
            img.write_to(&mut Cursor::new(&mut out), ImageFormat::WebP)
                .map_err(|e| WorkerError::ImagePipeline(e.to_string()))?;
            "image/webp".to_string()
        }
        "image/png" => {
            let has_alpha = img.color().has_alpha();
            if original_size > 2 * 1024 * 1024 && !has_alpha {
                encode_jpeg(&img, 85, &mut out)?;
                info!(original_size_bytes = original_size, "Converted large PNG to JPEG");
                "image/jpeg".to_string()
            } else {
                img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                    .map_err(|e| WorkerError::ImagePipeline(e.to_string()))?;
                "image/png".to_string()
            }
        }
        other => {
            img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .map_err(|e| WorkerError::ImagePipeline(e.to_string()))?;
            return Ok((out, other.to_string()));
        }
    };

    if out.len() < original_size {
        let reduction = (1.0 - out.len() as f64 / original_size as f64) * 100.0;
        info!(
            original_size_bytes = original_size,
            optimized_size_bytes = out.len(),
            reduction_percent = format!("{reduction:.1}"),
            "Image optimized"
        );
    }
    Ok((out, new_type))
}

pub(super) fn encode_jpeg(img: &DynamicImage, quality: u8, out: &mut Vec<u8>) -> Result<()> {
    let rgb = img.to_rgb8();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(out), quality);
    rgb.write_with_encoder(encoder)
        .map_err(|e| WorkerError::ImagePipeline(format!("JPEG encode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            image::Rgb([120, 40, 200]),
        ));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    #[test]
    fn validate_size_rejects_oversized() {
        assert!(validate_size(&vec![0u8; MAX_IMAGE_SIZE_BYTES + 1]).is_err());
        assert!(validate_size(&[0u8; 16]).is_ok());
    }

    #[test]
    fn validate_format_detects_png_and_rejects_garbage() {
        assert_eq!(validate_format(&png_bytes(4, 4)).unwrap(), "image/png");
        assert!(validate_format(b"definitely not an image").is_err());
        assert!(validate_format(&[]).is_err());
    }

    #[test]
    fn optimize_resizes_wide_images() {
        let bytes = png_bytes(MAX_IMAGE_WIDTH_PX + 100, 64);
        let (optimized, mime) = optimize(&bytes, "image/png");
        let decoded = ImageReader::new(Cursor::new(&optimized))
            .with_guessed_format()
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(decoded.width(), MAX_IMAGE_WIDTH_PX);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn optimize_falls_back_on_garbage() {
        let (out, mime) = optimize(b"garbage", "image/png");
        assert_eq!(out, b"garbage");
        assert_eq!(mime, "image/png");
    }
}
