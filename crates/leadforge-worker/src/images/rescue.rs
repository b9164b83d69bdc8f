// Base64 asset rescue
//
// Models sometimes embed whole images as base64 inside their JSON output:
// {"assets": [{"encoding": "base64", "content_type": "image/png", "data": "..."}]}
// Each such asset is uploaded and the document rewritten in place, swapping
// encoding -> "url" and data -> the uploaded URL. Already-rescued documents
// pass through untouched, so rescuing twice is a no-op.

use serde_json::Value;
use tracing::{info, warn};

use leadforge_storage::BlobStore;

use super::fetch::ImagePipeline;

/// Rescue base64 image assets out of a JSON text. Returns the (possibly
/// rewritten) text plus the uploaded URLs. Non-JSON content passes through.
pub async fn rescue_base64_assets(
    pipeline: &ImagePipeline,
    blobs: &dyn BlobStore,
    content: &str,
    tenant_id: &str,
    job_id: &str,
) -> (String, Vec<String>) {
    let Ok(mut document) = serde_json::from_str::<Value>(content) else {
        return (content.to_string(), Vec::new());
    };
    let Some(assets) = document.get_mut("assets").and_then(Value::as_array_mut) else {
        return (content.to_string(), Vec::new());
    };

    let mut uploaded = Vec::new();
    let mut modified = false;

    for asset in assets.iter_mut() {
        let Some(map) = asset.as_object_mut() else {
            continue;
        };
        let encoding = map
            .get("encoding")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let content_type = map
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = map.get("data").and_then(Value::as_str).unwrap_or_default().to_string();

        if encoding != "base64" || !content_type.starts_with("image/") || data.is_empty() {
            continue;
        }

        match pipeline
            .upload_base64(blobs, &data, &content_type, tenant_id, job_id)
            .await
        {
            Ok(url) => {
                info!(
                    asset_id = map.get("id").and_then(|v: &serde_json::Value| v.as_str()).unwrap_or("unknown"),
                    content_type = %content_type,
                    "Converted base64 image asset to URL"
                );
                map.insert("data".to_string(), Value::String(url.clone()));
                map.insert("encoding".to_string(), Value::String("url".to_string()));
                map.insert(
                    "original_data_encoding".to_string(),
                    Value::String("base64".to_string()),
                );
                uploaded.push(url);
                modified = true;
            }
            Err(e) => {
                warn!(error = %e, "Failed to upload base64 image asset");
            }
        }
    }

    if modified {
        let rewritten = serde_json::to_string_pretty(&document)
            .unwrap_or_else(|_| content.to_string());
        (rewritten, uploaded)
    } else {
        (content.to_string(), uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use leadforge_storage::MemoryBlobStore;
    use serde_json::json;

    fn tiny_png_b64() -> String {
        use image::{DynamicImage, ImageFormat, RgbImage};
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, image::Rgb([9, 9, 9])));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png).unwrap();
        BASE64.encode(&out)
    }

    #[tokio::test]
    async fn rescues_base64_assets_and_rewrites_document() {
        let pipeline = ImagePipeline::new();
        let blobs = MemoryBlobStore::new();
        let content = json!({
            "assets": [{
                "id": "asset-1",
                "encoding": "base64",
                "content_type": "image/png",
                "data": tiny_png_b64()
            }]
        })
        .to_string();

        let (rewritten, urls) =
            rescue_base64_assets(&pipeline, &blobs, &content, "t1", "j1").await;
        assert_eq!(urls.len(), 1);

        let doc: Value = serde_json::from_str(&rewritten).unwrap();
        let asset = &doc["assets"][0];
        assert_eq!(asset["encoding"], "url");
        assert_eq!(asset["original_data_encoding"], "base64");
        assert_eq!(asset["data"], urls[0].as_str());
    }

    #[tokio::test]
    async fn rescue_is_idempotent() {
        let pipeline = ImagePipeline::new();
        let blobs = MemoryBlobStore::new();
        let content = json!({
            "assets": [{
                "encoding": "base64",
                "content_type": "image/png",
                "data": tiny_png_b64()
            }]
        })
        .to_string();

        let (first, urls) = rescue_base64_assets(&pipeline, &blobs, &content, "t1", "j1").await;
        assert_eq!(urls.len(), 1);
        let uploads_after_first = blobs.len();

        let (second, urls2) = rescue_base64_assets(&pipeline, &blobs, &first, "t1", "j1").await;
        assert_eq!(second, first);
        assert!(urls2.is_empty());
        assert_eq!(blobs.len(), uploads_after_first);
    }

    #[tokio::test]
    async fn non_json_content_passes_through() {
        let pipeline = ImagePipeline::new();
        let blobs = MemoryBlobStore::new();
        let (out, urls) =
            rescue_base64_assets(&pipeline, &blobs, "# just markdown", "t1", "j1").await;
        assert_eq!(out, "# just markdown");
        assert!(urls.is_empty());
    }
}
