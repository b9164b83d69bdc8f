// Image download and data-URL conversion
//
// Downloads retry with exponential backoff (1s, 2s, 4s) on timeouts, 5xx,
// and transport errors; 4xx is terminal. Bytes accumulate against a 120%
// budget of the size cap and the stream aborts beyond it. Download+optimize
// results memoize in an LRU cache keyed by the URL hash.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use lru::LruCache;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use leadforge_core::{Result, WorkerError};
use leadforge_openai::client::ImageRescuer;
use leadforge_storage::BlobStore;

use super::optimize::{optimize, validate_format, validate_size, MAX_IMAGE_SIZE_BYTES};
use super::urls::{clean_url, deduplicate, is_problematic};

const MAX_DOWNLOAD_RETRIES: u32 = 3;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_CAPACITY: usize = 256;
const CACHE_TTL: Duration = Duration::from_secs(3600);
const USER_AGENT: &str = "Leadforge/1.0 (Image Downloader)";

struct CacheEntry {
    data_url: String,
    inserted_at: Instant,
}

pub struct ImagePipeline {
    client: Client,
    cache: Mutex<LruCache<[u8; 32], CacheEntry>>,
}

impl Default for ImagePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ImagePipeline {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    fn cache_key(url: &str) -> [u8; 32] {
        Sha256::digest(url.as_bytes()).into()
    }

    fn cache_get(&self, url: &str) -> Option<String> {
        let key = Self::cache_key(url);
        let mut cache = self.cache.lock().unwrap();
        match cache.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < CACHE_TTL => Some(entry.data_url.clone()),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, url: &str, data_url: &str) {
        self.cache.lock().unwrap().put(
            Self::cache_key(url),
            CacheEntry {
                data_url: data_url.to_string(),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Download with retry; returns bytes and the content type the server
    /// reported (or one sniffed from the URL).
    pub async fn download(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let mut last_error: Option<WorkerError> = None;

        for attempt in 0..MAX_DOWNLOAD_RETRIES {
            if attempt > 0 {
                let wait = Duration::from_secs(1 << (attempt - 1));
                warn!(url_preview = preview(url), attempt, wait_secs = wait.as_secs(), "Retrying image download");
                tokio::time::sleep(wait).await;
            }

            match self.download_once(url).await {
                Ok(result) => return Ok(result),
                Err(DownloadError::Terminal(e)) => return Err(e),
                Err(DownloadError::Retryable(e)) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            WorkerError::ImagePipeline(format!("Failed to download image {}", preview(url)))
        }))
    }

    async fn download_once(&self, url: &str) -> std::result::Result<(Vec<u8>, String), DownloadError> {
        let mut request = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "image/*");
        // Some hosts require a same-origin referer
        if let Ok(parsed) = url::Url::parse(url) {
            if let Some(host) = parsed.host_str() {
                request = request.header("Referer", format!("{}://{}/", parsed.scheme(), host));
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::Retryable(WorkerError::Timeout(format!(
                    "Image download timed out: {e}"
                )))
            } else {
                DownloadError::Retryable(WorkerError::Connection(format!(
                    "Image download failed: {e}"
                )))
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            // 4xx is not retryable
            return Err(DownloadError::Terminal(WorkerError::ImagePipeline(format!(
                "Image download returned client error {status}"
            ))));
        }
        if !status.is_success() {
            return Err(DownloadError::Retryable(WorkerError::ImagePipeline(format!(
                "Image download returned {status}"
            ))));
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("image/"))
            .map(str::to_string)
            .unwrap_or_else(|| mime_from_url(url));

        // Stream with a hard cap: 120% of the max size, aborted mid-stream
        let budget = MAX_IMAGE_SIZE_BYTES * 12 / 10;
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                DownloadError::Retryable(WorkerError::Connection(format!(
                    "Image download stream error: {e}"
                )))
            })?;
            bytes.extend_from_slice(&chunk);
            if bytes.len() > budget {
                return Err(DownloadError::Terminal(WorkerError::ImagePipeline(format!(
                    "Image exceeds maximum size during download ({} bytes)",
                    bytes.len()
                ))));
            }
        }

        if bytes.is_empty() {
            return Err(DownloadError::Terminal(WorkerError::ImagePipeline(
                "Downloaded image is empty".to_string(),
            )));
        }
        Ok((bytes, content_type))
    }

    /// Download, validate, optimize, and base64-encode an image into a
    /// data: URL. Returns None on any failure (callers degrade by removal).
    pub async fn to_data_url(&self, url: &str) -> Option<String> {
        let url = clean_url(url);
        if url.is_empty() {
            return None;
        }
        if let Some(cached) = self.cache_get(url) {
            info!(url_preview = preview(url), "Using cached image data URL");
            return Some(cached);
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            error!(url_preview = preview(url), "URL must use HTTP or HTTPS scheme");
            return None;
        }

        let (bytes, content_type) = match self.download(url).await {
            Ok(result) => result,
            Err(e) => {
                error!(url_preview = preview(url), error = %e, "Failed to download image");
                return None;
            }
        };

        if let Err(e) = validate_size(&bytes) {
            // Oversized images still get an optimization attempt below
            if bytes.len() <= MAX_IMAGE_SIZE_BYTES {
                error!(url_preview = preview(url), error = %e, "Image size validation failed");
                return None;
            }
            info!(url_preview = preview(url), original_size_bytes = bytes.len(), "Attempting to optimize oversized image");
        }
        let detected = match validate_format(&bytes) {
            Ok(mime) => mime,
            Err(e) => {
                error!(url_preview = preview(url), error = %e, "Invalid image format");
                return None;
            }
        };

        let content_type = if content_type.starts_with("image/") {
            content_type
        } else {
            detected.to_string()
        };
        let (optimized, final_type) = optimize(&bytes, &content_type);
        if optimized.len() > MAX_IMAGE_SIZE_BYTES {
            error!(url_preview = preview(url), "Image still exceeds size cap after optimization");
            return None;
        }

        let data_url = format!("data:{final_type};base64,{}", BASE64.encode(&optimized));
        self.cache_put(url, &data_url);
        info!(
            url_preview = preview(url),
            image_size_bytes = optimized.len(),
            mime_type = %final_type,
            "Downloaded and converted image to data URL"
        );
        Some(data_url)
    }

    /// Upload a base64 payload as a public blob under `images/<uuid>.<ext>`.
    pub async fn upload_base64(
        &self,
        blobs: &dyn BlobStore,
        b64: &str,
        mime_type: &str,
        tenant_id: &str,
        job_id: &str,
    ) -> Result<String> {
        let bytes = BASE64
            .decode(b64.trim())
            .map_err(|e| WorkerError::ImagePipeline(format!("Invalid base64 image data: {e}")))?;
        let key = format!(
            "images/{}/{}/{}.{}",
            tenant_id,
            job_id,
            Uuid::now_v7(),
            extension_for(mime_type)
        );
        blobs.put(&key, bytes, mime_type, true).await
    }

    /// Prepare previous-step image URLs for a multimodal request: clean,
    /// deduplicate, skip provider-CDN URLs, and convert problematic hosts to
    /// data: URLs upfront.
    pub async fn prepare_input_urls(&self, urls: &[String]) -> Vec<String> {
        let deduplicated = deduplicate(urls);
        let mut prepared = Vec::with_capacity(deduplicated.len());
        for url in &deduplicated {
            let url = clean_url(url);
            if url.is_empty() {
                continue;
            }
            if url.contains("cdn.openai.com") {
                warn!(url_preview = preview(url), "Skipping potentially problematic image URL: cdn.openai.com");
                continue;
            }
            if is_problematic(url) {
                match self.to_data_url(url).await {
                    Some(data_url) => prepared.push(data_url),
                    None => {
                        warn!(url_preview = preview(url), "Failed to convert problematic URL, skipping");
                    }
                }
            } else {
                prepared.push(url.to_string());
            }
        }
        prepared
    }
}

#[async_trait]
impl ImageRescuer for ImagePipeline {
    async fn to_data_url(&self, url: &str) -> Option<String> {
        ImagePipeline::to_data_url(self, url).await
    }
}

enum DownloadError {
    Retryable(WorkerError),
    Terminal(WorkerError),
}

fn mime_from_url(url: &str) -> String {
    let lower = url.to_lowercase();
    let mime = if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    };
    mime.to_string()
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "png",
    }
}

fn preview(url: &str) -> String {
    if url.chars().count() > 100 {
        format!("{}...", url.chars().take(100).collect::<String>())
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadforge_storage::MemoryBlobStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tiny_png() -> Vec<u8> {
        use image::{DynamicImage, ImageFormat, RgbImage};
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3])));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    #[tokio::test]
    async fn to_data_url_downloads_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(tiny_png())
                    .insert_header("Content-Type", "image/png"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = ImagePipeline::new();
        let url = format!("{}/img.png", server.uri());
        let first = pipeline.to_data_url(&url).await.unwrap();
        assert!(first.starts_with("data:image/png;base64,"));
        // Second call hits the cache; the mock expects exactly one request
        let second = pipeline.to_data_url(&url).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = ImagePipeline::new();
        let url = format!("{}/missing.png", server.uri());
        assert!(pipeline.download(&url).await.is_err());
    }

    #[tokio::test]
    async fn server_errors_retry_then_succeed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.png"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(tiny_png())
                    .insert_header("Content-Type", "image/png"),
            )
            .mount(&server)
            .await;

        let pipeline = ImagePipeline::new();
        let url = format!("{}/flaky.png", server.uri());
        let (bytes, mime) = pipeline.download(&url).await.unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(mime, "image/png");
    }

    #[tokio::test]
    async fn upload_base64_mints_image_key() {
        let blobs = MemoryBlobStore::new();
        let pipeline = ImagePipeline::new();
        let b64 = BASE64.encode(tiny_png());
        let url = pipeline
            .upload_base64(&blobs, &b64, "image/png", "t1", "j1")
            .await
            .unwrap();
        assert!(url.contains("/images/t1/j1/"));
        assert!(url.ends_with(".png"));
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn prepare_input_urls_skips_openai_cdn() {
        let pipeline = ImagePipeline::new();
        let urls = vec![
            "https://cdn.openai.com/x.png".to_string(),
            "https://example.com/logo.png".to_string(),
            "https://example.com/logo.png".to_string(),
        ];
        let prepared = pipeline.prepare_input_urls(&urls).await;
        assert_eq!(prepared, vec!["https://example.com/logo.png"]);
    }
}
