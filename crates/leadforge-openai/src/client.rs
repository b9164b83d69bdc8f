// Responses API client
//
// Thin reqwest adapter with the in-client recovery paths the worker relies
// on: the tool_choice heal, the reasoning heal, and the image-download
// replacement loop. Callers inject an ImageRescuer so this crate never
// touches image bytes itself.

use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use leadforge_core::{Result, WorkerError};

use crate::stream::{ResponseStream, StreamEvent};
use crate::types::{Response, ResponseRequest};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

/// Maximum replacement passes for image-download failures
const MAX_IMAGE_ERROR_RETRIES: usize = 10;

/// Fetches an image ourselves and re-offers it as a data: URL when the
/// provider cannot download it. Implemented by the worker's image pipeline.
#[async_trait]
pub trait ImageRescuer: Send + Sync {
    async fn to_data_url(&self, url: &str) -> Option<String>;
}

/// Uniform surface over the provider's Responses API
#[async_trait]
pub trait ResponsesApi: Send + Sync {
    /// Single-shot call with in-client recovery
    async fn call(&self, request: &ResponseRequest) -> Result<Response>;

    /// Incremental SSE events
    async fn stream(&self, request: &ResponseRequest) -> Result<ResponseStream>;
}

#[derive(Clone)]
pub struct ResponsesClient {
    client: Client,
    api_key: String,
    base_url: String,
    rescuer: Option<Arc<dyn ImageRescuer>>,
}

impl ResponsesClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_API_URL.to_string(),
            rescuer: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            WorkerError::Authentication("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::new(api_key))
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            rescuer: None,
        }
    }

    pub fn with_rescuer(mut self, rescuer: Arc<dyn ImageRescuer>) -> Self {
        self.rescuer = Some(rescuer);
        self
    }

    fn responses_url(&self) -> String {
        format!("{}/responses", self.base_url)
    }

    async fn send(&self, request: &ResponseRequest) -> std::result::Result<Response, ApiError> {
        let response = self
            .client
            .post(self.responses_url())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            let body: Response = response
                .json()
                .await
                .map_err(|e| ApiError::terminal(WorkerError::Connection(format!(
                    "Failed to decode Responses API body: {e}"
                ))))?;
            return Ok(body);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }

    /// Image-download 400s: replace the offending URL with a data: URL (or
    /// remove the image) and resend, up to MAX_IMAGE_ERROR_RETRIES passes.
    async fn recover_image_downloads(
        &self,
        request: &ResponseRequest,
        first_error: ApiError,
    ) -> std::result::Result<Response, ApiError> {
        let mut current = request.clone();
        let mut last_error = first_error;
        let mut removed: Vec<String> = Vec::new();

        for attempt in 1..=MAX_IMAGE_ERROR_RETRIES {
            if current.input_image_urls().is_empty() {
                break;
            }

            let failed_url = extract_failed_image_url(&last_error.message);
            let mut changed = false;

            if let Some(url) = &failed_url {
                warn!(
                    failed_image_url = %url,
                    retry_attempt = attempt,
                    "Image download failed, attempting to fix"
                );
                let rescued = match &self.rescuer {
                    Some(rescuer) => rescuer.to_data_url(url).await,
                    None => None,
                };
                match rescued {
                    Some(data_url) => {
                        changed = current.replace_input_image(url, &data_url);
                        if changed {
                            info!("Replaced failed image URL with base64 data URL");
                        }
                    }
                    None => {
                        changed = current.remove_input_image(url);
                        if changed {
                            removed.push(url.clone());
                            warn!(failed_image_url = %url, "Failed to download/convert image, removing it");
                        }
                    }
                }
            } else {
                // No URL extractable: convert every remaining http image
                warn!(
                    retry_attempt = attempt,
                    "Image download error without an extractable URL; converting all images to base64"
                );
                for url in current.input_image_urls() {
                    if url.starts_with("data:") {
                        continue;
                    }
                    let rescued = match &self.rescuer {
                        Some(rescuer) => rescuer.to_data_url(&url).await,
                        None => None,
                    };
                    match rescued {
                        Some(data_url) => {
                            changed |= current.replace_input_image(&url, &data_url);
                        }
                        None => {
                            if current.remove_input_image(&url) {
                                removed.push(url);
                                changed = true;
                            }
                        }
                    }
                }
            }

            if !changed {
                break;
            }
            if current.input_image_urls().is_empty() {
                warn!(removed_urls = ?removed, "All images removed due to download errors");
            }

            match self.send(&current).await {
                Ok(response) => return Ok(response),
                Err(next) if next.is_image_download_error() => {
                    last_error = next;
                }
                Err(other) => return Err(other),
            }
        }

        error!(
            removed_urls = ?removed,
            "Could not resolve image download errors after retries"
        );
        Err(last_error)
    }
}

#[async_trait]
impl ResponsesApi for ResponsesClient {
    async fn call(&self, request: &ResponseRequest) -> Result<Response> {
        let first = match self.send(request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        // Heal: 'required' without tools -> auto plus a default search tool
        if first.message.contains("Tool choice 'required' must be specified with 'tools'") {
            warn!("Recovering from 'required' without tools by retrying with tool_choice='auto' and a default tool");
            let mut retry = request.clone();
            retry.tool_choice = Some("auto".to_string());
            if retry.tools.is_empty() {
                retry.tools = vec![json!({"type": "web_search_preview"})];
            }
            if let Ok(response) = self.send(&retry).await {
                return Ok(response);
            }
        }

        // Heal: reasoning parameter rejected -> retry without it
        let lower = first.message.to_lowercase();
        if request.reasoning.is_some()
            && lower.contains("reasoning")
            && (lower.contains("not supported") || lower.contains("unsupported"))
        {
            warn!("reasoning parameter not supported for this model, retrying without it");
            let mut retry = request.clone();
            retry.reasoning = None;
            if let Ok(response) = self.send(&retry).await {
                return Ok(response);
            }
        }

        // Heal: the provider could not fetch an input image
        if first.is_image_download_error() && request.has_image_input() {
            return self
                .recover_image_downloads(request, first)
                .await
                .map_err(|e| e.error);
        }

        Err(first.error)
    }

    async fn stream(&self, request: &ResponseRequest) -> Result<ResponseStream> {
        let mut streamed = request.clone();
        streamed.stream = Some(true);

        let response = self
            .client
            .post(self.responses_url())
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&streamed)
            .send()
            .await
            .map_err(|e| ApiError::from_transport(e).error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body).error);
        }

        let events = response.bytes_stream().eventsource().filter_map(|event| async {
            match event {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        None
                    } else {
                        Some(StreamEvent::parse(&event.data))
                    }
                }
                Err(e) => Some(Err(WorkerError::Connection(format!("Stream error: {e}")))),
            }
        });

        Ok(Box::pin(events))
    }
}

// ============================================================================
// Error mapping
// ============================================================================

struct ApiError {
    error: WorkerError,
    message: String,
    image_download: bool,
}

impl ApiError {
    fn terminal(error: WorkerError) -> Self {
        let message = error.to_string();
        Self { error, message, image_download: false }
    }

    fn from_transport(e: reqwest::Error) -> Self {
        let error = if e.is_timeout() {
            WorkerError::Timeout(format!("Responses API request timed out: {e}"))
        } else if e.is_connect() {
            WorkerError::Connection(format!("Unable to connect to the Responses API: {e}"))
        } else {
            WorkerError::Connection(format!("Responses API transport error: {e}"))
        };
        Self::terminal(error)
    }

    fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let error_info = parsed.as_ref().and_then(|v| v.get("error"));
        let message = error_info
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or(body)
            .to_string();

        let image_download = message.contains("Error while downloading")
            || message.to_lowercase().contains("downloading")
            || error_info
                .map(|e| {
                    e.get("code").and_then(Value::as_str) == Some("invalid_value")
                        && e.get("param").and_then(Value::as_str) == Some("url")
                })
                .unwrap_or(false);

        let error = match status.as_u16() {
            401 | 403 => WorkerError::Authentication(message.clone()),
            404 => WorkerError::ModelNotFound(message.clone()),
            429 => WorkerError::RateLimit(message.clone()),
            _ => WorkerError::classify_message(&message),
        };

        Self { error, message, image_download }
    }

    fn is_image_download_error(&self) -> bool {
        self.image_download
    }
}

/// Extract the failed image URL from the provider's error message.
/// Error format: "Error while downloading https://...".
fn extract_failed_image_url(message: &str) -> Option<String> {
    let by_phrase = Regex::new(r#"(?i)downloading\s+(https?://[^\s<>"{}|\\^\x60\[\]]+)"#)
        .ok()?
        .captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let raw = by_phrase.or_else(|| {
        Regex::new(
            r#"(?i)https?://[^\s<>"{}|\\^\x60\[\]]+\.(?:png|jpg|jpeg|gif|webp|svg|bmp|ico)(?:\?[^\s<>"{}|\\^\x60\[\]]*)?"#,
        )
        .ok()?
        .find(message)
        .map(|m| m.as_str().to_string())
    })?;
    Some(raw.trim_end_matches([')', '.', ',', ';', '!', '?']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ResponseRequest {
        ResponseRequest {
            model: "gpt-5".into(),
            input: json!("hello"),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_failed_url_from_error_message() {
        let url = extract_failed_image_url(
            "Error while downloading https://cdn.example.com/a.png.",
        );
        assert_eq!(url.as_deref(), Some("https://cdn.example.com/a.png"));

        assert!(extract_failed_image_url("some other error").is_none());
    }

    #[tokio::test]
    async fn call_returns_parsed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1",
                "output_text": "hi",
                "output": [],
                "usage": {"input_tokens": 5, "output_tokens": 2, "total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let client = ResponsesClient::with_base_url("test-key", server.uri());
        let response = client.call(&request()).await.unwrap();
        assert_eq!(response.text(), "hi");
        assert_eq!(response.usage.unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn unauthorized_maps_to_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided"}
            })))
            .mount(&server)
            .await;

        let client = ResponsesClient::with_base_url("bad-key", server.uri());
        let err = client.call(&request()).await.unwrap_err();
        assert_eq!(err.kind(), "authentication");
    }

    #[tokio::test]
    async fn heals_required_without_tools() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Tool choice 'required' must be specified with 'tools' parameter."}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_2", "output_text": "healed", "output": []
            })))
            .mount(&server)
            .await;

        let mut req = request();
        req.tool_choice = Some("required".into());
        let client = ResponsesClient::with_base_url("k", server.uri());
        let response = client.call(&req).await.unwrap();
        assert_eq!(response.text(), "healed");
    }

    struct FixedRescuer;

    #[async_trait]
    impl ImageRescuer for FixedRescuer {
        async fn to_data_url(&self, _url: &str) -> Option<String> {
            Some("data:image/png;base64,AA==".to_string())
        }
    }

    #[tokio::test]
    async fn image_download_error_splices_data_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Error while downloading https://img.example.com/x.png"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_3", "output_text": "with images", "output": []
            })))
            .mount(&server)
            .await;

        let mut req = request();
        req.input = json!([{"role": "user", "content": [
            {"type": "input_text", "text": "describe"},
            {"type": "input_image", "image_url": "https://img.example.com/x.png"}
        ]}]);

        let client = ResponsesClient::with_base_url("k", server.uri())
            .with_rescuer(Arc::new(FixedRescuer));
        let response = client.call(&req).await.unwrap();
        assert_eq!(response.text(), "with images");
    }
}
