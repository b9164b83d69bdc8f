// Images API client
//
// The image-generation strategy bypasses the Responses API and calls the
// provider's dedicated image endpoint. Size/quality/background of "auto"
// are omitted from the request (the endpoint treats absence as auto).

use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::info;

use leadforge_core::{Result, WorkerError};

use crate::types::{ImageSource, Usage};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct ImageGenerationRequest {
    pub model: String,
    pub prompt: String,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub background: Option<String>,
    pub n: u32,
}

#[derive(Clone)]
pub struct ImagesClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ImagesClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_API_URL.to_string(),
        }
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    pub async fn generate(
        &self,
        request: &ImageGenerationRequest,
    ) -> Result<(Vec<ImageSource>, Usage)> {
        let mut body = Map::new();
        body.insert("model".into(), json!(request.model));
        body.insert("prompt".into(), json!(request.prompt));
        body.insert("n".into(), json!(request.n.max(1)));
        for (key, value) in [
            ("size", &request.size),
            ("quality", &request.quality),
            ("background", &request.background),
        ] {
            if let Some(v) = value {
                if v != "auto" {
                    body.insert(key.into(), json!(v));
                }
            }
        }

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerError::Timeout(format!("Images API request timed out: {e}"))
                } else {
                    WorkerError::Connection(format!("Images API transport error: {e}"))
                }
            })?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| WorkerError::Connection(format!("Failed to decode Images API body: {e}")))?;

        if !status.is_success() {
            let message = payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Images API error");
            return Err(match status.as_u16() {
                401 | 403 => WorkerError::Authentication(message.to_string()),
                429 => WorkerError::RateLimit(message.to_string()),
                _ => WorkerError::classify_message(message),
            });
        }

        let mut sources = Vec::new();
        if let Some(data) = payload.get("data").and_then(Value::as_array) {
            for entry in data {
                if let Some(url) = entry.get("url").and_then(Value::as_str) {
                    sources.push(ImageSource::Url(url.to_string()));
                } else if let Some(b64) = entry.get("b64_json").and_then(Value::as_str) {
                    sources.push(ImageSource::Base64 {
                        data: b64.to_string(),
                        mime_type: "image/png".to_string(),
                    });
                }
            }
        }

        let usage: Usage = payload
            .get("usage")
            .cloned()
            .and_then(|u| serde_json::from_value(u).ok())
            .unwrap_or_default();

        info!(model = %request.model, images = sources.len(), "Images API call complete");
        Ok((sources, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn auto_values_are_omitted_and_data_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .and(body_partial_json(json!({"model": "gpt-image-1.5", "n": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"url": "https://img/1.png"},
                    {"b64_json": "AA=="}
                ],
                "usage": {"input_tokens": 12, "output_tokens": 0, "total_tokens": 12}
            })))
            .mount(&server)
            .await;

        let client = ImagesClient::with_base_url("k", server.uri());
        let (sources, usage) = client
            .generate(&ImageGenerationRequest {
                model: "gpt-image-1.5".into(),
                prompt: "a dragon".into(),
                size: Some("auto".into()),
                quality: Some("auto".into()),
                background: Some("auto".into()),
                n: 2,
            })
            .await
            .unwrap();

        assert_eq!(sources.len(), 2);
        assert!(matches!(&sources[0], ImageSource::Url(u) if u == "https://img/1.png"));
        assert_eq!(usage.input_tokens, 12);
    }
}
