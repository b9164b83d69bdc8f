// Delivery: webhook POST and SMS send
//
// Both consume the final artifact plus the per-step artifacts. Delivery is
// best-effort: a failure here never changes the job's terminal status (the
// controller logs and moves on). No retries; infrastructure that wants them
// fires delivery from a retry-capable queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use leadforge_core::records::{Artifact, Job, Submission, Workflow};
use leadforge_core::{Result, WorkerError};
use leadforge_openai::params::{build_params, BuildParamsArgs};
use leadforge_openai::ResponsesApi;
use leadforge_storage::{BlobStore, RecordStore, SecretProvider};

use crate::usage::UsageRecorder;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
const SMS_SECRET_NAME: &str = "sms-gateway";
const SMS_GATEWAY_URL: &str = "https://api.twilio.com/2010-04-01/Accounts";

pub struct DeliveryService {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    api: Arc<dyn ResponsesApi>,
    secrets: Option<Arc<dyn SecretProvider>>,
    usage_recorder: UsageRecorder,
}

impl DeliveryService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        api: Arc<dyn ResponsesApi>,
        secrets: Option<Arc<dyn SecretProvider>>,
    ) -> Self {
        let usage_recorder = UsageRecorder::new(records.clone());
        Self { records, blobs, api, secrets, usage_recorder }
    }

    // ========================================================================
    // Webhook
    // ========================================================================

    pub async fn send_webhook(
        &self,
        webhook_url: &str,
        headers: &BTreeMap<String, String>,
        job: &Job,
        output_url: &str,
        submission: &Submission,
    ) -> Result<()> {
        let artifacts = self
            .records
            .list_artifacts_by_job(&job.job_id)
            .await
            .unwrap_or_else(|e| {
                warn!(job_id = %job.job_id, error = %e, "Failed to query artifacts for webhook");
                Vec::new()
            });

        let payload = self
            .build_webhook_payload(job, output_url, submission, &artifacts)
            .await;

        info!(
            job_id = %job.job_id,
            webhook_url = %webhook_url,
            artifacts_count = artifacts.len(),
            "Sending webhook notification"
        );

        let client = reqwest::Client::new();
        let mut request = client
            .post(webhook_url)
            .timeout(DELIVERY_TIMEOUT)
            .header("Content-Type", "application/json")
            .json(&payload);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                WorkerError::Timeout(format!("Webhook request timed out: {e}"))
            } else {
                WorkerError::Connection(format!("Webhook request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::unknown(format!(
                "Webhook returned status {status}"
            )));
        }
        info!(job_id = %job.job_id, status_code = status.as_u16(), "Webhook notification sent");
        Ok(())
    }

    pub async fn build_webhook_payload(
        &self,
        job: &Job,
        output_url: &str,
        submission: &Submission,
        artifacts: &[Artifact],
    ) -> Value {
        let mut artifacts_list = Vec::new();
        let mut images = Vec::new();
        let mut html_files = Vec::new();
        let mut markdown_files = Vec::new();

        for artifact in artifacts {
            let metadata = artifact_metadata(artifact);
            artifacts_list.push(metadata.clone());
            if artifact.is_image() {
                images.push(metadata);
            } else if artifact.is_html() {
                html_files.push(metadata);
            } else if artifact.is_markdown() {
                markdown_files.push(metadata);
            }
        }

        let submission_data = &submission.submission_data;
        let field = |name: &str| submission_data.get(name).cloned().unwrap_or(Value::Null);

        let mut payload = Map::new();
        payload.insert("job_id".into(), json!(job.job_id));
        payload.insert("status".into(), json!("completed"));
        payload.insert("output_url".into(), json!(output_url));
        payload.insert("submission_data".into(), json!(submission_data));
        payload.insert("lead_name".into(), field("name"));
        payload.insert("lead_email".into(), field("email"));
        payload.insert("lead_phone".into(), field("phone"));
        payload.insert("completed_at".into(), json!(Utc::now()));
        payload.insert("workflow_id".into(), json!(job.workflow_id));
        payload.insert("artifacts".into(), json!(artifacts_list));
        payload.insert("images".into(), json!(images));
        payload.insert("html_files".into(), json!(html_files));
        payload.insert("markdown_files".into(), json!(markdown_files));

        // Context: labeled submission + extracted artifact text + image links
        let mut context_sections = Vec::new();
        let submission_lines: Vec<String> = submission_data
            .iter()
            .filter(|(key, _)| !matches!(key.to_lowercase().as_str(), "context" | "icp"))
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}: {s}"),
                Value::Null => format!("{key}: null"),
                other => format!("{key}: {other}"),
            })
            .collect();
        if !submission_lines.is_empty() {
            context_sections.push(format!("=== Form Submission ===\n{}", submission_lines.join("\n")));
        }
        let artifact_content = self.extract_artifact_content(artifacts).await;
        if !artifact_content.is_empty() {
            context_sections.push(artifact_content);
        }
        if !context_sections.is_empty() {
            payload.insert("context".into(), json!(context_sections.join("\n\n")));
        }

        // Every raw submission field doubles as submission_<k> for
        // downstream templating that cannot index into nested maps
        for (key, value) in submission_data {
            let flat_key = format!("submission_{key}");
            payload.entry(flat_key).or_insert(value.clone());
        }

        Value::Object(payload)
    }

    /// Text of every markdown/html artifact plus a trailing image-link block
    async fn extract_artifact_content(&self, artifacts: &[Artifact]) -> String {
        let mut content_parts = Vec::new();
        let mut image_urls = Vec::new();

        for artifact in artifacts {
            if artifact.is_image() {
                if let Some(url) = &artifact.public_url {
                    image_urls.push(url.clone());
                }
            } else if artifact.is_markdown() {
                match self.blobs.get(&artifact.s3_key).await {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).to_string();
                        content_parts
                            .push(format!("[Markdown File: {}]\n{text}\n", artifact.artifact_name));
                    }
                    Err(e) => {
                        warn!(artifact_id = %artifact.artifact_id, error = %e, "Failed to download markdown artifact")
                    }
                }
            } else if artifact.is_html() {
                match self.blobs.get(&artifact.s3_key).await {
                    Ok(bytes) => {
                        let text = extract_text_from_html(&String::from_utf8_lossy(&bytes));
                        if !text.is_empty() {
                            content_parts
                                .push(format!("[HTML File: {}]\n{text}\n", artifact.artifact_name));
                        }
                    }
                    Err(e) => {
                        warn!(artifact_id = %artifact.artifact_id, error = %e, "Failed to download HTML artifact")
                    }
                }
            }
        }

        let mut result = Vec::new();
        if !content_parts.is_empty() {
            result.push("=== ARTIFACT CONTENT ===\n".to_string());
            result.extend(content_parts);
        }
        if !image_urls.is_empty() {
            result.push("\n=== IMAGE LINKS ===\n".to_string());
            for url in image_urls {
                result.push(format!("- {url}\n"));
            }
        }
        result.join("\n")
    }

    // ========================================================================
    // SMS
    // ========================================================================

    pub async fn send_sms(
        &self,
        workflow: &Workflow,
        job: &Job,
        output_url: &str,
        submission: &Submission,
        research_content: Option<&str>,
    ) -> Result<()> {
        let raw_phone = submission
            .submission_data
            .get("phone")
            .or_else(|| submission.submission_data.get("phone_number"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| submission.submitter_phone.clone())
            .ok_or_else(|| {
                WorkerError::validation(format!(
                    "No phone number found for SMS delivery in job {}",
                    job.job_id
                ))
            })?;
        let phone = normalize_phone(&raw_phone)?;

        let body = if workflow.delivery_sms_ai_generated {
            match self
                .generate_sms_message(workflow, job, output_url, submission, research_content)
                .await
            {
                Ok(message) => message,
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Failed to generate SMS message; using default");
                    format!("Thank you! Your personalized report is ready: {output_url}")
                }
            }
        } else {
            match &workflow.delivery_sms_message {
                Some(template) if !template.is_empty() => {
                    let name = submission
                        .submission_data
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("there");
                    template
                        .replace("{output_url}", output_url)
                        .replace("{name}", name)
                        .replace("{job_id}", &job.job_id)
                }
                _ => format!("Thank you! Your personalized report is ready: {output_url}"),
            }
        };

        let secrets = self.secrets.as_ref().ok_or_else(|| {
            WorkerError::Authentication("SMS requested but no secret provider configured".into())
        })?;
        let creds = secrets.get_secret(SMS_SECRET_NAME).await?;
        let account_sid = creds.get("account_sid").cloned().unwrap_or_default();
        let auth_token = creds.get("auth_token").cloned().unwrap_or_default();
        let from_number = creds.get("from_number").cloned().unwrap_or_default();
        if account_sid.is_empty() || auth_token.is_empty() || from_number.is_empty() {
            return Err(WorkerError::Authentication(
                "SMS gateway credentials incomplete - missing required fields".into(),
            ));
        }

        info!(job_id = %job.job_id, message_length = body.len(), "Sending SMS notification");
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{SMS_GATEWAY_URL}/{account_sid}/Messages.json"))
            .basic_auth(&account_sid, Some(&auth_token))
            .timeout(DELIVERY_TIMEOUT)
            .form(&[("From", from_number.as_str()), ("To", phone.as_str()), ("Body", body.as_str())])
            .send()
            .await
            .map_err(|e| WorkerError::Connection(format!("Failed to send SMS: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::unknown(format!(
                "SMS gateway returned {status}: {body}"
            )));
        }
        info!(job_id = %job.job_id, "SMS sent");
        Ok(())
    }

    /// One short message (<= 160 chars recommended) generated by the model
    async fn generate_sms_message(
        &self,
        workflow: &Workflow,
        job: &Job,
        output_url: &str,
        submission: &Submission,
        research_content: Option<&str>,
    ) -> Result<String> {
        let sms_instructions = workflow
            .delivery_sms_ai_instructions
            .clone()
            .unwrap_or_else(|| {
                "Keep it friendly, include the URL, and make it personal.".to_string()
            });

        let mut context_parts = Vec::new();
        if let Some(research) = research_content {
            let preview: String = research.chars().take(500).collect();
            context_parts.push(format!("Research Content: {preview}..."));
        }
        context_parts.push(format!(
            "Form Submission: {}",
            serde_json::to_string(&submission.submission_data).unwrap_or_default()
        ));
        context_parts.push(format!("Lead Magnet URL: {output_url}"));

        let prompt = format!(
            "Generate a friendly, concise SMS message (max 160 characters) to send to a lead \
             with their personalized lead magnet.\n\n{sms_instructions}\n\nContext:\n{}\n\n\
             Generate ONLY the SMS message text, no explanations, no markdown.",
            context_parts.join("\n")
        );

        let model = workflow.ai_model.clone().unwrap_or_else(|| "gpt-5".to_string());
        let request = build_params(BuildParamsArgs {
            model: &model,
            instructions: &prompt,
            input_text: "",
            tools: &[],
            tool_choice: "none",
            ..Default::default()
        });
        let response = self.api.call(&request).await?;

        let counts = response.usage.clone().unwrap_or_default();
        let cost = leadforge_core::cost::calculate_cost(&model, counts.input_tokens, counts.output_tokens);
        self.usage_recorder
            .record(
                &job.tenant_id,
                &job.job_id,
                &leadforge_core::records::UsageInfo {
                    model: Some(model),
                    input_tokens: counts.input_tokens,
                    output_tokens: counts.output_tokens,
                    total_tokens: counts.total_tokens,
                    cost_usd: cost.cost_usd,
                    service_type: Some("openai_sms_generation".to_string()),
                },
            )
            .await;

        let mut message = response.text().trim().to_string();
        for quote in ['"', '\''] {
            if message.starts_with(quote) && message.ends_with(quote) && message.len() >= 2 {
                message = message[1..message.len() - 1].to_string();
            }
        }
        Ok(message)
    }
}

fn artifact_metadata(artifact: &Artifact) -> Value {
    let public_url = artifact.public_url.clone().unwrap_or_default();
    json!({
        "artifact_id": artifact.artifact_id,
        "artifact_type": artifact.artifact_type,
        "artifact_name": artifact.artifact_name,
        "public_url": public_url,
        "object_url": public_url,
        "s3_key": artifact.s3_key,
        "file_size_bytes": artifact.file_size_bytes,
        "mime_type": artifact.mime_type,
        "created_at": artifact.created_at,
    })
}

/// Strip script/style blocks, tags, and entities; collapse whitespace.
pub fn extract_text_from_html(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    let no_scripts = Regex::new(r"(?is)<script[^>]*>.*?</script>")
        .map(|re| re.replace_all(html, "").into_owned())
        .unwrap_or_else(|_| html.to_string());
    let no_styles = Regex::new(r"(?is)<style[^>]*>.*?</style>")
        .map(|re| re.replace_all(&no_scripts, "").into_owned())
        .unwrap_or(no_scripts);
    let no_tags = Regex::new(r"<[^>]+>")
        .map(|re| re.replace_all(&no_styles, "").into_owned())
        .unwrap_or(no_styles);

    let decoded = no_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    Regex::new(r"\s+")
        .map(|re| re.replace_all(&decoded, " ").trim().to_string())
        .unwrap_or(decoded)
}

/// Normalize a submitted phone number to +E.164. Ten digits get +1; eleven
/// digits starting with 1 get +; anything else just gains the +.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '-' | ' ' | '(' | ')' | '.'))
        .collect();

    let normalized = if stripped.starts_with('+') {
        stripped
    } else if stripped.len() == 10 {
        format!("+1{stripped}")
    } else if stripped.len() == 11 && stripped.starts_with('1') {
        format!("+{stripped}")
    } else {
        format!("+{stripped}")
    };

    let digits = normalized.chars().filter(char::is_ascii_digit).count();
    if digits < 10 {
        return Err(WorkerError::validation(format!(
            "Invalid phone number format: {normalized}"
        )));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use leadforge_core::records::ArtifactKind;

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("555-123-4567").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("(555) 123 4567").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("15551234567").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("+447700900123").unwrap(), "+447700900123");
        assert!(normalize_phone("12345").is_err());
    }

    #[test]
    fn html_text_extraction() {
        let html = r#"<html><head><style>body{color:red}</style></head>
            <body><script>alert(1)</script><h1>Hello &amp; welcome</h1>
            <p>Line   one</p></body></html>"#;
        assert_eq!(extract_text_from_html(html), "Hello & welcome Line one");
        assert_eq!(extract_text_from_html(""), "");
    }

    #[test]
    fn artifact_metadata_shape() {
        let artifact = Artifact {
            artifact_id: "a1".into(),
            tenant_id: "t1".into(),
            job_id: "j1".into(),
            artifact_type: ArtifactKind::Image,
            artifact_name: "shot.jpg".into(),
            s3_key: "artifacts/a1".into(),
            public_url: Some("https://blobs/a1".into()),
            file_size_bytes: Some(2048),
            mime_type: "image/jpeg".into(),
            created_at: Utc::now(),
        };
        let metadata = artifact_metadata(&artifact);
        assert_eq!(metadata["artifact_id"], "a1");
        assert_eq!(metadata["object_url"], "https://blobs/a1");
        assert_eq!(metadata["file_size_bytes"], 2048);
    }
}
