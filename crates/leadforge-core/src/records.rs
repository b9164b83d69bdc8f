// Domain records shared by the worker, storage, and delivery layers
//
// Records mirror what the record store persists. Numeric fields tolerate
// decimal-boxed representations (e.g. 2.0 for 2) coming back from the store:
// lenient deserializers coerce them to plain integers at the boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ============================================================================
// Lenient numeric deserialization
// ============================================================================

pub(crate) fn de_u32_lenient<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    coerce_u64(&value)
        .map(|n| n as u32)
        .ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {value}")))
}

pub(crate) fn de_opt_u32_lenient<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => coerce_u64(&v)
            .map(|n| Some(n as u32))
            .ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {v}"))),
    }
}

pub(crate) fn de_opt_u64_lenient<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => coerce_u64(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {v}"))),
    }
}

pub(crate) fn de_opt_usize_vec_lenient<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<usize>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                match coerce_u64(item) {
                    Some(n) => out.push(n as usize),
                    None => {
                        return Err(serde::de::Error::custom(format!(
                            "expected an integer index, got {item}"
                        )))
                    }
                }
            }
            Ok(Some(out))
        }
        Some(v) => Err(serde::de::Error::custom(format!(
            "expected an array of indices, got {v}"
        ))),
    }
}

/// Coerce a JSON value into a non-negative integer. Floats with an integral
/// value (the decimal-boxed case) are accepted; everything else is rejected.
pub fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u)
            } else {
                n.as_f64().and_then(|f| {
                    if f >= 0.0 && f.fract() == 0.0 {
                        Some(f as u64)
                    } else {
                        None
                    }
                })
            }
        }
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

// ============================================================================
// Job
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub tenant_id: String,
    pub workflow_id: String,
    pub submission_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_step: Option<LiveStep>,
}

// ============================================================================
// Execution steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStepKind {
    FormSubmission,
    AiGeneration,
    Webhook,
    HtmlGeneration,
    FinalOutput,
}

/// Evidence that a step ran: inputs, outputs, usage, and error if any.
///
/// At most one entry exists per (step_order, step_type); reruns replace the
/// existing entry in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_name: String,
    #[serde(deserialize_with = "de_u32_lenient")]
    pub step_order: u32,
    pub step_type: ExecutionStepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_info: Option<UsageInfo>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "de_opt_u64_lenient", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl ExecutionStep {
    /// Output as plain text (AI steps store a string; structural steps store
    /// objects, which render empty here).
    pub fn output_text(&self) -> &str {
        self.output.as_str().unwrap_or("")
    }

    /// A step counts as completed unless it explicitly recorded failure.
    pub fn succeeded(&self) -> bool {
        self.success.unwrap_or(true) && self.error.is_none()
    }

    /// Non-empty image URLs produced by this step.
    pub fn image_urls(&self) -> impl Iterator<Item = &str> {
        self.image_urls.iter().map(String::as_str).filter(|u| !u.is_empty())
    }
}

// ============================================================================
// Submission & form
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    #[serde(default)]
    pub submission_data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub field_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormFieldsSchema {
    #[serde(default)]
    pub fields: Vec<FormField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Form {
    pub form_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_fields_schema: Option<FormFieldsSchema>,
}

impl Form {
    /// field_id -> human label, for rendering submissions
    pub fn field_label_map(&self) -> BTreeMap<&str, &str> {
        let mut map = BTreeMap::new();
        if let Some(schema) = &self.form_fields_schema {
            for field in &schema.fields {
                if let Some(label) = &field.label {
                    map.insert(field.field_id.as_str(), label.as_str());
                }
            }
        }
        map
    }
}

// ============================================================================
// Workflow
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    AiGeneration,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    #[default]
    None,
    Webhook,
    Sms,
}

/// Per-step shell runtime overrides; env values fill any gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellSettings {
    #[serde(default, deserialize_with = "de_opt_u32_lenient", skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, deserialize_with = "de_opt_u64_lenient", skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64_lenient", skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u32_lenient", skip_serializing_if = "Option::is_none")]
    pub command_max_output_length: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// 1-based position within the workflow
    #[serde(deserialize_with = "de_u32_lenient")]
    pub step_order: u32,
    pub step_name: String,
    #[serde(default)]
    pub step_type: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: String,
    /// Tools as the workflow author wrote them: strings or objects
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default = "default_tool_choice")]
    pub tool_choice: String,
    /// 0-indexed earlier steps this step consumes; None means all earlier
    #[serde(default, deserialize_with = "de_opt_usize_vec_lenient", skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_verbosity: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u32_lenient", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_settings: Option<ShellSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub webhook_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_payload_template: Option<Value>,
}

fn default_tool_choice() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u32_lenient", skip_serializing_if = "Option::is_none")]
    pub template_version: Option<u32>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub delivery_method: DeliveryMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub delivery_webhook_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_sms_message: Option<String>,
    #[serde(default)]
    pub delivery_sms_ai_generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_sms_ai_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model: Option<String>,
}

impl Workflow {
    /// Steps in step_order, which is the only order the executor honors.
    pub fn sorted_steps(&self) -> Vec<&WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.step_order);
        steps
    }
}

// ============================================================================
// Template
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    #[serde(default, deserialize_with = "de_opt_u32_lenient", skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub html_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_description: Option<String>,
    #[serde(default)]
    pub is_published: bool,
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    StepOutput,
    Image,
    MarkdownFinal,
    HtmlFinal,
    ReportMarkdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub tenant_id: String,
    pub job_id: String,
    pub artifact_type: ArtifactKind,
    pub artifact_name: String,
    /// Blob key under which the bytes live
    pub s3_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u64_lenient", skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn is_image(&self) -> bool {
        self.artifact_type == ArtifactKind::Image
            || has_extension(&self.artifact_name, &["png", "jpg", "jpeg", "gif", "webp"])
    }

    pub fn is_html(&self) -> bool {
        self.artifact_type == ArtifactKind::HtmlFinal || has_extension(&self.artifact_name, &["html"])
    }

    pub fn is_markdown(&self) -> bool {
        matches!(
            self.artifact_type,
            ArtifactKind::MarkdownFinal | ArtifactKind::StepOutput | ArtifactKind::ReportMarkdown
        ) || has_extension(&self.artifact_name, &["md", "markdown"])
    }
}

fn has_extension(name: &str, exts: &[&str]) -> bool {
    let lower = name.to_lowercase();
    exts.iter().any(|ext| lower.ends_with(&format!(".{ext}")))
}

// ============================================================================
// Usage
// ============================================================================

/// Per-call usage summary attached to execution steps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "de_u32_lenient_default")]
    pub input_tokens: u32,
    #[serde(default, deserialize_with = "de_u32_lenient_default")]
    pub output_tokens: u32,
    #[serde(default, deserialize_with = "de_u32_lenient_default")]
    pub total_tokens: u32,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

fn de_u32_lenient_default<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(de_opt_u32_lenient(deserializer)?.unwrap_or(0))
}

/// Append-only per-call cost record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub usage_id: String,
    pub tenant_id: String,
    pub job_id: String,
    pub service_type: String,
    pub model: String,
    #[serde(default, deserialize_with = "de_u32_lenient_default")]
    pub input_tokens: u32,
    #[serde(default, deserialize_with = "de_u32_lenient_default")]
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Live step preview
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStepStatus {
    Streaming,
    Retrying,
    Final,
    Error,
}

/// Transient last-writer-wins preview of the running step.
///
/// Never a source of truth: completion and output are decided from the
/// ExecutionStep list alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStep {
    #[serde(deserialize_with = "de_u32_lenient")]
    pub step_order: u32,
    pub output_text: String,
    pub status: LiveStepStatus,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Notification
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    pub tenant_id: String,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_resource_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_order_accepts_decimal_boxed_numbers() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "step_order": 2.0,
            "step_name": "Research",
            "max_output_tokens": 2048.0,
            "depends_on": [0.0, 1.0]
        }))
        .unwrap();
        assert_eq!(step.step_order, 2);
        assert_eq!(step.max_output_tokens, Some(2048));
        assert_eq!(step.depends_on, Some(vec![0, 1]));
        assert_eq!(step.tool_choice, "auto");
        assert_eq!(step.step_type, StepKind::AiGeneration);
    }

    #[test]
    fn execution_step_output_text_handles_structured_output() {
        let step: ExecutionStep = serde_json::from_value(json!({
            "step_name": "Final Output",
            "step_order": 3,
            "step_type": "final_output",
            "output": {"artifact_id": "a1"},
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(step.output_text(), "");
        assert!(step.succeeded());
    }

    #[test]
    fn failed_execution_step_is_not_successful() {
        let step: ExecutionStep = serde_json::from_value(json!({
            "step_name": "Research",
            "step_order": 1,
            "step_type": "ai_generation",
            "output": "boom",
            "error": "OpenAI API error",
            "success": false,
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(!step.succeeded());
    }

    #[test]
    fn workflow_sorted_steps_orders_by_step_order() {
        let workflow: Workflow = serde_json::from_value(json!({
            "workflow_id": "w1",
            "steps": [
                {"step_order": 2, "step_name": "b"},
                {"step_order": 1, "step_name": "a"}
            ]
        }))
        .unwrap();
        let names: Vec<&str> = workflow
            .sorted_steps()
            .iter()
            .map(|s| s.step_name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn form_field_label_map_falls_back_to_id() {
        let form: Form = serde_json::from_value(json!({
            "form_id": "f1",
            "form_fields_schema": {"fields": [
                {"field_id": "name", "label": "Your Name"},
                {"field_id": "topic"}
            ]}
        }))
        .unwrap();
        let map = form.field_label_map();
        assert_eq!(map.get("name"), Some(&"Your Name"));
        assert_eq!(map.get("topic"), None);
    }

    #[test]
    fn artifact_categorization() {
        let artifact: Artifact = serde_json::from_value(json!({
            "artifact_id": "a1",
            "tenant_id": "t1",
            "job_id": "j1",
            "artifact_type": "step_output",
            "artifact_name": "step_1_research.md",
            "s3_key": "artifacts/a1",
            "mime_type": "text/markdown",
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(artifact.is_markdown());
        assert!(!artifact.is_image());
        assert!(!artifact.is_html());
    }

    #[test]
    fn live_step_truncated_flag_is_omitted_when_false() {
        let live = LiveStep {
            step_order: 1,
            output_text: "hello".into(),
            status: LiveStepStatus::Streaming,
            truncated: false,
            error: None,
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&live).unwrap();
        assert!(value.get("truncated").is_none());
    }
}
