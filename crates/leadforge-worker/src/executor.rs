// Step executor
//
// Executes exactly one workflow step: dependency gating, context assembly,
// strategy dispatch, artifact/usage persistence, and the rerun-replace write
// of the ExecutionStep. ExecutionSteps are reloaded from durable storage
// immediately before any write, because concurrent invocations each driving
// a different step would otherwise overwrite each other's appends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use leadforge_core::context::{
    build_previous_context, collect_previous_image_urls, current_step_context, dependency_orders,
    format_submission,
};
use leadforge_core::records::{
    ExecutionStep, ExecutionStepKind, Form, Job, Submission, UsageInfo, Workflow, WorkflowStep,
};
use leadforge_core::tools::{has_image_generation, has_shell, validate_and_filter};
use leadforge_core::{Result, WorkerError};
use leadforge_storage::{BlobStore, RecordStore};

use crate::artifacts::step_output_filename;
use crate::s3upload::{build_upload_context, parse_upload_target};
use crate::strategies::{self, StepRunContext, WorkerServices};
use crate::usage::UsageRecorder;

const DEFAULT_MODEL: &str = "gpt-5";
const WEBHOOK_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of executing one step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_index: usize,
    pub step_name: String,
    pub output: String,
    pub artifact_id: Option<String>,
    pub image_urls: Vec<String>,
    pub image_artifact_ids: Vec<String>,
    pub usage: UsageInfo,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    /// Classified error kind when the step failed
    pub error_kind: Option<String>,
}

pub struct StepExecutor {
    services: Arc<WorkerServices>,
    usage_recorder: UsageRecorder,
}

impl StepExecutor {
    pub fn new(services: Arc<WorkerServices>) -> Self {
        let usage_recorder = UsageRecorder::new(services.records.clone());
        Self { services, usage_recorder }
    }

    pub fn services(&self) -> &Arc<WorkerServices> {
        &self.services
    }

    /// Execute one AI-generation step. Strategy failures are recorded as a
    /// failed ExecutionStep and returned as an unsuccessful outcome; only
    /// pre-flight problems (unsatisfied dependencies) error out.
    pub async fn execute(
        &self,
        step: &WorkflowStep,
        step_index: usize,
        job: &Job,
        _workflow: &Workflow,
        submission: &Submission,
        form: Option<&Form>,
    ) -> Result<StepOutcome> {
        let step_name = step.step_name.clone();
        let step_order = (step_index + 1) as u32;
        let started = Utc::now();

        // Mandatory reload: another invocation may have appended steps since
        // this job snapshot was taken.
        let execution_steps = self.reload_execution_steps(&job.job_id).await?;

        // Dependency gating: every declared (or implicit) dependency must be
        // present as a completed step. No polling.
        let deps = dependency_orders(step_index, step.depends_on.as_deref());
        for dep_order in &deps {
            let satisfied = execution_steps.iter().any(|s| {
                s.step_order == *dep_order
                    && matches!(
                        s.step_type,
                        ExecutionStepKind::AiGeneration | ExecutionStepKind::Webhook
                    )
                    && s.succeeded()
            });
            if !satisfied {
                return Err(WorkerError::validation(format!(
                    "Step {step_order} depends on step {dep_order} which has not completed"
                )));
            }
        }

        let model = step
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let (validated_tools, tool_choice) = validate_and_filter(
            &step.tools,
            &step.tool_choice,
            &model,
            self.services.config.shell_availability,
        );

        // Context assembly
        let initial_context = format_submission(&submission.submission_data, form);
        let previous_context = build_previous_context(&initial_context, &execution_steps, &deps);
        let mut context = current_step_context(step_index, &initial_context);
        if has_shell(&validated_tools) {
            context = self
                .maybe_inject_s3_upload_context(step, &execution_steps, job, &context)
                .await?;
        }

        let previous_image_urls = if has_image_generation(&validated_tools) {
            let raw = collect_previous_image_urls(&execution_steps, step_order);
            self.services.pipeline.prepare_input_urls(&raw).await
        } else {
            Vec::new()
        };

        let ctx = StepRunContext {
            tenant_id: job.tenant_id.clone(),
            job_id: job.job_id.clone(),
            step_index,
            step_name: step_name.clone(),
            model: model.clone(),
            instructions: step.instructions.clone(),
            context,
            previous_context,
            tools: validated_tools,
            tool_choice,
            reasoning_effort: step.reasoning_effort.clone(),
            service_tier: step.service_tier.clone(),
            text_verbosity: step.text_verbosity.clone(),
            max_output_tokens: step.max_output_tokens.map(|n| n as i64),
            output_format: step.output_format.clone(),
            previous_image_urls,
            shell_settings: step.shell_settings.clone(),
        };

        info!(
            job_id = %job.job_id,
            step_index,
            step_name = %step_name,
            step_model = %model,
            tools_count = ctx.tools.len(),
            tool_choice = %ctx.tool_choice,
            "Executing AI step"
        );

        match strategies::run(&self.services, &ctx).await {
            Ok(outcome) => {
                let duration_ms = elapsed_ms(started);
                let total_usage = outcome.total_usage();

                for usage in &outcome.usages {
                    self.usage_recorder.record(&job.tenant_id, &job.job_id, usage).await;
                }

                let artifact = self
                    .services
                    .artifacts
                    .store_text(
                        &job.tenant_id,
                        &job.job_id,
                        leadforge_core::records::ArtifactKind::StepOutput,
                        &outcome.text,
                        &step_output_filename(step_order, &step_name),
                        false,
                    )
                    .await?;

                let record = ExecutionStep {
                    step_name: step_name.clone(),
                    step_order,
                    step_type: ExecutionStepKind::AiGeneration,
                    model: Some(model),
                    input: outcome.request_details.clone(),
                    output: json!(outcome.text),
                    image_urls: outcome.image_urls.clone(),
                    usage_info: Some(total_usage.clone()),
                    timestamp: started,
                    duration_ms: Some(duration_ms),
                    artifact_id: Some(artifact.artifact_id.clone()),
                    error: None,
                    success: None,
                };
                self.write_execution_step(&job.job_id, record).await?;

                info!(
                    job_id = %job.job_id,
                    step_index,
                    duration_ms,
                    output_length = outcome.text.len(),
                    total_tokens = total_usage.total_tokens,
                    "AI step completed"
                );

                Ok(StepOutcome {
                    step_index,
                    step_name,
                    output: outcome.text,
                    artifact_id: Some(artifact.artifact_id),
                    image_urls: outcome.image_urls,
                    image_artifact_ids: outcome.image_artifact_ids,
                    usage: total_usage,
                    duration_ms,
                    success: true,
                    error: None,
                    error_kind: None,
                })
            }
            Err(step_error) => {
                let duration_ms = elapsed_ms(started);
                let message = format!("Step {step_order} ({step_name}) failed: {step_error}");
                error!(
                    job_id = %job.job_id,
                    step_index,
                    error_kind = step_error.kind(),
                    error = %step_error,
                    "AI step failed; continuing workflow"
                );

                let record = ExecutionStep {
                    step_name: step_name.clone(),
                    step_order,
                    step_type: ExecutionStepKind::AiGeneration,
                    model: step.model.clone(),
                    input: Value::Null,
                    output: json!(message),
                    image_urls: Vec::new(),
                    usage_info: None,
                    timestamp: started,
                    duration_ms: Some(duration_ms),
                    artifact_id: None,
                    error: Some(step_error.to_string()),
                    success: Some(false),
                };
                self.write_execution_step(&job.job_id, record).await?;

                Ok(StepOutcome {
                    step_index,
                    step_name,
                    output: message,
                    artifact_id: None,
                    image_urls: Vec::new(),
                    image_artifact_ids: Vec::new(),
                    usage: UsageInfo::default(),
                    duration_ms,
                    success: false,
                    error: Some(step_error.to_string()),
                    error_kind: Some(step_error.kind().to_string()),
                })
            }
        }
    }

    /// Execute a webhook step. Failures are recorded but never fail the job.
    pub async fn execute_webhook_step(
        &self,
        step: &WorkflowStep,
        step_index: usize,
        job: &Job,
        submission: &Submission,
        form: Option<&Form>,
    ) -> Result<StepOutcome> {
        let step_name = step.step_name.clone();
        let step_order = (step_index + 1) as u32;
        let started = Utc::now();

        let execution_steps = self.reload_execution_steps(&job.job_id).await?;
        let deps = dependency_orders(step_index, step.depends_on.as_deref());
        let initial_context = format_submission(&submission.submission_data, form);
        let previous_context = build_previous_context(&initial_context, &execution_steps, &deps);

        let payload = match &step.webhook_payload_template {
            Some(template) => substitute_step_outputs(template, &execution_steps),
            None => json!({
                "job_id": job.job_id,
                "step_order": step_order,
                "submission_data": submission.submission_data,
                "context": previous_context,
            }),
        };

        let result = match &step.webhook_url {
            Some(url) => self.post_webhook(url, &step.webhook_headers, &payload).await,
            None => Err(WorkerError::validation(format!(
                "Webhook step {step_order} has no webhook_url"
            ))),
        };

        let duration_ms = elapsed_ms(started);
        let (output, success, error, error_kind) = match result {
            Ok(status) => (format!("Webhook delivered with status {status}"), true, None, None),
            Err(e) => {
                warn!(job_id = %job.job_id, step_index, error = %e, "Webhook step failed");
                (
                    format!("Webhook failed: {e}"),
                    false,
                    Some(e.to_string()),
                    Some(e.kind().to_string()),
                )
            }
        };

        let record = ExecutionStep {
            step_name: step_name.clone(),
            step_order,
            step_type: ExecutionStepKind::Webhook,
            model: None,
            input: payload,
            output: json!(output),
            image_urls: Vec::new(),
            usage_info: None,
            timestamp: started,
            duration_ms: Some(duration_ms),
            artifact_id: None,
            error: error.clone(),
            success: Some(success),
        };
        self.write_execution_step(&job.job_id, record).await?;

        Ok(StepOutcome {
            step_index,
            step_name,
            output,
            artifact_id: None,
            image_urls: Vec::new(),
            image_artifact_ids: Vec::new(),
            usage: UsageInfo::default(),
            duration_ms,
            success,
            error,
            error_kind,
        })
    }

    async fn post_webhook(
        &self,
        url: &str,
        headers: &std::collections::BTreeMap<String, String>,
        payload: &Value,
    ) -> Result<u16> {
        let client = reqwest::Client::new();
        let mut request = client
            .post(url)
            .timeout(WEBHOOK_STEP_TIMEOUT)
            .header("Content-Type", "application/json")
            .json(payload);
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
        Ok(status.as_u16())
    }

    async fn reload_execution_steps(&self, job_id: &str) -> Result<Vec<ExecutionStep>> {
        let job = self
            .services
            .records
            .get_job(job_id)
            .await?
            .ok_or_else(|| WorkerError::validation(format!("Job {job_id} not found")))?;
        Ok(job.execution_steps)
    }

    /// Rerun-replace write: an existing entry with the same (step_order,
    /// step_type) is replaced in place; otherwise the step is appended.
    pub async fn write_execution_step(&self, job_id: &str, step: ExecutionStep) -> Result<()> {
        let mut steps = self.reload_execution_steps(job_id).await?;
        upsert_execution_step(&mut steps, step);
        self.services
            .records
            .update_job(job_id, json!({ "execution_steps": steps }))
            .await
    }

    /// Inject the delegated S3-upload block when the step instructions ask
    /// for it and a previous step produced an artifact.
    async fn maybe_inject_s3_upload_context(
        &self,
        step: &WorkflowStep,
        execution_steps: &[ExecutionStep],
        job: &Job,
        context: &str,
    ) -> Result<String> {
        let default_region =
            std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let Some(target) = parse_upload_target(&step.instructions, &default_region) else {
            return Ok(context.to_string());
        };

        let source_artifact_id = execution_steps
            .iter()
            .filter(|s| s.step_type == ExecutionStepKind::AiGeneration)
            .rev()
            .find_map(|s| s.artifact_id.clone())
            .ok_or_else(|| {
                WorkerError::validation(
                    "S3 upload requested but no previous step artifact was found",
                )
            })?;
        let artifact = self
            .services
            .records
            .get_artifact(&source_artifact_id)
            .await?
            .ok_or_else(|| {
                WorkerError::validation(format!("Artifact {source_artifact_id} not found"))
            })?;
        let source_url = artifact
            .public_url
            .clone()
            .unwrap_or_else(|| self.services.artifacts.blobs().public_url(&artifact.s3_key));

        let block = build_upload_context(
            self.services.artifacts.blobs().as_ref(),
            &self.services.config.s3_upload,
            &target,
            &artifact,
            &source_url,
            &job.tenant_id,
            &job.job_id,
        )
        .await?;

        Ok(if context.trim().is_empty() {
            block
        } else {
            format!("{context}\n\n{block}")
        })
    }
}

/// Replace the entry with the same (step_order, step_type), preserving the
/// position of every other step; append when absent.
pub fn upsert_execution_step(steps: &mut Vec<ExecutionStep>, new: ExecutionStep) {
    match steps
        .iter_mut()
        .find(|s| s.step_order == new.step_order && s.step_type == new.step_type)
    {
        Some(existing) => *existing = new,
        None => steps.push(new),
    }
}

/// Webhook payload templates may reference earlier outputs with
/// "{step_N_output}" placeholders inside string values.
fn substitute_step_outputs(template: &Value, steps: &[ExecutionStep]) -> Value {
    match template {
        Value::String(s) => {
            let mut result = s.clone();
            for step in steps {
                let placeholder = format!("{{step_{}_output}}", step.step_order);
                if result.contains(&placeholder) {
                    result = result.replace(&placeholder, step.output_text());
                }
            }
            Value::String(result)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_step_outputs(item, steps))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_step_outputs(v, steps)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn elapsed_ms(started: chrono::DateTime<Utc>) -> u64 {
    (Utc::now() - started).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(order: u32, kind: ExecutionStepKind, output: &str) -> ExecutionStep {
        ExecutionStep {
            step_name: format!("step-{order}"),
            step_order: order,
            step_type: kind,
            model: None,
            input: Value::Null,
            output: json!(output),
            image_urls: Vec::new(),
            usage_info: None,
            timestamp: Utc::now(),
            duration_ms: None,
            artifact_id: None,
            error: None,
            success: None,
        }
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut steps = vec![
            step(0, ExecutionStepKind::FormSubmission, "form"),
            step(1, ExecutionStepKind::AiGeneration, "A"),
            step(2, ExecutionStepKind::AiGeneration, "B"),
        ];
        upsert_execution_step(&mut steps, step(1, ExecutionStepKind::AiGeneration, "A2"));
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].output_text(), "A2");
        assert_eq!(steps[2].output_text(), "B");

        upsert_execution_step(&mut steps, step(3, ExecutionStepKind::AiGeneration, "C"));
        assert_eq!(steps.len(), 4);
    }

    #[test]
    fn upsert_distinguishes_step_types() {
        let mut steps = vec![step(1, ExecutionStepKind::AiGeneration, "ai")];
        upsert_execution_step(&mut steps, step(1, ExecutionStepKind::Webhook, "hook"));
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn payload_substitution_reaches_nested_strings() {
        let steps = vec![step(1, ExecutionStepKind::AiGeneration, "MARKET: 7/10")];
        let template = json!({
            "summary": "{step_1_output}",
            "nested": {"also": ["{step_1_output}", 42]}
        });
        let result = substitute_step_outputs(&template, &steps);
        assert_eq!(result["summary"], "MARKET: 7/10");
        assert_eq!(result["nested"]["also"][0], "MARKET: 7/10");
        assert_eq!(result["nested"]["also"][1], 42);
    }
}
