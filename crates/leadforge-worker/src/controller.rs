// Job controller
//
// Top-level orchestration: initialization, driving the step sequence,
// HTML assembly against a published template, final artifact, delivery,
// and terminal status. Batch mode runs every step in one invocation;
// single mode executes one step per invocation for external schedulers
// and keeps its result payload compact.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use leadforge_core::context::{dependency_orders, format_submission};
use leadforge_core::records::{
    ArtifactKind, ExecutionStep, ExecutionStepKind, Form, Job, Notification, StepKind, Submission,
    Template, UsageInfo, Workflow,
};
use leadforge_core::{Result, WorkerError};
use leadforge_openai::params::{build_params, BuildParamsArgs};
use leadforge_openai::ResponsesApi;
use leadforge_storage::RecordStore;

use crate::delivery::DeliveryService;
use crate::executor::{StepExecutor, StepOutcome};
use crate::html::{build_html_instructions, build_html_user_message, clean_html_markdown, looks_like_html};
use crate::strategies::WorkerServices;
use crate::usage::UsageRecorder;

pub struct JobController {
    services: Arc<WorkerServices>,
    executor: StepExecutor,
    delivery: DeliveryService,
    usage_recorder: UsageRecorder,
}

/// Compact result for the invoker (kept small for size-limited scheduler
/// payloads; large request bodies are never echoed)
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SingleStepResult {
    pub job_id: String,
    pub step_index: usize,
    pub success: bool,
    pub step_name: Option<String>,
    pub artifact_id: Option<String>,
    pub output_url: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

struct JobContext {
    job: Job,
    workflow: Workflow,
    submission: Submission,
    form: Option<Form>,
}

impl JobController {
    pub fn new(services: Arc<WorkerServices>) -> Self {
        let executor = StepExecutor::new(services.clone());
        let delivery = DeliveryService::new(
            services.records.clone(),
            services.artifacts.blobs().clone(),
            services.api.clone(),
            services.secrets.clone(),
        );
        let usage_recorder = UsageRecorder::new(services.records.clone());
        Self { services, executor, delivery, usage_recorder }
    }

    // ========================================================================
    // Batch mode
    // ========================================================================

    /// Drive a job end to end. Any uncaught failure during mandatory work
    /// marks the job failed with a classified error.
    pub async fn process_job(&self, job_id: &str) -> JobResult {
        info!(job_id = %job_id, "Starting job processing");
        match self.process_job_inner(job_id).await {
            Ok(output_url) => JobResult {
                job_id: job_id.to_string(),
                success: true,
                output_url: Some(output_url),
                error: None,
            },
            Err(e) => {
                error!(job_id = %job_id, error_kind = e.kind(), error = %e, "Job processing failed");
                self.mark_failed(job_id, &e).await;
                JobResult {
                    job_id: job_id.to_string(),
                    success: false,
                    output_url: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn process_job_inner(&self, job_id: &str) -> Result<String> {
        let ctx = self.load_context(job_id).await?;
        let started_at = Utc::now();

        // Fresh run: status advances to processing and the step list resets
        self.services
            .records
            .update_job(
                job_id,
                json!({
                    "status": "processing",
                    "started_at": started_at,
                    "execution_steps": [],
                    "live_step": Value::Null,
                }),
            )
            .await?;

        self.append_form_submission_step(&ctx).await?;

        // Drive the scheduler: sequential, skipping steps whose dependency
        // set includes a failed step
        let sorted: Vec<_> = ctx.workflow.sorted_steps().into_iter().cloned().collect();
        let mut failed_orders: HashSet<u32> = HashSet::new();
        let mut outcomes: Vec<StepOutcome> = Vec::new();
        let mut artifact_ids: Vec<String> = Vec::new();

        for (step_index, step) in sorted.iter().enumerate() {
            let step_order = (step_index + 1) as u32;
            let deps = dependency_orders(step_index, step.depends_on.as_deref());
            if let Some(blocked_on) = deps.iter().find(|d| failed_orders.contains(d)) {
                warn!(
                    job_id = %job_id,
                    step_index,
                    blocked_on,
                    "Skipping step - dependency failed"
                );
                self.record_skipped_step(&ctx, step, step_order, *blocked_on).await?;
                failed_orders.insert(step_order);
                continue;
            }

            let is_webhook = step.step_type == StepKind::Webhook || step.webhook_url.is_some();
            let outcome = if is_webhook {
                self.executor
                    .execute_webhook_step(step, step_index, &ctx.job, &ctx.submission, ctx.form.as_ref())
                    .await
            } else {
                self.executor
                    .execute(step, step_index, &ctx.job, &ctx.workflow, &ctx.submission, ctx.form.as_ref())
                    .await
            };

            match outcome {
                Ok(outcome) => {
                    if !outcome.success {
                        failed_orders.insert(step_order);
                    }
                    if let Some(artifact_id) = &outcome.artifact_id {
                        artifact_ids.push(artifact_id.clone());
                    }
                    artifact_ids.extend(outcome.image_artifact_ids.iter().cloned());
                    outcomes.push(outcome);
                }
                Err(e) => {
                    return Err(prefix_error(
                        e,
                        &format!("Failed to process step {step_order}"),
                    ));
                }
            }
        }

        let successful: Vec<&StepOutcome> = outcomes.iter().filter(|o| o.success).collect();
        if successful.is_empty() {
            // Surface the first step failure's classification at the job level
            let first_failed = outcomes.iter().find(|o| o.error.is_some());
            let message = format!(
                "All workflow steps failed: {}",
                first_failed
                    .and_then(|o| o.error.clone())
                    .unwrap_or_else(|| "no steps executed".to_string())
            );
            let kind = first_failed
                .and_then(|o| o.error_kind.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(WorkerError::from_kind(&kind, message));
        }

        // Final assembly
        let template = self.load_published_template(&ctx.workflow).await;
        let last_output = successful.last().map(|o| o.output.clone()).unwrap_or_default();
        let (final_content, final_kind, final_filename) = match &template {
            Some(template) => {
                if looks_like_html(&last_output) {
                    (last_output, ArtifactKind::HtmlFinal, "final.html")
                } else {
                    let html = self
                        .generate_html(&ctx, template, &sorted.last().and_then(|s| s.model.clone()))
                        .await
                        .map_err(|e| prefix_error(e, "Failed to generate HTML"))?;
                    (html, ArtifactKind::HtmlFinal, "final.html")
                }
            }
            None => (last_output, ArtifactKind::MarkdownFinal, "final.md"),
        };

        let final_artifact = self
            .services
            .artifacts
            .store_text(
                &ctx.job.tenant_id,
                job_id,
                final_kind,
                &final_content,
                final_filename,
                true,
            )
            .await
            .map_err(|e| prefix_error(e, "Failed to store final document"))?;
        artifact_ids.push(final_artifact.artifact_id.clone());
        let output_url = final_artifact.public_url.clone();

        self.append_final_output_step(job_id, &final_artifact.artifact_id, &output_url, final_kind, final_filename)
            .await?;

        // Terminal status before best-effort delivery: delivery failures must
        // not flip a completed job
        self.services
            .records
            .update_job(
                job_id,
                json!({
                    "status": "completed",
                    "completed_at": Utc::now(),
                    "output_url": output_url,
                    "artifacts": artifact_ids,
                }),
            )
            .await?;

        self.run_delivery(&ctx, &output_url, &successful).await;
        self.notify_completion(&ctx).await;

        info!(job_id = %job_id, output_url = %output_url, "Job completed");
        Ok(output_url)
    }

    // ========================================================================
    // Single mode
    // ========================================================================

    /// Execute one step in its own invocation. `step_kind` is
    /// "workflow_step" or "html_generation".
    pub async fn process_single_step(
        &self,
        job_id: &str,
        step_index: usize,
        step_kind: &str,
    ) -> SingleStepResult {
        match self.process_single_step_inner(job_id, step_index, step_kind).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("Failed to process step {step_index}: {e}");
                error!(job_id = %job_id, step_index, error = %e, "Single step failed");
                self.mark_failed(job_id, &WorkerError::classify_message(&message)).await;
                SingleStepResult {
                    job_id: job_id.to_string(),
                    step_index,
                    success: false,
                    step_name: None,
                    artifact_id: None,
                    output_url: None,
                    duration_ms: 0,
                    error: Some(message),
                }
            }
        }
    }

    async fn process_single_step_inner(
        &self,
        job_id: &str,
        step_index: usize,
        step_kind: &str,
    ) -> Result<SingleStepResult> {
        let ctx = self.load_context(job_id).await?;

        if step_kind == "html_generation" {
            return self.process_html_generation_step(&ctx).await;
        }

        let sorted: Vec<_> = ctx.workflow.sorted_steps().into_iter().cloned().collect();
        if sorted.is_empty() {
            return Err(WorkerError::validation(format!(
                "Workflow {} has no steps configured",
                ctx.workflow.workflow_id
            )));
        }
        let step = sorted.get(step_index).ok_or_else(|| {
            WorkerError::validation(format!(
                "Step index {step_index} is out of range. Workflow has {} steps.",
                sorted.len()
            ))
        })?;

        // Step 0 owns writing the form_submission record in single mode
        if step_index == 0 {
            self.append_form_submission_step(&ctx).await?;
        }

        let is_webhook = step.step_type == StepKind::Webhook || step.webhook_url.is_some();
        let outcome = if is_webhook {
            self.executor
                .execute_webhook_step(step, step_index, &ctx.job, &ctx.submission, ctx.form.as_ref())
                .await?
        } else {
            self.executor
                .execute(step, step_index, &ctx.job, &ctx.workflow, &ctx.submission, ctx.form.as_ref())
                .await?
        };

        // Last step with a published template: store the output eagerly as
        // the final HTML artifact
        let mut output_url = None;
        let is_last = step_index + 1 == sorted.len();
        if is_last && outcome.success {
            if let Some(_template) = self.load_published_template(&ctx.workflow).await {
                if looks_like_html(&outcome.output) {
                    match self
                        .services
                        .artifacts
                        .store_text(
                            &ctx.job.tenant_id,
                            job_id,
                            ArtifactKind::HtmlFinal,
                            &outcome.output,
                            "final.html",
                            true,
                        )
                        .await
                    {
                        Ok(stored) => {
                            let mut artifacts = ctx.job.artifacts.clone();
                            if !artifacts.contains(&stored.artifact_id) {
                                artifacts.push(stored.artifact_id.clone());
                            }
                            self.services
                                .records
                                .update_job(
                                    job_id,
                                    json!({
                                        "output_url": stored.public_url,
                                        "artifacts": artifacts,
                                    }),
                                )
                                .await?;
                            output_url = Some(stored.public_url);
                        }
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "Failed to store HTML artifact for last step")
                        }
                    }
                }
            }
        }

        Ok(SingleStepResult {
            job_id: job_id.to_string(),
            step_index,
            success: outcome.success,
            step_name: Some(outcome.step_name),
            artifact_id: outcome.artifact_id,
            output_url,
            duration_ms: outcome.duration_ms,
            error: outcome.error,
        })
    }

    async fn process_html_generation_step(&self, ctx: &JobContext) -> Result<SingleStepResult> {
        let template = self
            .load_published_template(&ctx.workflow)
            .await
            .ok_or_else(|| {
                WorkerError::validation("HTML generation requested but no published template found")
            })?;
        let started = Utc::now();
        let model = ctx
            .workflow
            .sorted_steps()
            .last()
            .and_then(|s| s.model.clone());
        let html = self.generate_html(ctx, &template, &model).await?;

        let stored = self
            .services
            .artifacts
            .store_text(
                &ctx.job.tenant_id,
                &ctx.job.job_id,
                ArtifactKind::HtmlFinal,
                &html,
                "final.html",
                true,
            )
            .await?;
        self.services
            .records
            .update_job(
                &ctx.job.job_id,
                json!({ "output_url": stored.public_url }),
            )
            .await?;

        Ok(SingleStepResult {
            job_id: ctx.job.job_id.clone(),
            step_index: 0,
            success: true,
            step_name: Some("HTML Generation".to_string()),
            artifact_id: Some(stored.artifact_id),
            output_url: Some(stored.public_url),
            duration_ms: (Utc::now() - started).num_milliseconds().max(0) as u64,
            error: None,
        })
    }

    // ========================================================================
    // Shared pieces
    // ========================================================================

    async fn load_context(&self, job_id: &str) -> Result<JobContext> {
        let job = self
            .services
            .records
            .get_job(job_id)
            .await?
            .ok_or_else(|| WorkerError::validation(format!("Job {job_id} not found")))?;
        let workflow = self
            .services
            .records
            .get_workflow(&job.workflow_id)
            .await?
            .ok_or_else(|| {
                WorkerError::validation(format!("Workflow {} not found", job.workflow_id))
            })?;
        let submission = self
            .services
            .records
            .get_submission(&job.submission_id)
            .await?
            .ok_or_else(|| {
                WorkerError::validation(format!("Submission {} not found", job.submission_id))
            })?;
        let form = match &submission.form_id {
            Some(form_id) => match self.services.records.get_form(form_id).await {
                Ok(form) => form,
                Err(e) => {
                    warn!(form_id = %form_id, error = %e, "Could not retrieve form for field labels");
                    None
                }
            },
            None => None,
        };
        Ok(JobContext { job, workflow, submission, form })
    }

    async fn append_form_submission_step(&self, ctx: &JobContext) -> Result<()> {
        let record = ExecutionStep {
            step_name: "Form Submission".to_string(),
            step_order: 0,
            step_type: ExecutionStepKind::FormSubmission,
            model: None,
            input: json!(ctx.submission.submission_data),
            output: json!(ctx.submission.submission_data),
            image_urls: Vec::new(),
            usage_info: None,
            timestamp: Utc::now(),
            duration_ms: Some(0),
            artifact_id: None,
            error: None,
            success: None,
        };
        self.executor.write_execution_step(&ctx.job.job_id, record).await
    }

    async fn record_skipped_step(
        &self,
        ctx: &JobContext,
        step: &leadforge_core::records::WorkflowStep,
        step_order: u32,
        blocked_on: u32,
    ) -> Result<()> {
        let message = format!(
            "Step {step_order} ({}) skipped: dependency step {blocked_on} failed",
            step.step_name
        );
        let record = ExecutionStep {
            step_name: step.step_name.clone(),
            step_order,
            step_type: if step.step_type == StepKind::Webhook {
                ExecutionStepKind::Webhook
            } else {
                ExecutionStepKind::AiGeneration
            },
            model: step.model.clone(),
            input: Value::Null,
            output: json!(message),
            image_urls: Vec::new(),
            usage_info: None,
            timestamp: Utc::now(),
            duration_ms: Some(0),
            artifact_id: None,
            error: Some(message),
            success: Some(false),
        };
        self.executor.write_execution_step(&ctx.job.job_id, record).await
    }

    async fn load_published_template(&self, workflow: &Workflow) -> Option<Template> {
        let template_id = workflow.template_id.as_ref()?;
        match self
            .services
            .records
            .get_template(template_id, workflow.template_version)
            .await
        {
            Ok(Some(template)) if template.is_published => Some(template),
            Ok(Some(_)) => {
                warn!(template_id = %template_id, "Template not published, skipping HTML generation");
                None
            }
            Ok(None) => {
                warn!(template_id = %template_id, "Template not found, skipping HTML generation");
                None
            }
            Err(e) => {
                warn!(template_id = %template_id, error = %e, "Failed to load template, skipping HTML generation");
                None
            }
        }
    }

    /// HTML assembly: template + style notes + submission data + the full
    /// step context, one model call, fences stripped.
    async fn generate_html(
        &self,
        ctx: &JobContext,
        template: &Template,
        model: &Option<String>,
    ) -> Result<String> {
        let model = model.clone().unwrap_or_else(|| "gpt-5".to_string());
        let started = Utc::now();

        // Re-read the step list so the context reflects what actually ran
        let job = self
            .services
            .records
            .get_job(&ctx.job.job_id)
            .await?
            .ok_or_else(|| WorkerError::validation(format!("Job {} not found", ctx.job.job_id)))?;
        let initial_context = format_submission(&ctx.submission.submission_data, ctx.form.as_ref());
        let all_orders: Vec<u32> = job
            .execution_steps
            .iter()
            .filter(|s| s.step_type == ExecutionStepKind::AiGeneration)
            .map(|s| s.step_order)
            .collect();
        let accumulated = leadforge_core::context::build_previous_context(
            &initial_context,
            &job.execution_steps,
            &all_orders,
        );

        let instructions = build_html_instructions(template.style_description.as_deref());
        let user_message = build_html_user_message(
            &accumulated,
            &template.html_content,
            &ctx.submission.submission_data,
        );

        let request = build_params(BuildParamsArgs {
            model: &model,
            instructions: &instructions,
            input_text: &user_message,
            tools: &[],
            tool_choice: "none",
            ..Default::default()
        });

        info!(job_id = %ctx.job.job_id, model = %model, "Generating HTML from accumulated step outputs");
        let response = self.services.api.call(&request).await?;
        let html = clean_html_markdown(&response.text());

        let counts = response.usage.clone().unwrap_or_default();
        let cost = leadforge_core::cost::calculate_cost(&model, counts.input_tokens, counts.output_tokens);
        let usage = UsageInfo {
            model: Some(model.clone()),
            input_tokens: counts.input_tokens,
            output_tokens: counts.output_tokens,
            total_tokens: counts.total_tokens,
            cost_usd: cost.cost_usd,
            service_type: Some("openai_worker_html".to_string()),
        };
        self.usage_recorder.record(&ctx.job.tenant_id, &ctx.job.job_id, &usage).await;

        // Record the assembly as its own execution step, output truncated
        // for record-store economy (the artifact holds the full document)
        let next_order = job
            .execution_steps
            .iter()
            .map(|s| s.step_order)
            .max()
            .unwrap_or(0)
            + 1;
        let output_preview: String = html.chars().take(5000).collect();
        let record = ExecutionStep {
            step_name: "HTML Generation".to_string(),
            step_order: next_order,
            step_type: ExecutionStepKind::HtmlGeneration,
            model: Some(model),
            input: json!({
                "template_id": template.template_id,
                "template_style": template.style_description,
            }),
            output: json!(output_preview),
            image_urls: Vec::new(),
            usage_info: Some(usage),
            timestamp: started,
            duration_ms: Some((Utc::now() - started).num_milliseconds().max(0) as u64),
            artifact_id: None,
            error: None,
            success: None,
        };
        self.executor.write_execution_step(&ctx.job.job_id, record).await?;

        Ok(html)
    }

    async fn append_final_output_step(
        &self,
        job_id: &str,
        artifact_id: &str,
        public_url: &str,
        kind: ArtifactKind,
        filename: &str,
    ) -> Result<()> {
        let job = self
            .services
            .records
            .get_job(job_id)
            .await?
            .ok_or_else(|| WorkerError::validation(format!("Job {job_id} not found")))?;
        let next_order = job
            .execution_steps
            .iter()
            .map(|s| s.step_order)
            .max()
            .unwrap_or(0)
            + 1;
        let record = ExecutionStep {
            step_name: "Final Output".to_string(),
            step_order: next_order,
            step_type: ExecutionStepKind::FinalOutput,
            model: None,
            input: json!({ "artifact_type": kind, "filename": filename }),
            output: json!({ "artifact_id": artifact_id, "public_url": public_url }),
            image_urls: Vec::new(),
            usage_info: None,
            timestamp: Utc::now(),
            duration_ms: Some(0),
            artifact_id: Some(artifact_id.to_string()),
            error: None,
            success: None,
        };
        self.executor.write_execution_step(job_id, record).await
    }

    async fn run_delivery(&self, ctx: &JobContext, output_url: &str, successful: &[&StepOutcome]) {
        match ctx.workflow.delivery_method {
            leadforge_core::records::DeliveryMethod::Webhook => {
                let Some(url) = &ctx.workflow.delivery_webhook_url else {
                    warn!(job_id = %ctx.job.job_id, "Webhook delivery enabled but no webhook URL configured");
                    return;
                };
                if let Err(e) = self
                    .delivery
                    .send_webhook(
                        url,
                        &ctx.workflow.delivery_webhook_headers,
                        &ctx.job,
                        output_url,
                        &ctx.submission,
                    )
                    .await
                {
                    error!(job_id = %ctx.job.job_id, error = %e, "Failed to send webhook notification");
                }
            }
            leadforge_core::records::DeliveryMethod::Sms => {
                let research = successful.first().map(|o| o.output.as_str());
                if let Err(e) = self
                    .delivery
                    .send_sms(&ctx.workflow, &ctx.job, output_url, &ctx.submission, research)
                    .await
                {
                    error!(job_id = %ctx.job.job_id, error = %e, "Failed to send SMS notification");
                }
            }
            leadforge_core::records::DeliveryMethod::None => {
                info!(job_id = %ctx.job.job_id, "No delivery method configured, skipping delivery");
            }
        }
    }

    async fn notify_completion(&self, ctx: &JobContext) {
        let workflow_name = ctx
            .workflow
            .workflow_name
            .clone()
            .unwrap_or_else(|| "Lead magnet".to_string());
        let submitter = ctx
            .submission
            .submitter_email
            .clone()
            .unwrap_or_else(|| "customer".to_string());
        let notification = Notification {
            notification_id: format!("notif_{}", Uuid::now_v7()),
            tenant_id: ctx.job.tenant_id.clone(),
            notification_type: "job_completed".to_string(),
            title: "Lead magnet delivered".to_string(),
            message: format!("Your lead magnet \"{workflow_name}\" has been delivered for {submitter}."),
            related_resource_id: Some(ctx.job.job_id.clone()),
            related_resource_type: Some("job".to_string()),
            created_at: Utc::now(),
        };
        if let Err(e) = self.services.records.put_notification(&notification).await {
            error!(job_id = %ctx.job.job_id, error = %e, "Error creating completion notification");
        }
    }

    async fn mark_failed(&self, job_id: &str, error: &WorkerError) {
        let patch = json!({
            "status": "failed",
            "error_type": error.kind(),
            "error_message": error.to_string(),
        });
        if let Err(update_error) = self.services.records.update_job(job_id, patch).await {
            error!(job_id = %job_id, error = %update_error, "Failed to update job status");
        }
    }
}

/// Wrap an error message with the action that was attempted, preserving the
/// classification.
fn prefix_error(error: WorkerError, action: &str) -> WorkerError {
    let message = format!("{action}: {error}");
    match error {
        WorkerError::Validation(_) => WorkerError::Validation(message),
        WorkerError::Authentication(_) => WorkerError::Authentication(message),
        WorkerError::RateLimit(_) => WorkerError::RateLimit(message),
        WorkerError::ToolChoiceConfig(_) => WorkerError::ToolChoiceConfig(message),
        WorkerError::ModelNotFound(_) => WorkerError::ModelNotFound(message),
        WorkerError::Timeout(_) => WorkerError::Timeout(message),
        WorkerError::Connection(_) => WorkerError::Connection(message),
        WorkerError::ImagePipeline(_) => WorkerError::ImagePipeline(message),
        WorkerError::ShellBudget(_) => WorkerError::ShellBudget(message),
        WorkerError::ComputerLoop(_) => WorkerError::ComputerLoop(message),
        WorkerError::Storage(_) => WorkerError::Storage(message),
        WorkerError::Unknown(_) => WorkerError::Unknown(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_preserves_classification() {
        let prefixed = prefix_error(
            WorkerError::RateLimit("429".into()),
            "Failed to process step 3",
        );
        assert_eq!(prefixed.kind(), "rate_limit");
        assert!(prefixed.to_string().contains("Failed to process step 3"));
    }
}
