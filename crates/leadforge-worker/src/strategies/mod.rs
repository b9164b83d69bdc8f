// Interaction strategies
//
// One strategy runs per step, selected by the dispatcher. All of them share
// the same outcome shape: final text, image URLs/artifacts, per-call usage,
// and audit details for the execution step record.

pub mod computer_use;
pub mod image_generation;
pub mod shell_loop;
pub mod standard;

use std::sync::Arc;

use serde_json::Value;

use leadforge_core::config::WorkerConfig;
use leadforge_core::records::{ShellSettings, UsageInfo};
use leadforge_core::Result;
use leadforge_openai::images_api::ImagesClient;
use leadforge_openai::types::ImageSource;
use leadforge_openai::ResponsesApi;
use leadforge_storage::{RecordStore, SecretProvider};

use crate::artifacts::ArtifactService;
use crate::browser::BrowserEnvironment;
use crate::dispatch::{self, Strategy};
use crate::images::{rescue_base64_assets, ImagePipeline};
use crate::shell::ShellExecutor;

/// Shared service handles threaded through the worker
pub struct WorkerServices {
    pub api: Arc<dyn ResponsesApi>,
    pub images_api: Option<ImagesClient>,
    pub records: Arc<dyn RecordStore>,
    pub artifacts: Arc<ArtifactService>,
    pub pipeline: Arc<ImagePipeline>,
    pub secrets: Option<Arc<dyn SecretProvider>>,
    pub shell: Option<Arc<dyn ShellExecutor>>,
    pub browser: Option<Arc<dyn BrowserEnvironment>>,
    pub config: WorkerConfig,
}

/// Everything one step execution needs, assembled by the step executor
#[derive(Debug, Clone)]
pub struct StepRunContext {
    pub tenant_id: String,
    pub job_id: String,
    pub step_index: usize,
    pub step_name: String,
    pub model: String,
    pub instructions: String,
    /// Current-step raw context (labeled submission on step 0, plus any
    /// injected upload block)
    pub context: String,
    /// Fenced previous-step context
    pub previous_context: String,
    /// Validated tools and normalized tool_choice
    pub tools: Vec<Value>,
    pub tool_choice: String,
    pub reasoning_effort: Option<String>,
    pub service_tier: Option<String>,
    pub text_verbosity: Option<String>,
    pub max_output_tokens: Option<i64>,
    pub output_format: Option<Value>,
    /// Prepared (cleaned/deduped/rescued) image URLs from earlier steps
    pub previous_image_urls: Vec<String>,
    pub shell_settings: Option<ShellSettings>,
}

impl StepRunContext {
    /// 1-based order of this step
    pub fn step_order(&self) -> u32 {
        (self.step_index + 1) as u32
    }

    /// Combined provider input: previous context + current context
    pub fn input_text(&self) -> String {
        leadforge_core::context::build_input_text(&self.context, &self.previous_context)
    }
}

/// What a strategy hands back to the step executor
#[derive(Debug, Clone, Default)]
pub struct StrategyOutcome {
    pub text: String,
    pub image_urls: Vec<String>,
    pub image_artifact_ids: Vec<String>,
    /// One entry per provider call made while executing the step
    pub usages: Vec<UsageInfo>,
    pub request_details: Value,
    pub response_details: Value,
}

impl StrategyOutcome {
    /// Aggregate usage across every call the strategy made
    pub fn total_usage(&self) -> UsageInfo {
        let mut total = UsageInfo::default();
        for usage in &self.usages {
            total.input_tokens += usage.input_tokens;
            total.output_tokens += usage.output_tokens;
            total.total_tokens += usage.total_tokens;
            total.cost_usd += usage.cost_usd;
            if total.model.is_none() {
                total.model = usage.model.clone();
            }
            if total.service_type.is_none() {
                total.service_type = usage.service_type.clone();
            }
        }
        total
    }
}

/// Run the strategy selected for this step
pub async fn run(services: &WorkerServices, ctx: &StepRunContext) -> Result<StrategyOutcome> {
    match dispatch::select(&ctx.model, &ctx.tools) {
        Strategy::ImageGeneration => image_generation::run(services, ctx).await,
        Strategy::ComputerUse => computer_use::run(services, ctx).await,
        Strategy::Shell => shell_loop::run(services, ctx).await,
        Strategy::Standard => standard::run(services, ctx).await,
    }
}

/// Post-process a strategy's text and image sources: rescue base64 assets
/// embedded in JSON output, persist every generated image as an artifact,
/// and return the final (text, urls, artifact ids).
pub(crate) async fn finalize_images(
    services: &WorkerServices,
    ctx: &StepRunContext,
    text: String,
    sources: &[ImageSource],
) -> (String, Vec<String>, Vec<String>) {
    let blobs = services.artifacts.blobs().clone();
    let (text, rescued_urls) = rescue_base64_assets(
        services.pipeline.as_ref(),
        blobs.as_ref(),
        &text,
        &ctx.tenant_id,
        &ctx.job_id,
    )
    .await;

    let mut urls = Vec::new();
    let mut artifact_ids = Vec::new();

    for source in sources {
        match source {
            ImageSource::Url(url) => {
                urls.push(url.clone());
                match services.pipeline.download(url).await {
                    Ok((bytes, mime)) => {
                        match services
                            .artifacts
                            .store_image_bytes(&ctx.tenant_id, &ctx.job_id, bytes, &mime)
                            .await
                        {
                            Ok(stored) => artifact_ids.push(stored.artifact_id),
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to store image artifact")
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to download generated image for artifact storage")
                    }
                }
            }
            ImageSource::Base64 { data, mime_type } => {
                use base64::Engine;
                match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
                    Ok(bytes) => {
                        match services
                            .artifacts
                            .store_image_bytes(&ctx.tenant_id, &ctx.job_id, bytes, mime_type)
                            .await
                        {
                            Ok(stored) => {
                                urls.push(stored.public_url);
                                artifact_ids.push(stored.artifact_id);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to store base64 image artifact")
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Generated image had invalid base64 data"),
                }
            }
        }
    }

    urls.extend(rescued_urls);
    (text, urls, artifact_ids)
}
