// Image-generation strategy
//
// Active when the step carries an image_generation tool whose model is in
// the gpt-image family. Bypasses the Responses API entirely and calls the
// dedicated Images API; resulting assets are stored as image artifacts.

use serde_json::{json, Value};
use tracing::info;

use leadforge_core::records::coerce_u64;
use leadforge_core::cost::calculate_cost;
use leadforge_core::records::UsageInfo;
use leadforge_core::tools::tool_type;
use leadforge_core::{Result, WorkerError};
use leadforge_openai::images_api::ImageGenerationRequest;

use crate::dispatch::image_tool_model;

use super::{finalize_images, StepRunContext, StrategyOutcome, WorkerServices};

pub async fn run(services: &WorkerServices, ctx: &StepRunContext) -> Result<StrategyOutcome> {
    let images_api = services.images_api.as_ref().ok_or_else(|| {
        WorkerError::validation("Image generation requested but the Images API is not configured")
    })?;

    let image_tool = ctx
        .tools
        .iter()
        .find(|t| tool_type(t) == Some("image_generation"))
        .cloned()
        .unwrap_or_else(|| json!({"type": "image_generation"}));
    let image_model = image_tool_model(&ctx.tools);

    let input_text = ctx.input_text();
    let prompt = if input_text.is_empty() {
        ctx.instructions.clone()
    } else {
        format!("{}\n\n{input_text}", ctx.instructions)
    };

    let get = |key: &str| image_tool.get(key).and_then(Value::as_str).map(str::to_string);
    let request = ImageGenerationRequest {
        model: image_model.clone(),
        prompt: prompt.clone(),
        size: get("size"),
        quality: get("quality"),
        background: get("background"),
        n: image_tool.get("n").and_then(coerce_u64).unwrap_or(1) as u32,
    };

    info!(
        job_id = %ctx.job_id,
        step_index = ctx.step_index,
        image_model = %image_model,
        "Running image generation strategy"
    );

    let (sources, usage_counts) = images_api.generate(&request).await?;
    let cost = calculate_cost(&image_model, usage_counts.input_tokens, usage_counts.output_tokens);
    let usage = UsageInfo {
        model: Some(image_model.clone()),
        input_tokens: usage_counts.input_tokens,
        output_tokens: usage_counts.output_tokens,
        total_tokens: usage_counts.total_tokens,
        cost_usd: cost.cost_usd,
        service_type: Some("openai_image_generation".to_string()),
    };

    let (_, image_urls, image_artifact_ids) =
        finalize_images(services, ctx, String::new(), &sources).await;

    if image_urls.is_empty() {
        return Err(WorkerError::ImagePipeline(
            "Image generation returned no assets".to_string(),
        ));
    }

    let text = format!(
        "Generated {} image(s):\n{}",
        image_urls.len(),
        image_urls
            .iter()
            .map(|url| format!("- {url}"))
            .collect::<Vec<_>>()
            .join("\n")
    );

    let request_details = json!({
        "model": ctx.model,
        "image_model": image_model,
        "prompt": prompt,
        "image_tool": image_tool,
    });
    let response_details = json!({
        "output_text": text,
        "image_urls": image_urls,
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens,
        },
        "model": image_model,
    });

    Ok(StrategyOutcome {
        text,
        image_urls,
        image_artifact_ids,
        usages: vec![usage],
        request_details,
        response_details,
    })
}
