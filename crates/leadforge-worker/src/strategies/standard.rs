// Standard strategy
//
// One streamed Responses API call, with deltas mirrored into the live-step
// preview. A truncated stream (no response.completed) or a transient
// transport failure retries once with backoff and then falls back to a
// non-streaming call; whatever text arrived is still persisted to the
// preview with status error before the fallback result replaces it.

use futures::StreamExt;
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use leadforge_core::records::LiveStepStatus;
use leadforge_core::tools::has_computer_use;
use leadforge_core::{Result, WorkerError};
use leadforge_openai::params::{build_params, BuildParamsArgs};
use leadforge_openai::process::{process_response, ProcessContext};
use leadforge_openai::stream::{incomplete_stream_error, is_incomplete_stream_error, FlushBuffer};
use leadforge_openai::types::Response;
use leadforge_openai::{ResponsesApi, StreamEvent};

use crate::live::LiveStepWriter;

use super::{finalize_images, StepRunContext, StrategyOutcome, WorkerServices};

const MAX_STREAM_ATTEMPTS: u32 = 2;

pub async fn run(services: &WorkerServices, ctx: &StepRunContext) -> Result<StrategyOutcome> {
    let input_text = ctx.input_text();
    let request = build_params(BuildParamsArgs {
        model: &ctx.model,
        instructions: &ctx.instructions,
        input_text: &input_text,
        tools: &ctx.tools,
        tool_choice: &ctx.tool_choice,
        has_computer_use: has_computer_use(&ctx.tools),
        reasoning_effort: ctx.reasoning_effort.as_deref(),
        service_tier: ctx.service_tier.as_deref(),
        text_verbosity: ctx.text_verbosity.as_deref(),
        max_output_tokens: ctx.max_output_tokens,
        output_format: ctx.output_format.as_ref(),
        previous_image_urls: &ctx.previous_image_urls,
        code_interpreter_memory_limit: services.config.code_interpreter_memory_limit.as_deref(),
    });

    let mut live = LiveStepWriter::new(services.records.clone(), &ctx.job_id, ctx.step_order());
    let response = call_with_stream(services, ctx, &request, &mut live).await?;

    let processed = process_response(
        &response,
        ProcessContext {
            model: &ctx.model,
            instructions: &ctx.instructions,
            input_text: &input_text,
            previous_context: &ctx.previous_context,
            context: &ctx.context,
            tools: &ctx.tools,
            tool_choice: &ctx.tool_choice,
            request: &request,
            service_type: "openai_worker_report",
        },
    );

    let (text, image_urls, image_artifact_ids) =
        finalize_images(services, ctx, processed.text.clone(), &processed.image_sources).await;

    live.finish("").await;

    info!(
        job_id = %ctx.job_id,
        step_index = ctx.step_index,
        output_length = text.len(),
        images_generated = image_urls.len(),
        total_tokens = processed.usage.total_tokens,
        "Standard strategy complete"
    );

    let response_details = processed.response_details(&text, &image_urls);
    Ok(StrategyOutcome {
        text,
        image_urls,
        image_artifact_ids,
        usages: vec![processed.usage],
        request_details: processed.request_details,
        response_details,
    })
}

/// Stream with retry and non-streaming fallback. Returns the final response.
async fn call_with_stream(
    services: &WorkerServices,
    ctx: &StepRunContext,
    request: &leadforge_openai::ResponseRequest,
    live: &mut LiveStepWriter,
) -> Result<Response> {
    for attempt in 1..=MAX_STREAM_ATTEMPTS {
        match stream_once(services, request, live).await {
            Ok(response) => return Ok(response),
            Err(e) if is_retryable_stream_error(&e) => {
                warn!(
                    job_id = %ctx.job_id,
                    attempt,
                    error = %e,
                    "Stream interrupted; retrying"
                );
                live.transition(LiveStepStatus::Retrying).await;
                if attempt < MAX_STREAM_ATTEMPTS {
                    sleep(Duration::from_millis(750 * attempt as u64)).await;
                    continue;
                }
                // Persist what arrived, then fall back to a unary call
                live.error("", e.to_string()).await;
                warn!(job_id = %ctx.job_id, "Stream retries exhausted; falling back to non-streaming call");
                return services.api.call(request).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("stream attempts loop always returns")
}

fn is_retryable_stream_error(error: &WorkerError) -> bool {
    is_incomplete_stream_error(error)
        || matches!(error, WorkerError::Connection(_) | WorkerError::Timeout(_))
}

async fn stream_once(
    services: &WorkerServices,
    request: &leadforge_openai::ResponseRequest,
    live: &mut LiveStepWriter,
) -> Result<Response> {
    let mut stream = services.api.stream(request).await?;
    let mut buffer = FlushBuffer::default();

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta(delta) => {
                if let Some(chunk) = buffer.push(&delta) {
                    live.append(&chunk).await;
                }
            }
            StreamEvent::OutputItemAdded(item) => {
                if let Some(label) = tool_label(&item) {
                    if let Some(chunk) = buffer.flush() {
                        live.append(&chunk).await;
                    }
                    live.append(&format!("\n[{label}]\n")).await;
                }
            }
            StreamEvent::CodeInterpreterStage(stage) => {
                live.append(&format!("\n[code interpreter: {stage}]\n")).await;
            }
            StreamEvent::Completed(response) => {
                if let Some(chunk) = buffer.flush() {
                    live.append(&chunk).await;
                }
                return Ok(response);
            }
            StreamEvent::Failed(message) => {
                return Err(WorkerError::classify_message(&message));
            }
            StreamEvent::OutputItemDone(_) | StreamEvent::Other(_) => {}
        }
    }

    if let Some(chunk) = buffer.flush() {
        live.append(&chunk).await;
    }
    Err(incomplete_stream_error())
}

/// Preview label for a tool-call lifecycle item
fn tool_label(item: &Value) -> Option<String> {
    let item_type = item.get("type").and_then(Value::as_str)?;
    match item_type {
        "web_search_call" => Some("web search".to_string()),
        "code_interpreter_call" => Some("code interpreter".to_string()),
        "file_search_call" => Some("file search".to_string()),
        "image_generation_call" => Some("image generation".to_string()),
        other if other.ends_with("_call") => {
            Some(other.trim_end_matches("_call").replace('_', " "))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_labels() {
        assert_eq!(tool_label(&json!({"type": "web_search_call"})).unwrap(), "web search");
        assert_eq!(tool_label(&json!({"type": "shell_call"})).unwrap(), "shell");
        assert!(tool_label(&json!({"type": "message"})).is_none());
    }
}
