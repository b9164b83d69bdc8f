// Request parameter builder for the Responses API
//
// Pure function from step configuration to a ResponseRequest. Image URLs
// arrive already cleaned, deduplicated, and rescued by the image pipeline;
// this builder only decides whether the request goes out multimodal.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use leadforge_core::models::{
    default_reasoning_effort, default_service_tier, supports_image_inputs, supports_reasoning,
};
use leadforge_core::tools::{self, clean_tools, has_image_generation, is_deep_research_model};

use crate::types::ResponseRequest;

/// Global guardrail: workflows run autonomously with no user interaction
/// between steps.
pub const NO_CONFIRMATION_PREFIX: &str = "IMPORTANT: This workflow runs end-to-end with NO user interaction between steps. \
Do NOT ask the user for confirmation or additional input. \
Do NOT pause waiting for responses. \
If information is missing or ambiguous, make reasonable assumptions and proceed.\n\n";

const JSON_FORMAT_NUDGE: &str = "\n\nPlease output your response in JSON format.";

#[derive(Debug, Default)]
pub struct BuildParamsArgs<'a> {
    pub model: &'a str,
    pub instructions: &'a str,
    pub input_text: &'a str,
    pub tools: &'a [Value],
    pub tool_choice: &'a str,
    pub has_computer_use: bool,
    pub reasoning_effort: Option<&'a str>,
    pub service_tier: Option<&'a str>,
    pub text_verbosity: Option<&'a str>,
    pub max_output_tokens: Option<i64>,
    pub output_format: Option<&'a Value>,
    /// Final image URLs (http or data:) from earlier steps
    pub previous_image_urls: &'a [String],
    /// Enforced code_interpreter memory limit from the environment
    pub code_interpreter_memory_limit: Option<&'a str>,
}

/// Build the Responses API request for a step.
pub fn build_params(args: BuildParamsArgs<'_>) -> ResponseRequest {
    let instructions = apply_autonomy_preamble(args.instructions);

    // Multimodal input iff the image tool is active, prior images exist, and
    // the model accepts image inputs.
    let image_tool_active = has_image_generation(args.tools);
    let model_accepts_images = supports_image_inputs(args.model);
    let input = if image_tool_active && !args.previous_image_urls.is_empty() && model_accepts_images
    {
        build_multimodal_input(args.input_text, args.previous_image_urls)
    } else {
        if image_tool_active && !args.previous_image_urls.is_empty() {
            debug!(model = %args.model, "Model does not support image inputs; excluding images from input");
        }
        json!(args.input_text)
    };

    let mut tools: Vec<Value> = args.tools.to_vec();

    // Deep research models require at least one search-capable tool
    if is_deep_research_model(args.model) && !has_deep_research_tool(&tools) {
        info!(model = %args.model, "Deep research model requires a search tool; adding web_search_preview");
        tools.push(json!({"type": "web_search_preview"}));
    }

    // The provider rejects code_interpreter alongside computer_use_preview
    if args.has_computer_use {
        tools.retain(|t| {
            let keep = tools::tool_type(t) != Some("code_interpreter");
            if !keep {
                debug!("Filtering out code_interpreter - incompatible with computer_use_preview");
            }
            keep
        });
    }

    let mut include = Vec::new();
    if tools.iter().any(|t| tools::tool_type(t) == Some("code_interpreter")) {
        // Surface stdout/stderr/logs in streamed events
        include.push("code_interpreter_call.outputs".to_string());
    }

    let cleaned_tools = clean_tools(&tools, args.code_interpreter_memory_limit);

    let tool_choice = if !cleaned_tools.is_empty() {
        match args.tool_choice {
            "none" => None,
            other => Some(other.to_string()),
        }
    } else {
        if args.tool_choice == "required" {
            // Never send 'required' without tools: the provider 400s
            warn!(
                model = %args.model,
                "All tools were filtered out but tool_choice was 'required'; omitting tool_choice"
            );
        }
        None
    };

    let mut request = ResponseRequest {
        model: args.model.to_string(),
        instructions: Some(instructions),
        input,
        tools: cleaned_tools,
        tool_choice,
        include,
        ..Default::default()
    };

    apply_reasoning(&mut request, args.model, args.reasoning_effort);
    apply_service_tier(&mut request, args.model, args.service_tier);
    apply_text_config(&mut request, args.text_verbosity, args.output_format);
    apply_max_output_tokens(&mut request, args.max_output_tokens);

    request
}

fn apply_autonomy_preamble(instructions: &str) -> String {
    let lower = instructions.to_lowercase();
    let already_present = lower.contains("ask for confirmation")
        || lower.contains("no user interaction")
        || lower.contains("no user input")
        || lower.contains("no human-in-the-loop");
    if already_present {
        instructions.to_string()
    } else {
        format!("{NO_CONFIRMATION_PREFIX}{instructions}")
    }
}

fn has_deep_research_tool(tools: &[Value]) -> bool {
    tools.iter().any(|t| {
        matches!(
            tools::tool_type(t),
            Some("web_search_preview") | Some("mcp") | Some("file_search")
        )
    })
}

fn build_multimodal_input(input_text: &str, image_urls: &[String]) -> Value {
    let mut content = vec![json!({"type": "input_text", "text": input_text})];
    for url in image_urls {
        if url.is_empty() {
            continue;
        }
        content.push(json!({"type": "input_image", "image_url": url}));
    }
    json!([{ "role": "user", "content": content }])
}

fn apply_reasoning(request: &mut ResponseRequest, model: &str, effort: Option<&str>) {
    let effort = effort
        .map(str::to_string)
        .or_else(|| default_reasoning_effort(model).map(str::to_string));
    if let Some(effort) = effort {
        if supports_reasoning(model) {
            request.reasoning = Some(json!({"effort": effort}));
        } else {
            info!(model = %model, reasoning_effort = %effort, "Skipping reasoning effort for unsupported model");
        }
    }
}

fn apply_service_tier(request: &mut ResponseRequest, model: &str, tier: Option<&str>) {
    let tier = tier
        .map(str::to_string)
        .or_else(|| default_service_tier(model).map(str::to_string));
    request.service_tier = tier;
}

fn apply_text_config(
    request: &mut ResponseRequest,
    verbosity: Option<&str>,
    output_format: Option<&Value>,
) {
    let mut text = serde_json::Map::new();
    if let Some(verbosity) = verbosity {
        text.insert("verbosity".into(), json!(verbosity));
    }

    if let Some(format) = output_format {
        match format.get("type").and_then(Value::as_str) {
            Some(ty @ ("text" | "json_object")) => {
                text.insert("format".into(), json!({"type": ty}));
                if ty == "json_object" {
                    ensure_json_mentioned(request);
                }
            }
            Some("json_schema") => {
                let name = format.get("name").and_then(Value::as_str);
                let schema = format.get("schema").filter(|s| s.is_object());
                if let (Some(name), Some(schema)) = (name, schema) {
                    let mut fmt = serde_json::Map::new();
                    fmt.insert("type".into(), json!("json_schema"));
                    fmt.insert("name".into(), json!(name));
                    fmt.insert("schema".into(), schema.clone());
                    if let Some(description) = format.get("description").and_then(Value::as_str) {
                        fmt.insert("description".into(), json!(description));
                    }
                    if let Some(strict) = format.get("strict").and_then(Value::as_bool) {
                        fmt.insert("strict".into(), json!(strict));
                    }
                    text.insert("format".into(), Value::Object(fmt));
                }
            }
            _ => {}
        }
    }

    if !text.is_empty() {
        request.text = Some(Value::Object(text));
    }
}

/// The provider requires the word "json" somewhere in the input messages when
/// json_object output is requested; append a nudge when it is missing.
fn ensure_json_mentioned(request: &mut ResponseRequest) {
    match &mut request.input {
        Value::String(text) => {
            if !text.to_lowercase().contains("json") {
                text.push_str(JSON_FORMAT_NUDGE);
            }
        }
        Value::Array(messages) => {
            let mentioned = messages.iter().any(|message| {
                message
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|content| {
                        content.iter().any(|item| {
                            item.get("type").and_then(Value::as_str) == Some("input_text")
                                && item
                                    .get("text")
                                    .and_then(Value::as_str)
                                    .map(|t| t.to_lowercase().contains("json"))
                                    .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            });
            if mentioned {
                return;
            }
            // Append to the first text item; insert one when none exists
            for message in messages.iter_mut() {
                let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) else {
                    continue;
                };
                for item in content.iter_mut() {
                    if item.get("type").and_then(Value::as_str) == Some("input_text") {
                        if let Some(Value::String(text)) = item.get_mut("text") {
                            text.push_str(JSON_FORMAT_NUDGE);
                            return;
                        }
                    }
                }
                content.insert(
                    0,
                    json!({"type": "input_text", "text": JSON_FORMAT_NUDGE.trim_start()}),
                );
                return;
            }
        }
        _ => {}
    }
}

/// Coerce to a positive integer or drop the parameter rather than fail the
/// request (the record store hands back decimal-boxed numbers).
fn apply_max_output_tokens(request: &mut ResponseRequest, max_output_tokens: Option<i64>) {
    match max_output_tokens {
        Some(n) if n > 0 => request.max_output_tokens = Some(n as u32),
        Some(n) => {
            warn!(max_output_tokens = n, "Invalid max_output_tokens; omitting to avoid API error");
        }
        None => {}
    }
}
