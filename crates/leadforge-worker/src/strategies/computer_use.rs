// Computer-use loop
//
// The model returns computer_call items describing GUI actions; we execute
// them against the browser sandbox, capture a screenshot, and feed it back
// as a computer_call_output. The clean screenshot goes to the model; an
// annotated copy is stored as an image artifact. Repeated identical actions
// abort the loop (loop_detected) before the budget does.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{error, info, warn};

use leadforge_core::models::supports_image_inputs;
use leadforge_core::records::UsageInfo;
use leadforge_core::tools::{has_shell, tool_type};
use leadforge_core::{Result, WorkerError};
use leadforge_openai::params::{build_params, BuildParamsArgs};
use leadforge_openai::process::{process_response, ProcessContext};
use leadforge_openai::types::Response;
use leadforge_openai::ResponsesApi;

use crate::browser::{post_action_wait_ms, BrowserEnvironment, LoopDetector};
use crate::images::overlay_screenshot;
use crate::live::LiveStepWriter;
use crate::shell::{ShellExecutor, ShellJobRequest};

use super::{StepRunContext, StrategyOutcome, WorkerServices};

const MAX_ITERATIONS: u32 = 100;
const MAX_DURATION: Duration = Duration::from_secs(15 * 60);
const DEFAULT_START_URL: &str = "https://www.bing.com";

/// Steering added when both the computer tool and the shell tool are
/// available: discoverable facts (DNS, HTTP) belong in the shell; the
/// computer tool should navigate with full URLs.
const TOOL_ORDER_HINT: &str = "TOOL ORDER: If a subtask can be solved via command-line/network inspection \
(e.g. ping, dig, nslookup, whois, curl), prefer starting with \
`execute_shell_command` to gather facts first, then use `computer_use_preview` \
to browse/verify visually.\n\
WEB NAVIGATION: When you need to open a new website, use a computer action of type \
`navigate` with a full URL (e.g. https://example.com). This is more reliable than \
clicking the address bar/search box. Avoid repeating clicks if the page doesn't change.\n\
IMPORTANT: When you need to run shell/terminal commands, call \
`execute_shell_command` to run commands directly on the backend server. \
Do NOT try to open or click a terminal inside the browser UI.";

pub async fn run(services: &WorkerServices, ctx: &StepRunContext) -> Result<StrategyOutcome> {
    let env = services.browser.clone().ok_or_else(|| {
        WorkerError::validation("Computer use requested but no browser sandbox is configured")
    })?;

    let result = run_loop(services, ctx, env.as_ref()).await;
    if let Err(e) = env.cleanup().await {
        warn!(error = %e, "Browser cleanup failed");
    }
    result
}

async fn run_loop(
    services: &WorkerServices,
    ctx: &StepRunContext,
    env: &dyn BrowserEnvironment,
) -> Result<StrategyOutcome> {
    let instructions = effective_instructions(ctx);
    let mut live = LiveStepWriter::new(services.records.clone(), &ctx.job_id, ctx.step_order());
    let mut detector = LoopDetector::default();
    let mut usages: Vec<UsageInfo> = Vec::new();
    let mut screenshot_urls: Vec<String> = Vec::new();
    let mut screenshot_artifact_ids: Vec<String> = Vec::new();

    // 1. Environment
    let (width, height) = display_size(&ctx.tools);
    env.initialize(width, height).await?;
    live.append("Environment ready.\n").await;

    // 2. Initial navigation: a URL (or host-like token) in the task wins
    let input_text = ctx.input_text();
    let task_text = format!("{}\n{}", ctx.instructions, input_text);
    let target_url = detect_url(&task_text).unwrap_or_else(|| DEFAULT_START_URL.to_string());
    live.append(&format!("Navigate to: {target_url}\n")).await;
    let nav_error = match env.execute(&json!({"type": "navigate", "url": target_url})).await {
        Ok(()) => None,
        Err(e) => {
            warn!(url = %target_url, error = %e, "Initial navigation failed");
            live.append(&format!("Navigation failed: {e}\n")).await;
            Some(e.to_string())
        }
    };

    // Capture even after a failed navigation: the error page is informative
    let initial_screenshot = match env.capture_screenshot().await {
        Ok(b64) => {
            let current_url = env.current_url().await.unwrap_or_default();
            if let Some((url, artifact_id)) =
                store_screenshot(services, ctx, &b64, &json!({"type": "navigate"})).await
            {
                screenshot_urls.push(url);
                screenshot_artifact_ids.push(artifact_id);
            }
            Some((b64, current_url))
        }
        Err(e) => {
            error!(error = %e, "Initial screenshot failed");
            None
        }
    };

    // 3. Initial request
    let mut request = build_params(BuildParamsArgs {
        model: &ctx.model,
        instructions: &instructions,
        input_text: &input_text,
        tools: &ctx.tools,
        tool_choice: &ctx.tool_choice,
        has_computer_use: true,
        reasoning_effort: ctx.reasoning_effort.as_deref(),
        service_tier: ctx.service_tier.as_deref(),
        text_verbosity: ctx.text_verbosity.as_deref(),
        max_output_tokens: ctx.max_output_tokens,
        output_format: ctx.output_format.as_ref(),
        previous_image_urls: &[],
        code_interpreter_memory_limit: services.config.code_interpreter_memory_limit.as_deref(),
    });
    request.truncation = Some("auto".to_string());

    if let Some((screenshot_b64, current_url)) = &initial_screenshot {
        let mut user_text = if input_text.trim().is_empty() {
            "Start the task.".to_string()
        } else {
            input_text.clone()
        };
        if !current_url.is_empty() {
            user_text.push_str(&format!("\n\n(Current URL: {current_url})"));
        }
        if let Some(nav_error) = &nav_error {
            user_text.push_str(&format!(
                "\n\nWARNING: Initial navigation to {target_url} failed with error: {nav_error}. \
                 Please check the URL or try a different one."
            ));
        }
        // The computer-use-preview family rejects image inputs: initial
        // prompt stays text-only for them.
        request.input = if supports_image_inputs(&ctx.model) {
            json!([{"role": "user", "content": [
                {"type": "input_text", "text": user_text},
                {"type": "input_image", "image_url": format!("data:image/jpeg;base64,{screenshot_b64}")}
            ]}])
        } else {
            json!([{"role": "user", "content": [{"type": "input_text", "text": user_text}]}])
        };
    }

    live.append("Sending initial request to model...\n").await;
    let mut response = services.api.call(&request).await?;
    usages.push(usage_of(&response, &ctx.model));
    let mut previous_response_id = response.id.clone();
    let request_for_audit = request.clone();

    let started = Instant::now();
    let mut iteration: u32 = 0;

    loop {
        if started.elapsed() > MAX_DURATION {
            live.error("\nMax duration reached.\n", "Computer-use loop timed out").await;
            return Err(WorkerError::ComputerLoop(format!(
                "Computer-use loop exceeded {}s wall-clock budget",
                MAX_DURATION.as_secs()
            )));
        }
        iteration += 1;
        if iteration > MAX_ITERATIONS {
            live.error("\nIteration budget exhausted.\n", "Computer-use loop iteration budget exhausted")
                .await;
            return Err(WorkerError::ComputerLoop(format!(
                "Computer-use loop exceeded {MAX_ITERATIONS} iterations"
            )));
        }

        for reasoning in response.reasoning_texts() {
            live.append(&format!("[reasoning] {reasoning}\n")).await;
        }

        let computer_calls = response.computer_calls();
        let shell_calls = response.shell_calls();
        let generic_calls = response.generic_tool_calls();

        if computer_calls.is_empty() && shell_calls.is_empty() && generic_calls.is_empty() {
            let final_text = response.text();
            live.finish(&format!("\nTask completed: {final_text}\n")).await;
            info!(
                job_id = %ctx.job_id,
                iterations = iteration,
                screenshots = screenshot_urls.len(),
                "Computer-use loop complete"
            );
            return Ok(finish(
                ctx,
                &response,
                &request_for_audit,
                usages,
                screenshot_urls,
                screenshot_artifact_ids,
            ));
        }

        let mut next_input: Vec<Value> = Vec::new();

        // --- Computer action (one per turn) ---
        if let Some(call) = computer_calls.first() {
            let action = &call.action;
            let action_type = action.get("type").and_then(Value::as_str).unwrap_or("unknown");

            // Auto-acknowledge pending safety checks; every ack is logged
            let acknowledged: Vec<Value> = call
                .pending_safety_checks
                .iter()
                .map(|check| {
                    warn!(job_id = %ctx.job_id, check = %check, "Auto-acknowledging safety check");
                    check.clone()
                })
                .collect();
            if !acknowledged.is_empty() {
                live.append("Auto-acknowledging safety checks...\n").await;
            }

            live.append(&format!("{}\n", describe_action(action))).await;

            let action_error = match env.execute(action).await {
                Ok(()) => {
                    if detector.record(action) {
                        warn!(
                            job_id = %ctx.job_id,
                            action_type = %action_type,
                            "Detected repetitive action loop"
                        );
                        live.error(
                            &format!("\nDetected repetitive action loop ({action_type}). Stopping.\n"),
                            "loop_detected",
                        )
                        .await;
                        return Err(WorkerError::ComputerLoop("loop_detected".to_string()));
                    }
                    sleep(Duration::from_millis(post_action_wait_ms(action_type))).await;
                    None
                }
                Err(e) => {
                    live.append(&format!("Action failed: {action_type} - {e}\n")).await;
                    sleep(Duration::from_millis(500)).await;
                    Some(e.to_string())
                }
            };

            match env.capture_screenshot().await {
                Ok(screenshot_b64) => {
                    let current_url = env.current_url().await.unwrap_or_default();
                    if let Some((url, artifact_id)) =
                        store_screenshot(services, ctx, &screenshot_b64, action).await
                    {
                        screenshot_urls.push(url);
                        screenshot_artifact_ids.push(artifact_id);
                    }

                    let mut output_item = json!({
                        "type": "computer_call_output",
                        "call_id": call.call_id,
                        "output": {
                            "type": "computer_screenshot",
                            "image_url": format!("data:image/jpeg;base64,{screenshot_b64}")
                        }
                    });
                    if !acknowledged.is_empty() {
                        output_item["acknowledged_safety_checks"] = json!(acknowledged);
                    }
                    next_input.push(output_item);

                    let mut notes = Vec::new();
                    if let Some(action_error) = &action_error {
                        notes.push(format!("Computer action failed: {action_error}"));
                    }
                    if !current_url.is_empty() {
                        notes.push(format!("Current URL: {current_url}"));
                    }
                    if !notes.is_empty() {
                        next_input.push(json!({
                            "type": "message",
                            "role": "system",
                            "content": [{"type": "input_text", "text": notes.join("\n")}]
                        }));
                    }
                }
                Err(e) => {
                    error!(error = %e, "Screenshot failed");
                    live.append(&format!("Screenshot failed: {e}\n")).await;
                }
            }
        }

        // --- Shell calls alongside the computer tool ---
        for call in &shell_calls {
            next_input.push(execute_shell_call(services, ctx, call, &mut live).await);
        }

        // --- Generic tool calls get simulated outputs so the model moves on ---
        for call in &generic_calls {
            warn!(tool_name = %call.tool_name, call_id = %call.call_id, "Generic tool call in computer-use loop");
            let output = if call.tool_name == "web_search" {
                "Web search is not connected in this environment. Use shell commands or the computer tool instead."
            } else {
                "Tool executed successfully (simulated)."
            };
            next_input.push(json!({
                "type": if call.item_type == "function_call" { "function_call_output" } else { "tool_call_output" },
                "call_id": call.call_id,
                "output": output,
            }));
        }

        if next_input.is_empty() {
            // No executable output and no final text: stop rather than spin
            live.finish("\nModel returned no actions or text.\n").await;
            return Ok(finish(
                ctx,
                &response,
                &request_for_audit,
                usages,
                screenshot_urls,
                screenshot_artifact_ids,
            ));
        }

        let mut next = build_params(BuildParamsArgs {
            model: &ctx.model,
            instructions: &instructions,
            input_text: "",
            tools: &ctx.tools,
            tool_choice: &ctx.tool_choice,
            has_computer_use: true,
            reasoning_effort: ctx.reasoning_effort.as_deref(),
            service_tier: ctx.service_tier.as_deref(),
            text_verbosity: ctx.text_verbosity.as_deref(),
            max_output_tokens: ctx.max_output_tokens,
            output_format: ctx.output_format.as_ref(),
            previous_image_urls: &[],
            code_interpreter_memory_limit: services.config.code_interpreter_memory_limit.as_deref(),
        });
        next.truncation = Some("auto".to_string());
        next.previous_response_id = previous_response_id.clone();
        next.input = Value::Array(next_input);

        live.append("Sending feedback to model...\n").await;
        response = services.api.call(&next).await?;
        usages.push(usage_of(&response, &ctx.model));
        previous_response_id = response.id.clone().or(previous_response_id);
    }
}

fn finish(
    ctx: &StepRunContext,
    response: &Response,
    request: &leadforge_openai::ResponseRequest,
    usages: Vec<UsageInfo>,
    screenshot_urls: Vec<String>,
    screenshot_artifact_ids: Vec<String>,
) -> StrategyOutcome {
    let input_text = ctx.input_text();
    let processed = process_response(
        response,
        ProcessContext {
            model: &ctx.model,
            instructions: &ctx.instructions,
            input_text: &input_text,
            previous_context: &ctx.previous_context,
            context: &ctx.context,
            tools: &ctx.tools,
            tool_choice: &ctx.tool_choice,
            request,
            service_type: "openai_worker_report",
        },
    );
    let response_details = processed.response_details(&processed.text, &screenshot_urls);
    StrategyOutcome {
        text: processed.text,
        image_urls: screenshot_urls,
        image_artifact_ids: screenshot_artifact_ids,
        usages,
        request_details: processed.request_details,
        response_details,
    }
}

/// Upload the annotated screenshot as an image artifact. The clean variant
/// is what the model sees; only the annotated copy is stored.
async fn store_screenshot(
    services: &WorkerServices,
    ctx: &StepRunContext,
    clean_b64: &str,
    action: &Value,
) -> Option<(String, String)> {
    let annotated = overlay_screenshot(clean_b64, action);
    let bytes = BASE64.decode(annotated.trim()).ok()?;
    match services
        .artifacts
        .store_image_bytes(&ctx.tenant_id, &ctx.job_id, bytes, "image/jpeg")
        .await
    {
        Ok(stored) => Some((stored.public_url, stored.artifact_id)),
        Err(e) => {
            warn!(error = %e, "Failed to store screenshot artifact");
            None
        }
    }
}

async fn execute_shell_call(
    services: &WorkerServices,
    ctx: &StepRunContext,
    call: &leadforge_openai::types::ShellCall,
    live: &mut LiveStepWriter,
) -> Value {
    for command in &call.commands {
        live.append(&format!("$ {command}\n")).await;
    }

    let error_item = |message: String| {
        if call.item_type == "function_call" {
            json!({
                "type": "function_call_output",
                "call_id": call.call_id,
                "output": json!({"error": message, "output": []}).to_string(),
            })
        } else {
            json!({
                "type": "shell_call_output",
                "call_id": call.call_id,
                "output": [{"stdout": "", "stderr": message, "outcome": {"type": "error", "message": message}}],
            })
        }
    };

    let Some(executor) = &services.shell else {
        return error_item("Shell executor not configured".to_string());
    };
    if call.commands.is_empty() {
        return error_item("No commands provided".to_string());
    }

    // Workspace keyed to the job; state persists across calls in the loop
    let request = ShellJobRequest {
        commands: call.commands.clone(),
        timeout_ms: call.timeout_ms.or(Some(120_000)),
        max_output_length: call.max_output_length.or(Some(4096)),
        workspace_id: crate::shell::derive_workspace_id(
            &ctx.tenant_id,
            &ctx.job_id,
            ctx.step_index,
        ),
        reset_workspace: false,
        env: Default::default(),
    };

    match executor.run(&request).await {
        Ok(result) => {
            for output in &result.output {
                if !output.stdout.trim().is_empty() {
                    live.append(&format!("{}\n", output.stdout.trim_end())).await;
                }
                if !output.stderr.trim().is_empty() {
                    live.append(&format!("{}\n", output.stderr.trim_end())).await;
                }
            }
            let output_value = serde_json::to_value(&result.output).unwrap_or_else(|_| json!([]));
            if call.item_type == "function_call" {
                json!({
                    "type": "function_call_output",
                    "call_id": call.call_id,
                    "output": json!({
                        "commands": call.commands,
                        "output": output_value,
                        "max_output_length": result.max_output_length,
                    })
                    .to_string(),
                })
            } else {
                json!({
                    "type": "shell_call_output",
                    "call_id": call.call_id,
                    "max_output_length": result.max_output_length,
                    "output": output_value,
                })
            }
        }
        Err(e) => {
            live.append(&format!("Shell execution error: {e}\n")).await;
            error_item(e.to_string())
        }
    }
}

/// Add the tool-coexistence hint once when shell is also available
fn effective_instructions(ctx: &StepRunContext) -> String {
    if has_shell(&ctx.tools) && !ctx.instructions.contains("TOOL ORDER:") {
        let base = ctx.instructions.trim_end();
        if base.is_empty() {
            TOOL_ORDER_HINT.to_string()
        } else {
            format!("{base}\n\n{TOOL_ORDER_HINT}")
        }
    } else {
        ctx.instructions.clone()
    }
}

fn display_size(tools: &[Value]) -> (u32, u32) {
    for tool in tools {
        if tool_type(tool) == Some("computer_use_preview") {
            let width = tool
                .get("display_width")
                .and_then(leadforge_core::records::coerce_u64)
                .unwrap_or(1024) as u32;
            let height = tool
                .get("display_height")
                .and_then(leadforge_core::records::coerce_u64)
                .unwrap_or(768) as u32;
            return (width, height);
        }
    }
    (1024, 768)
}

/// Find a URL (or a host-like token) in the task text
fn detect_url(text: &str) -> Option<String> {
    if let Some(found) = Regex::new(r#"https?://[^\s<>"')]+"#)
        .ok()?
        .find(text)
    {
        return Some(
            found
                .as_str()
                .trim_end_matches(['.', ',', ';', '!', '?', ')'])
                .to_string(),
        );
    }
    // Host-like token, at least a 2-char TLD
    let domain = Regex::new(r"\b([a-zA-Z0-9][a-zA-Z0-9-]{0,61}(?:\.[a-zA-Z0-9][a-zA-Z0-9-]{0,61})*\.[a-zA-Z]{2,})\b")
        .ok()?
        .captures(text)?
        .get(1)?
        .as_str()
        .to_lowercase();
    const NON_URL_WORDS: [&str; 8] = ["com", "org", "net", "io", "ai", "the", "and", "for"];
    if NON_URL_WORDS.contains(&domain.as_str()) {
        return None;
    }
    Some(format!("https://{domain}"))
}

fn describe_action(action: &Value) -> String {
    let get = |key: &str| -> String {
        action
            .get(key)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "?".to_string())
    };
    match action.get("type").and_then(Value::as_str).unwrap_or("unknown") {
        "click" => format!("Click at ({}, {})", get("x"), get("y")),
        "double_click" => format!("Double click at ({}, {})", get("x"), get("y")),
        "hover" | "move" => format!("Hover at ({}, {})", get("x"), get("y")),
        "drag" | "drag_and_drop" => "Drag".to_string(),
        "type" => {
            let text = get("text");
            let preview: String = text.chars().take(100).collect();
            format!("Type: {preview}")
        }
        "keypress" => format!("Keypress: {}", get("keys")),
        "scroll" => format!("Scroll at ({}, {})", get("x"), get("y")),
        "wait" => format!("Wait: {}ms", get("duration_ms")),
        "navigate" => format!("Navigate to: {}", get("url")),
        other => format!("Action: {other}"),
    }
}

fn usage_of(response: &Response, model: &str) -> UsageInfo {
    let counts = response.usage.clone().unwrap_or_default();
    let cost = leadforge_core::cost::calculate_cost(model, counts.input_tokens, counts.output_tokens);
    UsageInfo {
        model: Some(model.to_string()),
        input_tokens: counts.input_tokens,
        output_tokens: counts.output_tokens,
        total_tokens: counts.total_tokens,
        cost_usd: cost.cost_usd,
        service_type: Some("openai_worker_report".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection_prefers_full_urls() {
        assert_eq!(
            detect_url("go to https://cloudflare.com/login, then report").as_deref(),
            Some("https://cloudflare.com/login")
        );
        assert_eq!(
            detect_url("visit example.com and check").as_deref(),
            Some("https://example.com")
        );
        assert!(detect_url("count the widgets and report back").is_none());
    }

    #[test]
    fn display_size_from_tool_spec() {
        let tools = vec![json!({"type": "computer_use_preview", "display_width": 1280.0, "display_height": 800})];
        assert_eq!(display_size(&tools), (1280, 800));
        assert_eq!(display_size(&[]), (1024, 768));
    }

    #[test]
    fn hint_is_added_once() {
        let ctx = StepRunContext {
            tenant_id: "t".into(),
            job_id: "j".into(),
            step_index: 0,
            step_name: "s".into(),
            model: "computer-use-preview".into(),
            instructions: "Find the DNS provider".into(),
            context: String::new(),
            previous_context: String::new(),
            tools: vec![json!({"type": "computer_use_preview"}), json!({"type": "shell"})],
            tool_choice: "auto".into(),
            reasoning_effort: None,
            service_tier: None,
            text_verbosity: None,
            max_output_tokens: None,
            output_format: None,
            previous_image_urls: vec![],
            shell_settings: None,
        };
        let once = effective_instructions(&ctx);
        assert!(once.contains("TOOL ORDER:"));
        let again = effective_instructions(&StepRunContext { instructions: once.clone(), ..ctx });
        assert_eq!(once.matches("TOOL ORDER:").count(), again.matches("TOOL ORDER:").count());
    }
}
