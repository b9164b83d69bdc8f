// Shell tool loop
//
// Multi-turn protocol: the model requests shell commands, we execute them in
// the sandbox and feed the results back via previous_response_id until the
// model returns final text or a budget runs out. The sandbox workspace is
// reset only for the very first batch, so retries keep their state.
//
// Autonomy invariant: when the step set tool_choice="required", the first
// call keeps it but every follow-up downgrades to "auto". Otherwise the
// model can loop on tool calls forever without emitting final text.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{info, warn};

use leadforge_core::config::ShellLoopConfig;
use leadforge_core::{Result, WorkerError};
use leadforge_openai::params::{build_params, BuildParamsArgs};
use leadforge_openai::process::{process_response, ProcessContext};
use leadforge_openai::types::{Response, ShellCall};
use leadforge_openai::ResponsesApi;

use crate::live::LiveStepWriter;
use crate::shell::{derive_workspace_id, ShellExecutor, ShellJobRequest, ShellJobResult};

use super::{finalize_images, StepRunContext, StrategyOutcome, WorkerServices};

pub async fn run(services: &WorkerServices, ctx: &StepRunContext) -> Result<StrategyOutcome> {
    let executor = services.shell.clone().ok_or_else(|| {
        WorkerError::validation("Shell tool requested but no shell executor is configured")
    })?;

    let runtime = resolve_runtime(ctx, &services.config.shell_loop);
    info!(
        job_id = %ctx.job_id,
        step_index = ctx.step_index,
        max_iterations = runtime.max_iterations,
        max_duration_seconds = runtime.max_duration.as_secs(),
        "Starting shell loop"
    );

    let workspace_id = derive_workspace_id(&ctx.tenant_id, &ctx.job_id, ctx.step_index);
    let exec_env = build_exec_env(services, ctx, &workspace_id).await;

    let mut live = LiveStepWriter::new(services.records.clone(), &ctx.job_id, ctx.step_order());
    live.append("Starting shell execution...\n").await;

    let input_text = ctx.input_text();
    let initial = request_for(services, ctx, &ctx.tool_choice, &input_text);

    let mut usages = Vec::new();
    let mut response = services.api.call(&initial).await?;
    usages.push(usage_of(&response, &ctx.model));
    let mut previous_response_id = response.id.clone();

    let started = Instant::now();
    let mut iteration: u32 = 0;
    let mut reset_workspace_next = true;

    loop {
        if started.elapsed() > runtime.max_duration {
            warn!(job_id = %ctx.job_id, iterations = iteration, "Shell loop timed out");
            live.error("\nShell loop timed out.\n", "Shell loop timed out").await;
            return Err(WorkerError::ShellBudget(format!(
                "Shell loop exceeded {}s wall-clock budget after {iteration} iterations",
                runtime.max_duration.as_secs()
            )));
        }

        let shell_calls = response.shell_calls();
        if shell_calls.is_empty() {
            break;
        }

        iteration += 1;
        if iteration > runtime.max_iterations {
            live.error("\nShell loop iteration budget exhausted.\n", "Shell loop iteration budget exhausted")
                .await;
            return Err(WorkerError::ShellBudget(format!(
                "Shell loop exceeded {} iterations",
                runtime.max_iterations
            )));
        }
        info!(
            job_id = %ctx.job_id,
            iteration,
            shell_calls_count = shell_calls.len(),
            "Processing shell_call batch"
        );

        let mut tool_outputs = Vec::with_capacity(shell_calls.len());
        for call in &shell_calls {
            let output = execute_call(
                executor.as_ref(),
                &runtime,
                call,
                &workspace_id,
                reset_workspace_next,
                &exec_env,
                &mut live,
            )
            .await;
            reset_workspace_next = false;
            tool_outputs.push(output);
        }

        // Follow-ups relax required -> auto so the loop can terminate
        let next_choice = if ctx.tool_choice.eq_ignore_ascii_case("required") {
            "auto"
        } else {
            &ctx.tool_choice
        };
        let mut next = request_for(services, ctx, next_choice, "");
        next.previous_response_id = previous_response_id.clone();
        next.input = Value::Array(tool_outputs);

        response = services.api.call(&next).await?;
        usages.push(usage_of(&response, &ctx.model));
        previous_response_id = response.id.clone().or(previous_response_id);
    }

    info!(
        job_id = %ctx.job_id,
        iterations = iteration,
        final_output_text_length = response.text().len(),
        "Shell loop complete"
    );
    live.finish("\nShell execution complete.\n").await;

    let request_for_audit = request_for(services, ctx, &ctx.tool_choice, &input_text);
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
            request: &request_for_audit,
            service_type: "openai_worker_report",
        },
    );

    let (text, image_urls, image_artifact_ids) =
        finalize_images(services, ctx, processed.text.clone(), &processed.image_sources).await;
    let response_details = processed.response_details(&text, &image_urls);

    Ok(StrategyOutcome {
        text,
        image_urls,
        image_artifact_ids,
        usages,
        request_details: processed.request_details,
        response_details,
    })
}

struct RuntimeBudgets {
    max_iterations: u32,
    max_duration: std::time::Duration,
    default_command_timeout_ms: Option<u64>,
    default_command_max_output_length: u32,
}

/// Per-step settings override env which overrides defaults
fn resolve_runtime(ctx: &StepRunContext, env: &ShellLoopConfig) -> RuntimeBudgets {
    let settings = ctx.shell_settings.clone().unwrap_or_default();
    RuntimeBudgets {
        max_iterations: settings.max_iterations.unwrap_or(env.max_iterations),
        max_duration: settings
            .max_duration_seconds
            .map(std::time::Duration::from_secs)
            .unwrap_or(env.max_duration),
        default_command_timeout_ms: settings
            .command_timeout_ms
            .or(env.default_command_timeout_ms),
        default_command_max_output_length: settings
            .command_max_output_length
            .unwrap_or(env.default_command_max_output_length),
    }
}

async fn build_exec_env(
    services: &WorkerServices,
    ctx: &StepRunContext,
    workspace_id: &str,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("LM_JOB_ID".to_string(), ctx.job_id.clone());
    env.insert("LM_TENANT_ID".to_string(), ctx.tenant_id.clone());
    env.insert("LM_STEP_INDEX".to_string(), ctx.step_index.to_string());
    env.insert(
        "SHELL_EXECUTOR_WORKSPACE_ID".to_string(),
        workspace_id.to_string(),
    );
    // Tool-visible secrets ride along when configured
    if let Some(secrets) = &services.secrets {
        if let Ok(map) = secrets.get_secret("tool-secrets").await {
            for (key, value) in map {
                env.insert(key.to_uppercase(), value);
            }
        }
    }
    env
}

async fn execute_call(
    executor: &dyn ShellExecutor,
    runtime: &RuntimeBudgets,
    call: &ShellCall,
    workspace_id: &str,
    reset_workspace: bool,
    exec_env: &BTreeMap<String, String>,
    live: &mut LiveStepWriter,
) -> Value {
    let max_output_length = call
        .max_output_length
        .unwrap_or(runtime.default_command_max_output_length);

    if call.commands.is_empty() {
        live.error(
            "\nShell tool call had no commands.\n",
            "shell_call had no commands",
        )
        .await;
        return output_item(
            call,
            max_output_length,
            json!([{
                "stdout": "",
                "stderr": "",
                "outcome": {"type": "error", "message": "shell_call had no commands"}
            }]),
        );
    }

    for command in &call.commands {
        live.append(&format!("$ {command}\n")).await;
    }

    let request = ShellJobRequest {
        commands: call.commands.clone(),
        timeout_ms: call.timeout_ms.or(runtime.default_command_timeout_ms),
        max_output_length: Some(max_output_length),
        workspace_id: workspace_id.to_string(),
        reset_workspace,
        env: exec_env.clone(),
    };

    match executor.run(&request).await {
        Ok(result) => {
            echo_outputs(&result, live).await;
            let result_max = result.max_output_length.unwrap_or(max_output_length);
            output_item(
                call,
                result_max,
                serde_json::to_value(&result.output).unwrap_or_else(|_| json!([])),
            )
        }
        Err(e) => {
            warn!(error = %e, "Shell executor failed");
            live.error(&format!("\nShell execution failed: {e}\n"), e.to_string())
                .await;
            output_item(
                call,
                max_output_length,
                json!([{
                    "stdout": "",
                    "stderr": e.to_string(),
                    "outcome": {"type": "error", "message": e.to_string()}
                }]),
            )
        }
    }
}

async fn echo_outputs(result: &ShellJobResult, live: &mut LiveStepWriter) {
    for output in &result.output {
        if !output.stdout.is_empty() {
            let text = if output.stdout.ends_with('\n') {
                output.stdout.clone()
            } else {
                format!("{}\n", output.stdout)
            };
            live.append(&text).await;
        }
        if !output.stderr.is_empty() {
            let text = if output.stderr.ends_with('\n') {
                output.stderr.clone()
            } else {
                format!("{}\n", output.stderr)
            };
            live.append(&text).await;
        }
    }
}

/// Shape the tool output to echo the call's item type: native shell calls
/// get shell_call_output, function-style calls get function_call_output with
/// a JSON-encoded body.
fn output_item(call: &ShellCall, max_output_length: u32, output: Value) -> Value {
    if call.item_type == "function_call" {
        json!({
            "type": "function_call_output",
            "call_id": call.call_id,
            "output": serde_json::to_string(&json!({
                "commands": call.commands,
                "output": output,
                "max_output_length": max_output_length,
            }))
            .unwrap_or_default(),
        })
    } else {
        json!({
            "type": "shell_call_output",
            "call_id": call.call_id,
            "max_output_length": max_output_length,
            "output": output,
        })
    }
}

fn request_for(
    services: &WorkerServices,
    ctx: &StepRunContext,
    tool_choice: &str,
    input_text: &str,
) -> leadforge_openai::ResponseRequest {
    build_params(BuildParamsArgs {
        model: &ctx.model,
        instructions: &ctx.instructions,
        input_text,
        tools: &ctx.tools,
        tool_choice,
        has_computer_use: false,
        reasoning_effort: ctx.reasoning_effort.as_deref(),
        service_tier: ctx.service_tier.as_deref(),
        text_verbosity: ctx.text_verbosity.as_deref(),
        max_output_tokens: ctx.max_output_tokens,
        output_format: ctx.output_format.as_ref(),
        previous_image_urls: &[],
        code_interpreter_memory_limit: services.config.code_interpreter_memory_limit.as_deref(),
    })
}

fn usage_of(response: &Response, model: &str) -> leadforge_core::records::UsageInfo {
    let counts = response.usage.clone().unwrap_or_default();
    let cost = leadforge_core::cost::calculate_cost(model, counts.input_tokens, counts.output_tokens);
    leadforge_core::records::UsageInfo {
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
    fn function_calls_get_function_call_output() {
        let call = ShellCall {
            call_id: "c1".into(),
            item_type: "function_call".into(),
            commands: vec!["ls".into()],
            timeout_ms: None,
            max_output_length: None,
        };
        let item = output_item(&call, 4096, json!([]));
        assert_eq!(item["type"], "function_call_output");
        assert!(item["output"].is_string());

        let native = ShellCall { item_type: "shell_call".into(), ..call };
        let item = output_item(&native, 4096, json!([]));
        assert_eq!(item["type"], "shell_call_output");
        assert_eq!(item["max_output_length"], 4096);
    }
}
