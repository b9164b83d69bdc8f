// Response processing
//
// Turns a raw provider response into the pieces the step executor persists:
// final text, generated-image sources, usage with cost, and fully serialized
// request/response values for auditing. Image bytes are not handled here;
// base64 sources are returned as-is for the worker's image pipeline to
// upload.

use serde_json::{json, Value};

use leadforge_core::cost::calculate_cost;
use leadforge_core::records::UsageInfo;

use crate::types::{ImageSource, Response, ResponseRequest};

pub struct ProcessContext<'a> {
    pub model: &'a str,
    pub instructions: &'a str,
    pub input_text: &'a str,
    pub previous_context: &'a str,
    pub context: &'a str,
    pub tools: &'a [Value],
    pub tool_choice: &'a str,
    pub request: &'a ResponseRequest,
    /// Usage record label, e.g. "openai_worker_report"
    pub service_type: &'a str,
}

#[derive(Debug, Clone)]
pub struct ProcessedResponse {
    /// Final output text (before any base64-asset rescue)
    pub text: String,
    /// Generated images found in the response; base64 entries still need
    /// uploading
    pub image_sources: Vec<ImageSource>,
    pub usage: UsageInfo,
    /// Audit snapshot of what was sent
    pub request_details: Value,
    /// Full serialized provider response
    pub raw_response: Value,
}

impl ProcessedResponse {
    /// Audit snapshot of what came back, with the final (post-upload) image
    /// URLs and possibly rewritten text spliced in.
    pub fn response_details(&self, text: &str, image_urls: &[String]) -> Value {
        json!({
            "output_text": text,
            "image_urls": image_urls,
            "usage": {
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
                "total_tokens": self.usage.total_tokens,
            },
            "model": self.usage.model,
            "raw_api_response": self.raw_response,
        })
    }
}

/// Extract text, images, usage, and audit records from a provider response.
pub fn process_response(response: &Response, ctx: ProcessContext<'_>) -> ProcessedResponse {
    let text = response.text();

    let usage_counts = response.usage.clone().unwrap_or_default();
    let cost = calculate_cost(ctx.model, usage_counts.input_tokens, usage_counts.output_tokens);
    let usage = UsageInfo {
        model: Some(ctx.model.to_string()),
        input_tokens: usage_counts.input_tokens,
        output_tokens: usage_counts.output_tokens,
        total_tokens: usage_counts.total_tokens,
        cost_usd: cost.cost_usd,
        service_type: Some(ctx.service_type.to_string()),
    };

    let request_details = json!({
        "model": ctx.model,
        "instructions": ctx.instructions,
        "input": ctx.input_text,
        "previous_context": ctx.previous_context,
        "context": ctx.context,
        "tools": ctx.tools,
        "tool_choice": ctx.tool_choice,
        "raw_api_request": serde_json::to_value(ctx.request).unwrap_or(Value::Null),
    });

    let raw_response = serde_json::to_value(response).unwrap_or(Value::Null);

    ProcessedResponse {
        text,
        image_sources: response.image_generation_results(),
        usage,
        request_details,
        raw_response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(request: &'a ResponseRequest) -> ProcessContext<'a> {
        ProcessContext {
            model: "gpt-5",
            instructions: "do it",
            input_text: "in",
            previous_context: "prev",
            context: "ctx",
            tools: &[],
            tool_choice: "auto",
            request,
            service_type: "openai_worker_report",
        }
    }

    #[test]
    fn extracts_text_usage_and_cost() {
        let request = ResponseRequest::default();
        let response: Response = serde_json::from_value(json!({
            "output_text": "Ada wants a course on dragons.",
            "output": [],
            "usage": {"input_tokens": 50, "output_tokens": 10, "total_tokens": 60}
        }))
        .unwrap();

        let processed = process_response(&response, ctx(&request));
        assert_eq!(processed.text, "Ada wants a course on dragons.");
        assert_eq!(processed.usage.input_tokens, 50);
        assert!(processed.usage.cost_usd > 0.0);
        assert_eq!(processed.usage.service_type.as_deref(), Some("openai_worker_report"));
        assert_eq!(processed.request_details["tool_choice"], "auto");
    }

    #[test]
    fn response_details_carry_final_urls() {
        let request = ResponseRequest::default();
        let response = Response::default();
        let processed = process_response(&response, ctx(&request));
        let details =
            processed.response_details("final text", &["https://img/1.png".to_string()]);
        assert_eq!(details["output_text"], "final text");
        assert_eq!(details["image_urls"][0], "https://img/1.png");
    }
}
