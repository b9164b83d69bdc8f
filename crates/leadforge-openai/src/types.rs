// Responses API wire types
//
// The output side is deliberately tolerant: items are kept as raw JSON and
// typed views are extracted on demand, because the provider adds item shapes
// faster than any closed enum could track. Usage counts coerce decimal-boxed
// numbers to plain integers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use leadforge_core::records::coerce_u64;

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// A plain string, or the role/content list form for multimodal and
    /// tool-output inputs
    pub input: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ResponseRequest {
    /// True when the input is the list form and carries at least one
    /// input_image item
    pub fn has_image_input(&self) -> bool {
        !self.input_image_urls().is_empty()
    }

    /// Image URLs present in the multimodal input
    pub fn input_image_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Value::Array(messages) = &self.input {
            for message in messages {
                let Some(content) = message.get("content").and_then(Value::as_array) else {
                    continue;
                };
                for item in content {
                    if item.get("type").and_then(Value::as_str) == Some("input_image") {
                        if let Some(url) = item.get("image_url").and_then(Value::as_str) {
                            urls.push(url.to_string());
                        }
                    }
                }
            }
        }
        urls
    }

    /// Rewrite one input_image URL in place; returns true when a match was
    /// replaced
    pub fn replace_input_image(&mut self, from: &str, to: &str) -> bool {
        self.map_input_images(|url| {
            if url.contains(from) || from.contains(url) {
                Some(Some(to.to_string()))
            } else {
                None
            }
        })
    }

    /// Drop one input_image from the input; returns true when removed
    pub fn remove_input_image(&mut self, url: &str) -> bool {
        self.map_input_images(|current| {
            if current.contains(url) || url.contains(current) {
                Some(None)
            } else {
                None
            }
        })
    }

    // Visit input_image items: the callback returns Some(Some(new)) to
    // replace, Some(None) to remove, None to leave untouched.
    fn map_input_images<F>(&mut self, mut visit: F) -> bool
    where
        F: FnMut(&str) -> Option<Option<String>>,
    {
        let mut changed = false;
        if let Value::Array(messages) = &mut self.input {
            for message in messages {
                let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) else {
                    continue;
                };
                let mut kept = Vec::with_capacity(content.len());
                for item in content.drain(..) {
                    if item.get("type").and_then(Value::as_str) == Some("input_image") {
                        let url = item
                            .get("image_url")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        match visit(&url) {
                            Some(Some(replacement)) => {
                                changed = true;
                                kept.push(json!({"type": "input_image", "image_url": replacement}));
                                continue;
                            }
                            Some(None) => {
                                changed = true;
                                continue;
                            }
                            None => {}
                        }
                    }
                    kept.push(item);
                }
                *content = kept;
            }
        }
        changed
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, deserialize_with = "de_u32")]
    pub input_tokens: u32,
    #[serde(default, deserialize_with = "de_u32")]
    pub output_tokens: u32,
    #[serde(default, deserialize_with = "de_u32")]
    pub total_tokens: u32,
}

fn de_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(coerce_u64).unwrap_or(0) as u32)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// A shell tool invocation requested by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ShellCall {
    pub call_id: String,
    /// `shell_call` or `function_call`; the output item type must echo it
    pub item_type: String,
    pub commands: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub max_output_length: Option<u32>,
}

/// A GUI action requested by the model
#[derive(Debug, Clone)]
pub struct ComputerCall {
    pub call_id: String,
    pub action: Value,
    pub pending_safety_checks: Vec<Value>,
}

/// A generic tool invocation the worker does not natively execute
#[derive(Debug, Clone)]
pub struct GenericToolCall {
    pub call_id: String,
    pub item_type: String,
    pub tool_name: String,
}

/// Where a generated image lives in the response
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Url(String),
    Base64 { data: String, mime_type: String },
}

fn get_str<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

fn item_call_id(item: &Value) -> Option<String> {
    get_str(item, "call_id")
        .or_else(|| get_str(item, "id"))
        .map(str::to_string)
}

fn item_tool_name(item: &Value) -> Option<String> {
    get_str(item, "tool_name")
        .or_else(|| get_str(item, "name"))
        .or_else(|| item.get("function").and_then(|f| get_str(f, "name")))
        .map(str::to_string)
}

fn item_action(item: &Value) -> Value {
    for key in ["action", "arguments"] {
        if let Some(action) = item.get(key) {
            if !action.is_null() {
                return parse_maybe_json(action);
            }
        }
    }
    if let Some(args) = item.get("function").and_then(|f| f.get("arguments")) {
        return parse_maybe_json(args);
    }
    Value::Object(Map::new())
}

// Function-call arguments arrive as a JSON-encoded string; unwrap one level.
fn parse_maybe_json(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

const SHELL_TOOL_NAMES: [&str; 2] = ["shell", "execute_shell_command"];

impl Response {
    /// Final text: the synthesized output_text when present, else the text
    /// parts of message items.
    pub fn text(&self) -> String {
        if let Some(text) = &self.output_text {
            if !text.is_empty() {
                return text.clone();
            }
        }
        self.text_outputs().join(" ")
    }

    /// Text parts gathered from message / output_text items
    pub fn text_outputs(&self) -> Vec<String> {
        let mut outputs = Vec::new();
        for item in &self.output {
            match get_str(item, "type") {
                Some("message") => {
                    if let Some(content) = item.get("content").and_then(Value::as_array) {
                        for part in content {
                            if matches!(get_str(part, "type"), Some("output_text") | Some("text")) {
                                if let Some(text) = get_str(part, "text") {
                                    if !text.is_empty() {
                                        outputs.push(text.to_string());
                                    }
                                }
                            }
                        }
                    }
                }
                Some("text") | Some("output_text") => {
                    let text = get_str(item, "text").or_else(|| get_str(item, "content"));
                    if let Some(text) = text {
                        if !text.is_empty() {
                            outputs.push(text.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        outputs
    }

    /// Reasoning summary texts
    pub fn reasoning_texts(&self) -> Vec<String> {
        let mut texts = Vec::new();
        for item in &self.output {
            if get_str(item, "type") != Some("reasoning") {
                continue;
            }
            if let Some(summary) = item.get("summary").and_then(Value::as_array) {
                for entry in summary {
                    if let Some(text) = get_str(entry, "text") {
                        if !text.is_empty() {
                            texts.push(text.to_string());
                        }
                    }
                }
            }
        }
        texts
    }

    /// Shell invocations: native shell_call items plus tool/function calls
    /// whose name is the shell tool.
    pub fn shell_calls(&self) -> Vec<ShellCall> {
        let mut calls = Vec::new();
        for item in &self.output {
            let item_type = get_str(item, "type").unwrap_or_default();
            let is_shell = match item_type {
                "shell_call" => true,
                "tool_call" | "function_call" => item_tool_name(item)
                    .map(|name| SHELL_TOOL_NAMES.contains(&name.as_str()))
                    .unwrap_or(false),
                _ => false,
            };
            if !is_shell {
                continue;
            }
            let Some(call_id) = item_call_id(item) else {
                continue;
            };
            let action = item_action(item);
            let commands = match action.get("commands") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|c| match c {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
                _ => Vec::new(),
            };
            calls.push(ShellCall {
                call_id,
                item_type: item_type.to_string(),
                commands,
                timeout_ms: action.get("timeout_ms").and_then(coerce_u64),
                max_output_length: action
                    .get("max_output_length")
                    .and_then(coerce_u64)
                    .map(|n| n as u32),
            });
        }
        calls
    }

    pub fn computer_calls(&self) -> Vec<ComputerCall> {
        let mut calls = Vec::new();
        for item in &self.output {
            if get_str(item, "type") != Some("computer_call") {
                continue;
            }
            let Some(call_id) = item_call_id(item) else {
                continue;
            };
            calls.push(ComputerCall {
                call_id,
                action: item_action(item),
                pending_safety_checks: item
                    .get("pending_safety_checks")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            });
        }
        calls
    }

    /// Tool/function calls that are neither shell nor computer use
    pub fn generic_tool_calls(&self) -> Vec<GenericToolCall> {
        let mut calls = Vec::new();
        for item in &self.output {
            let item_type = get_str(item, "type").unwrap_or_default();
            if !matches!(item_type, "tool_call" | "function_call") {
                continue;
            }
            let name = item_tool_name(item).unwrap_or_default();
            if SHELL_TOOL_NAMES.contains(&name.as_str()) {
                continue;
            }
            let Some(call_id) = item_call_id(item) else {
                continue;
            };
            calls.push(GenericToolCall {
                call_id,
                item_type: item_type.to_string(),
                tool_name: name,
            });
        }
        calls
    }

    /// True if the response requests any tool execution
    pub fn has_tool_calls(&self) -> bool {
        !self.shell_calls().is_empty()
            || !self.computer_calls().is_empty()
            || !self.generic_tool_calls().is_empty()
    }

    /// Results of image_generation_call items: a URL, or base64 payload to
    /// be uploaded by the caller.
    pub fn image_generation_results(&self) -> Vec<ImageSource> {
        let mut sources = Vec::new();
        for item in &self.output {
            if get_str(item, "type") != Some("image_generation_call") {
                continue;
            }
            let result = get_str(item, "result")
                .or_else(|| get_str(item, "url"))
                .or_else(|| item.get("output").and_then(Value::as_str));
            let Some(result) = result else {
                continue;
            };
            if result.starts_with("http://") || result.starts_with("https://") {
                sources.push(ImageSource::Url(result.to_string()));
            } else if let Some(rest) = result.strip_prefix("data:") {
                let mime = rest.split(';').next().unwrap_or("image/png").to_string();
                let data = rest.split(',').nth(1).unwrap_or_default().to_string();
                sources.push(ImageSource::Base64 { data, mime_type: mime });
            } else if !result.is_empty() {
                // Bare base64; the provider defaults to PNG
                let mime = get_str(item, "output_format")
                    .map(|f| format!("image/{f}"))
                    .unwrap_or_else(|| "image/png".to_string());
                sources.push(ImageSource::Base64 {
                    data: result.to_string(),
                    mime_type: mime,
                });
            }
        }
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_prefers_output_text() {
        let response: Response = serde_json::from_value(json!({
            "output_text": "hello",
            "output": [{"type": "message", "content": [{"type": "output_text", "text": "ignored"}]}]
        }))
        .unwrap();
        assert_eq!(response.text(), "hello");
    }

    #[test]
    fn text_falls_back_to_message_items() {
        let response: Response = serde_json::from_value(json!({
            "output": [
                {"type": "message", "content": [{"type": "output_text", "text": "part one"}]},
                {"type": "output_text", "text": "part two"}
            ]
        }))
        .unwrap();
        assert_eq!(response.text(), "part one part two");
    }

    #[test]
    fn shell_calls_from_native_and_function_items() {
        let response: Response = serde_json::from_value(json!({
            "output": [
                {"type": "shell_call", "call_id": "c1", "action": {"commands": ["ls -la"], "timeout_ms": 5000.0}},
                {"type": "function_call", "call_id": "c2", "name": "execute_shell_command",
                 "arguments": "{\"commands\": [\"pwd\"]}"},
                {"type": "function_call", "call_id": "c3", "name": "other_tool", "arguments": "{}"}
            ]
        }))
        .unwrap();
        let calls = response.shell_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].commands, vec!["ls -la"]);
        assert_eq!(calls[0].timeout_ms, Some(5000));
        assert_eq!(calls[1].commands, vec!["pwd"]);
        assert_eq!(calls[1].item_type, "function_call");
        assert_eq!(response.generic_tool_calls().len(), 1);
    }

    #[test]
    fn computer_calls_carry_safety_checks() {
        let response: Response = serde_json::from_value(json!({
            "output": [{
                "type": "computer_call",
                "call_id": "c1",
                "action": {"type": "click", "x": 100, "y": 200},
                "pending_safety_checks": [{"id": "sc1", "code": "malicious", "message": "check"}]
            }]
        }))
        .unwrap();
        let calls = response.computer_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action["type"], "click");
        assert_eq!(calls[0].pending_safety_checks.len(), 1);
    }

    #[test]
    fn image_generation_results_split_url_and_base64() {
        let response: Response = serde_json::from_value(json!({
            "output": [
                {"type": "image_generation_call", "result": "https://img/1.png"},
                {"type": "image_generation_call", "result": "aGVsbG8=", "output_format": "jpeg"}
            ]
        }))
        .unwrap();
        let sources = response.image_generation_results();
        assert_eq!(sources[0], ImageSource::Url("https://img/1.png".into()));
        assert_eq!(
            sources[1],
            ImageSource::Base64 { data: "aGVsbG8=".into(), mime_type: "image/jpeg".into() }
        );
    }

    #[test]
    fn usage_coerces_decimal_boxed_counts() {
        let usage: Usage = serde_json::from_value(json!({
            "input_tokens": 50.0,
            "output_tokens": 10,
            "total_tokens": "60"
        }))
        .unwrap();
        assert_eq!(usage.input_tokens, 50);
        assert_eq!(usage.total_tokens, 60);
    }

    #[test]
    fn request_image_rewrite_and_removal() {
        let mut request = ResponseRequest {
            model: "gpt-5".into(),
            input: json!([{"role": "user", "content": [
                {"type": "input_text", "text": "hi"},
                {"type": "input_image", "image_url": "https://a/1.png"},
                {"type": "input_image", "image_url": "https://a/2.png"}
            ]}]),
            ..Default::default()
        };
        assert!(request.replace_input_image("https://a/1.png", "data:image/png;base64,xx"));
        assert!(request.remove_input_image("https://a/2.png"));
        let urls = request.input_image_urls();
        assert_eq!(urls, vec!["data:image/png;base64,xx"]);
    }
}
