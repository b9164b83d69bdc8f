// Tool registry, normalization, and validation for Responses API calls
//
// Tools travel as serde_json::Value objects so workflow authors can write
// either a bare type string ("web_search") or a full object. The registry is
// the single source of canonical tool shape; the validator decides what is
// legal to forward to the provider. Both are pure and deterministic apart
// from the environment probe for shell availability.

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::ShellAvailability;

/// Latest known image model, used when image_generation omits one
pub const DEFAULT_IMAGE_MODEL: &str = "gpt-image-1.5";

/// Default memory limit enforced on code_interpreter containers
pub const DEFAULT_CODE_INTERPRETER_MEMORY_LIMIT: &str = "64g";

const CODE_INTERPRETER_MEMORY_LIMITS: [&str; 4] = ["1g", "4g", "16g", "64g"];

/// Tool types that must carry a container parameter.
///
/// computer_use_preview no longer accepts one in the Responses API; keep this
/// list minimal and add only when the provider explicitly requires it.
pub fn requires_container(tool_type: &str) -> bool {
    tool_type == "code_interpreter"
}

/// Canonicalize a single tool: a bare string becomes an object with defaults.
pub fn normalize(tool: &Value) -> Option<Value> {
    match tool {
        Value::String(name) => Some(match name.as_str() {
            "image_generation" => image_generation_defaults(),
            "computer_use_preview" => computer_use_defaults(1024, 768),
            other => json!({ "type": other }),
        }),
        Value::Object(_) => Some(tool.clone()),
        other => {
            warn!(tool = %other, "Skipping invalid tool entry");
            None
        }
    }
}

/// Default configuration for the image_generation tool
pub fn image_generation_defaults() -> Value {
    json!({
        "type": "image_generation",
        "model": DEFAULT_IMAGE_MODEL,
        "size": "auto",
        "quality": "auto",
        "background": "auto"
    })
}

/// Definition for the computer use tool at a given display size
pub fn computer_use_defaults(display_width: u32, display_height: u32) -> Value {
    json!({
        "type": "computer_use_preview",
        "display_width": display_width,
        "display_height": display_height
    })
}

pub fn tool_type(tool: &Value) -> Option<&str> {
    match tool {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("type").and_then(Value::as_str),
        _ => None,
    }
}

pub fn has_tool_type(tools: &[Value], wanted: &str) -> bool {
    tools.iter().any(|t| tool_type(t) == Some(wanted))
}

pub fn has_image_generation(tools: &[Value]) -> bool {
    has_tool_type(tools, "image_generation")
}

pub fn has_computer_use(tools: &[Value]) -> bool {
    has_tool_type(tools, "computer_use_preview")
}

pub fn has_shell(tools: &[Value]) -> bool {
    has_tool_type(tools, "shell")
}

/// Deep-research models require at least one of web_search_preview, mcp, or
/// file_search to be present.
pub fn is_deep_research_model(model: &str) -> bool {
    model.to_lowercase().contains("deep-research") || model == "o4-mini-deep-research"
}

fn has_deep_research_tool(tools: &[Value]) -> bool {
    tools.iter().any(|t| {
        matches!(
            tool_type(t),
            Some("web_search_preview") | Some("mcp") | Some("file_search")
        )
    })
}

/// Normalize file_search's vector_store_ids: a string is promoted to a list,
/// entries are trimmed, blanks dropped. Returns None when nothing survives.
fn normalized_vector_store_ids(tool: &Map<String, Value>) -> Option<Vec<String>> {
    let raw = tool.get("vector_store_ids")?;
    let ids: Vec<String> = match raw {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let trimmed: Vec<String> = ids
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn normalize_memory_limit(value: Option<&Value>) -> Option<String> {
    let raw = value?.as_str()?;
    let mut normalized = raw.trim().to_lowercase();
    if let Some(stripped) = normalized.strip_suffix("gb") {
        normalized = format!("{stripped}g");
    }
    if CODE_INTERPRETER_MEMORY_LIMITS.contains(&normalized.as_str()) {
        Some(normalized)
    } else {
        None
    }
}

/// Pre-send cleaning pass: canonicalize shapes and enforce container rules.
///
/// - computer_use_preview must NOT carry `container` (unknown_parameter)
/// - code_interpreter gets `container.type=auto` plus the enforced memory limit
/// - file_search without usable vector_store_ids is dropped
/// - image_generation enum values are validated, invalid ones coerced to auto
pub fn clean_tools(tools: &[Value], env_memory_limit: Option<&str>) -> Vec<Value> {
    let mut cleaned = Vec::with_capacity(tools.len());

    for (idx, tool) in tools.iter().enumerate() {
        let Some(normalized) = normalize(tool) else {
            continue;
        };
        let Value::Object(mut map) = normalized else {
            continue;
        };
        let Some(tool_ty) = map.get("type").and_then(Value::as_str).map(str::to_string) else {
            warn!(index = idx, "Tool missing 'type' key; skipping");
            continue;
        };

        match tool_ty.as_str() {
            // Native Responses API tool types carry no extra configuration
            "shell" | "web_search" | "web_search_preview" => {
                map = match json!({ "type": tool_ty }) {
                    Value::Object(m) => m,
                    _ => unreachable!(),
                };
            }
            "file_search" => match normalized_vector_store_ids(&map) {
                Some(ids) => {
                    map.insert("vector_store_ids".into(), json!(ids));
                }
                None => {
                    warn!(index = idx, "Skipping file_search tool - vector_store_ids not provided or empty");
                    continue;
                }
            },
            "computer_use_preview" => {
                if map.remove("container").is_some() {
                    info!(index = idx, "Removed unsupported container parameter from computer_use_preview tool");
                }
            }
            "code_interpreter" => {
                let requested = normalize_memory_limit(
                    map.get("container")
                        .and_then(|c| c.get("memory_limit"))
                        .or_else(|| map.get("memory_limit")),
                )
                .or_else(|| normalize_memory_limit(env_memory_limit.map(|s| json!(s)).as_ref()));

                if let Some(limit) = &requested {
                    if limit != DEFAULT_CODE_INTERPRETER_MEMORY_LIMIT {
                        info!(requested = %limit, enforced = DEFAULT_CODE_INTERPRETER_MEMORY_LIMIT,
                              "Overriding code_interpreter memory_limit to default");
                    }
                }

                let mut container = map
                    .get("container")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                container.entry("type".to_string()).or_insert(json!("auto"));
                container.insert(
                    "memory_limit".to_string(),
                    json!(DEFAULT_CODE_INTERPRETER_MEMORY_LIMIT),
                );
                map.insert("container".to_string(), Value::Object(container));
                map.remove("memory_limit");
            }
            "image_generation" => {
                clean_image_generation(&mut map);
            }
            _ => {}
        }

        // Container must still be present for tools that require it
        if requires_container(&tool_ty) && !map.contains_key("container") {
            warn!(index = idx, tool = %tool_ty, "Missing container parameter; adding it");
            map.insert("container".to_string(), json!({ "type": "auto" }));
        }

        cleaned.push(Value::Object(map));
    }

    cleaned
}

fn clean_image_generation(map: &mut Map<String, Value>) {
    if !map.contains_key("model") {
        map.insert("model".into(), json!(DEFAULT_IMAGE_MODEL));
    }
    for key in ["size", "quality", "background"] {
        if !map.contains_key(key) {
            map.insert(key.into(), json!("auto"));
        }
    }

    let checks: [(&str, &[&str]); 3] = [
        ("size", &["1024x1024", "1024x1536", "1536x1024", "auto"]),
        ("quality", &["low", "medium", "high", "auto"]),
        ("background", &["transparent", "opaque", "auto"]),
    ];
    for (key, valid) in checks {
        let ok = map.get(key).and_then(Value::as_str).map(|v| valid.contains(&v));
        if ok != Some(true) {
            warn!(parameter = key, "Invalid value for image_generation tool, using 'auto'");
            map.insert(key.into(), json!("auto"));
        }
    }

    if let Some(format) = map.get("format").and_then(Value::as_str) {
        if !["png", "jpeg", "webp"].contains(&format) {
            warn!(format = %format, "Invalid format for image_generation tool, removing");
            map.remove("format");
        }
    }
    if let Some(compression) = map.get("compression") {
        let ok = compression
            .as_f64()
            .map(|c| (0.0..=100.0).contains(&c))
            .unwrap_or(false);
        if !ok {
            warn!("Invalid compression for image_generation tool (must be 0-100), removing");
            map.remove("compression");
        }
    }
    if let Some(fidelity) = map.get("input_fidelity").and_then(Value::as_str) {
        if !["low", "high"].contains(&fidelity) {
            warn!("Invalid input_fidelity for image_generation tool, removing");
            map.remove("input_fidelity");
        }
    }
}

/// Validate and filter a step's tools against the model and environment.
///
/// Soft-fails (drops the tool) rather than erroring; `required` never escapes
/// with an empty tool list.
pub fn validate_and_filter(
    tools: &[Value],
    tool_choice: &str,
    model: &str,
    shell: ShellAvailability,
) -> (Vec<Value>, String) {
    let deep_research = is_deep_research_model(model);

    if tools.is_empty() {
        if deep_research {
            info!(model = %model, "Deep research model requires a search tool; adding web_search_preview");
            return (vec![json!({"type": "web_search_preview"})], tool_choice.to_string());
        }
        return (Vec::new(), "none".to_string());
    }

    let computer_use_present = tools.iter().any(|t| tool_type(t) == Some("computer_use_preview"));
    let mut validated = Vec::with_capacity(tools.len());

    for (idx, tool) in tools.iter().enumerate() {
        let Some(normalized) = normalize(tool) else {
            continue;
        };
        let Some(ty) = tool_type(&normalized).map(str::to_string) else {
            warn!(index = idx, "Tool missing 'type' key; skipping");
            continue;
        };

        match ty.as_str() {
            "shell" if !shell.available() => {
                warn!(model = %model, "Shell tool requested but executor not configured; skipping tool");
                continue;
            }
            // The provider rejects code_interpreter alongside computer_use_preview
            "code_interpreter" if computer_use_present => {
                debug!("Filtering out code_interpreter - incompatible with computer_use_preview");
                continue;
            }
            "file_search" => {
                let keep = normalized
                    .as_object()
                    .and_then(normalized_vector_store_ids)
                    .is_some();
                if !keep {
                    warn!("Skipping file_search tool - vector_store_ids not provided or empty");
                    continue;
                }
            }
            _ => {}
        }

        validated.push(normalized);
    }

    if deep_research && !has_deep_research_tool(&validated) {
        warn!(model = %model, "Deep research model requires a search tool after filtering; adding web_search_preview");
        validated.push(json!({"type": "web_search_preview"}));
    }

    let normalized_choice = if validated.is_empty() {
        "none".to_string()
    } else {
        match tool_choice {
            "required" => "required".to_string(),
            _ => "auto".to_string(),
        }
    };

    (validated, normalized_choice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_on() -> ShellAvailability {
        ShellAvailability::Enabled
    }

    fn shell_off() -> ShellAvailability {
        ShellAvailability::Disabled
    }

    #[test]
    fn normalizes_string_tools() {
        let tool = normalize(&json!("web_search")).unwrap();
        assert_eq!(tool, json!({"type": "web_search"}));

        let image = normalize(&json!("image_generation")).unwrap();
        assert_eq!(image["model"], DEFAULT_IMAGE_MODEL);
        assert_eq!(image["size"], "auto");
    }

    #[test]
    fn required_never_escapes_with_empty_tools() {
        let (tools, choice) = validate_and_filter(&[], "required", "gpt-5", shell_on());
        assert!(tools.is_empty());
        assert_eq!(choice, "none");

        // All tools filtered out still downgrades
        let (tools, choice) = validate_and_filter(
            &[json!({"type": "file_search"})],
            "required",
            "gpt-5",
            shell_on(),
        );
        assert!(tools.is_empty());
        assert_eq!(choice, "none");
    }

    #[test]
    fn shell_is_dropped_when_executor_unconfigured() {
        let (tools, _) = validate_and_filter(&[json!("shell")], "auto", "gpt-5", shell_off());
        assert!(tools.is_empty());

        let (tools, _) = validate_and_filter(&[json!("shell")], "auto", "gpt-5", shell_on());
        assert_eq!(tools.len(), 1);
    }

    #[test]
    fn code_interpreter_incompatible_with_computer_use() {
        let (tools, _) = validate_and_filter(
            &[json!("code_interpreter"), json!("computer_use_preview")],
            "auto",
            "computer-use-preview",
            shell_on(),
        );
        let types: Vec<&str> = tools.iter().filter_map(tool_type).collect();
        assert_eq!(types, vec!["computer_use_preview"]);
    }

    #[test]
    fn deep_research_model_gets_web_search_preview() {
        let (tools, _) =
            validate_and_filter(&[], "auto", "o4-mini-deep-research", shell_on());
        assert_eq!(tool_type(&tools[0]), Some("web_search_preview"));

        let (tools, _) = validate_and_filter(
            &[json!("code_interpreter")],
            "auto",
            "o3-deep-research",
            shell_on(),
        );
        assert!(has_tool_type(&tools, "web_search_preview"));
    }

    #[test]
    fn file_search_requires_vector_store_ids() {
        let (tools, _) = validate_and_filter(
            &[json!({"type": "file_search", "vector_store_ids": ["  vs_1 ", ""]})],
            "auto",
            "gpt-5",
            shell_on(),
        );
        assert_eq!(tools.len(), 1);

        let cleaned = clean_tools(&tools, None);
        assert_eq!(cleaned[0]["vector_store_ids"], json!(["vs_1"]));
    }

    #[test]
    fn clean_strips_container_from_computer_use() {
        let cleaned = clean_tools(
            &[json!({"type": "computer_use_preview", "container": {"type": "auto"}})],
            None,
        );
        assert!(cleaned[0].get("container").is_none());
    }

    #[test]
    fn clean_enforces_code_interpreter_memory_limit() {
        let cleaned = clean_tools(&[json!({"type": "code_interpreter", "memory_limit": "16GB"})], None);
        assert_eq!(cleaned[0]["container"]["type"], "auto");
        assert_eq!(cleaned[0]["container"]["memory_limit"], "64g");
        assert!(cleaned[0].get("memory_limit").is_none());
    }

    #[test]
    fn clean_coerces_invalid_image_generation_values() {
        let cleaned = clean_tools(
            &[json!({
                "type": "image_generation",
                "size": "4096x4096",
                "quality": "ultra",
                "format": "bmp",
                "compression": 250
            })],
            None,
        );
        assert_eq!(cleaned[0]["size"], "auto");
        assert_eq!(cleaned[0]["quality"], "auto");
        assert!(cleaned[0].get("format").is_none());
        assert!(cleaned[0].get("compression").is_none());
    }

    #[test]
    fn predicates_see_through_strings_and_objects() {
        let tools = vec![json!("shell"), json!({"type": "image_generation"})];
        assert!(has_shell(&tools));
        assert!(has_image_generation(&tools));
        assert!(!has_computer_use(&tools));
    }
}
