// Strategy dispatcher
//
// Pure selection over the step configuration: exactly one interaction mode
// per step.

use serde_json::Value;

use leadforge_core::models::is_computer_use_model;
use leadforge_core::tools::{has_computer_use, has_image_generation, has_shell, tool_type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Dedicated Images API path
    ImageGeneration,
    /// Multi-turn GUI control loop against the browser sandbox
    ComputerUse,
    /// Multi-turn shell command loop
    Shell,
    /// Single streamed Responses API call
    Standard,
}

/// Pick the strategy for a step. Image generation wins when its tool names a
/// gpt-image model; computer use requires both the model family and the
/// tool; shell yields to computer use.
pub fn select(model: &str, tools: &[Value]) -> Strategy {
    if has_image_generation(tools) && image_tool_model(tools).starts_with("gpt-image") {
        return Strategy::ImageGeneration;
    }
    if is_computer_use_model(model) && has_computer_use(tools) {
        return Strategy::ComputerUse;
    }
    if has_shell(tools) && !has_computer_use(tools) {
        return Strategy::Shell;
    }
    Strategy::Standard
}

/// Model configured on the image_generation tool (default when unset)
pub fn image_tool_model(tools: &[Value]) -> String {
    tools
        .iter()
        .find(|t| tool_type(t) == Some("image_generation"))
        .and_then(|t| t.get("model"))
        .and_then(Value::as_str)
        .unwrap_or(leadforge_core::tools::DEFAULT_IMAGE_MODEL)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn image_generation_needs_gpt_image_model() {
        let tools = vec![json!({"type": "image_generation", "model": "gpt-image-1.5"})];
        assert_eq!(select("gpt-5", &tools), Strategy::ImageGeneration);

        let tools = vec![json!({"type": "image_generation", "model": "dall-e-3"})];
        assert_eq!(select("gpt-5", &tools), Strategy::Standard);
    }

    #[test]
    fn computer_use_requires_model_and_tool() {
        let tools = vec![json!({"type": "computer_use_preview"})];
        assert_eq!(select("computer-use-preview", &tools), Strategy::ComputerUse);
        assert_eq!(select("gpt-5", &tools), Strategy::Standard);
        assert_eq!(select("computer-use-preview", &[]), Strategy::Standard);
    }

    #[test]
    fn shell_yields_to_computer_use() {
        let tools = vec![json!({"type": "shell"}), json!({"type": "computer_use_preview"})];
        assert_eq!(select("computer-use-preview", &tools), Strategy::ComputerUse);

        let tools = vec![json!({"type": "shell"})];
        assert_eq!(select("gpt-5", &tools), Strategy::Shell);
    }

    #[test]
    fn default_is_standard() {
        assert_eq!(select("gpt-5", &[]), Strategy::Standard);
        let tools = vec![json!({"type": "web_search"})];
        assert_eq!(select("gpt-5", &tools), Strategy::Standard);
    }
}
