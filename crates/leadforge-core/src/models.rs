// Model capability profiles
//
// Capabilities are keyed off model-name prefixes, matching how the provider
// versions its families. Unknown models get conservative defaults.

use crate::tools::is_deep_research_model;

/// True if the model accepts the `reasoning` request parameter
pub fn supports_reasoning(model: &str) -> bool {
    let normalized = model.trim().to_lowercase();
    normalized.starts_with("gpt-5")
        || normalized.starts_with("o1")
        || normalized.starts_with("o3")
        || normalized.starts_with("o4")
        || normalized.starts_with("o5")
}

/// True for the provider's computer-use model family
pub fn is_computer_use_model(model: &str) -> bool {
    let normalized = model.to_lowercase();
    normalized.starts_with("computer-use") || normalized.contains("computer-use")
}

/// Computer-use and deep-research models reject image inputs entirely
pub fn supports_image_inputs(model: &str) -> bool {
    !is_computer_use_model(model) && !is_deep_research_model(model)
}

/// Default reasoning effort, applied when the step does not set one:
/// reasoning-capable families default to high
pub fn default_reasoning_effort(model: &str) -> Option<&'static str> {
    if supports_reasoning(model) {
        Some("high")
    } else {
        None
    }
}

/// Default service tier; gpt-5 family prefers the priority tier
pub fn default_service_tier(model: &str) -> Option<&'static str> {
    if model.starts_with("gpt-5") {
        Some("priority")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_support_by_prefix() {
        assert!(supports_reasoning("gpt-5"));
        assert!(supports_reasoning("gpt-5.2"));
        assert!(supports_reasoning("o3-mini"));
        assert!(supports_reasoning("o4-mini-deep-research"));
        assert!(!supports_reasoning("gpt-4o"));
        assert!(!supports_reasoning("computer-use-preview"));
    }

    #[test]
    fn image_input_support() {
        assert!(supports_image_inputs("gpt-5"));
        assert!(!supports_image_inputs("computer-use-preview-2025"));
        assert!(!supports_image_inputs("o4-mini-deep-research"));
    }

    #[test]
    fn reasoning_and_tier_defaults() {
        assert_eq!(default_reasoning_effort("gpt-5"), Some("high"));
        assert_eq!(default_reasoning_effort("o3"), Some("high"));
        assert_eq!(default_reasoning_effort("gpt-4o"), None);
        assert_eq!(default_service_tier("gpt-5.2"), Some("priority"));
        assert_eq!(default_service_tier("gpt-4o"), None);
    }
}
