// Error types for the lead-magnet worker

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors that can occur while driving a job
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Workflow references a missing resource, a malformed step, or an
    /// unsatisfied dependency
    #[error("Validation error: {0}")]
    Validation(String),

    /// Credential retrieval failed or the provider rejected our credentials
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Provider-imposed throttling
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// tool_choice="required" with an empty tool list after filtering
    #[error("Tool choice configuration error: {0}")]
    ToolChoiceConfig(String),

    /// Unknown model name for the provider
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Per-call or loop-budget timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Persistent failure to fetch, decode, or optimize images
    #[error("Image pipeline error: {0}")]
    ImagePipeline(String),

    /// Shell loop exhausted its iteration or wall-clock budget
    #[error("Shell loop budget exhausted: {0}")]
    ShellBudget(String),

    /// Computer-use loop detected a repeated action or ran out of budget
    #[error("Computer-use loop error: {0}")]
    ComputerLoop(String),

    /// Record or blob store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Catch-all
    #[error("{0}")]
    Unknown(String),
}

impl WorkerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        WorkerError::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        WorkerError::Storage(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        WorkerError::Timeout(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        WorkerError::Unknown(msg.into())
    }

    /// Wire-level category string persisted on failed jobs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Validation(_) => "validation",
            WorkerError::Authentication(_) => "authentication",
            WorkerError::RateLimit(_) => "rate_limit",
            WorkerError::ToolChoiceConfig(_) => "tool_choice_config",
            WorkerError::ModelNotFound(_) => "model_not_found",
            WorkerError::Timeout(_) => "timeout",
            WorkerError::Connection(_) => "connection",
            WorkerError::ImagePipeline(_) => "image_pipeline",
            WorkerError::ShellBudget(_) => "shell_budget",
            WorkerError::ComputerLoop(_) => "computer_loop",
            WorkerError::Storage(_) => "unknown",
            WorkerError::Unknown(_) => "unknown",
        }
    }

    /// Rebuild an error from a persisted kind string, for surfacing a step's
    /// classification at the job level.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "validation" => WorkerError::Validation(message),
            "authentication" => WorkerError::Authentication(message),
            "rate_limit" => WorkerError::RateLimit(message),
            "tool_choice_config" => WorkerError::ToolChoiceConfig(message),
            "model_not_found" => WorkerError::ModelNotFound(message),
            "timeout" => WorkerError::Timeout(message),
            "connection" => WorkerError::Connection(message),
            "image_pipeline" => WorkerError::ImagePipeline(message),
            "shell_budget" => WorkerError::ShellBudget(message),
            "computer_loop" => WorkerError::ComputerLoop(message),
            _ => WorkerError::Unknown(message),
        }
    }

    /// Classify a raw provider error message into a worker error.
    ///
    /// The provider surfaces most failures as plain strings; these rules sniff
    /// the well-known phrasings and fall back to `Unknown`.
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if message.contains("API key") || lower.contains("authentication") {
            WorkerError::Authentication(message.to_string())
        } else if lower.contains("rate limit") || lower.contains("quota") {
            WorkerError::RateLimit(message.to_string())
        } else if lower.contains("tool_choice") && lower.contains("required") && lower.contains("tools") {
            WorkerError::ToolChoiceConfig(message.to_string())
        } else if lower.contains("model") && lower.contains("not found") {
            WorkerError::ModelNotFound(message.to_string())
        } else if lower.contains("timeout") {
            WorkerError::Timeout(message.to_string())
        } else if lower.contains("connection") {
            WorkerError::Connection(message.to_string())
        } else {
            WorkerError::Unknown(message.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_authentication() {
        let err = WorkerError::classify_message("Incorrect API key provided");
        assert_eq!(err.kind(), "authentication");
    }

    #[test]
    fn classifies_rate_limit() {
        assert_eq!(
            WorkerError::classify_message("Rate limit reached for gpt-5").kind(),
            "rate_limit"
        );
        assert_eq!(
            WorkerError::classify_message("You exceeded your current quota").kind(),
            "rate_limit"
        );
    }

    #[test]
    fn classifies_tool_choice_config() {
        let err = WorkerError::classify_message(
            "Tool choice 'required' must be specified with 'tools' parameter",
        );
        assert_eq!(err.kind(), "tool_choice_config");
    }

    #[test]
    fn classifies_model_not_found() {
        assert_eq!(
            WorkerError::classify_message("The model `gpt-99` was not found").kind(),
            "model_not_found"
        );
    }

    #[test]
    fn classifies_timeout_and_connection() {
        assert_eq!(WorkerError::classify_message("Request timeout").kind(), "timeout");
        assert_eq!(
            WorkerError::classify_message("Connection reset by peer").kind(),
            "connection"
        );
    }

    #[test]
    fn unknown_is_the_fallback() {
        assert_eq!(WorkerError::classify_message("something odd").kind(), "unknown");
    }
}
