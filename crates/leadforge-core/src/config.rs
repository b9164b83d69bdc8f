// Environment-derived worker configuration

use std::env;
use std::time::Duration;

/// Whether the shell tool can be forwarded to the provider in this
/// environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellAvailability {
    Enabled,
    Disabled,
}

impl ShellAvailability {
    pub fn available(self) -> bool {
        matches!(self, ShellAvailability::Enabled)
    }

    /// Probe the environment: an explicit SHELL_TOOL_ENABLED=false wins;
    /// local dev (IS_LOCAL=true) enables; otherwise the executor function
    /// name must be configured.
    pub fn from_env() -> Self {
        let flag = env::var("SHELL_TOOL_ENABLED").unwrap_or_default();
        let flag = flag.trim().to_lowercase();
        if !flag.is_empty() && !matches!(flag.as_str(), "true" | "1" | "yes") {
            return ShellAvailability::Disabled;
        }
        if env::var("IS_LOCAL").map(|v| v.trim().eq_ignore_ascii_case("true")) == Ok(true) {
            return ShellAvailability::Enabled;
        }
        match env::var("SHELL_EXECUTOR_FUNCTION_NAME") {
            Ok(name) if !name.trim().is_empty() => ShellAvailability::Enabled,
            _ => ShellAvailability::Disabled,
        }
    }
}

/// Shell loop runtime budgets, resolved per step: step settings override env,
/// env overrides defaults.
#[derive(Debug, Clone)]
pub struct ShellLoopConfig {
    pub max_iterations: u32,
    pub max_duration: Duration,
    pub default_command_timeout_ms: Option<u64>,
    pub default_command_max_output_length: u32,
}

impl Default for ShellLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            max_duration: Duration::from_secs(14 * 60),
            default_command_timeout_ms: None,
            default_command_max_output_length: 4096,
        }
    }
}

impl ShellLoopConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_iterations: read_positive("SHELL_LOOP_MAX_ITERATIONS")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_iterations),
            max_duration: read_positive("SHELL_LOOP_MAX_DURATION_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_duration),
            default_command_timeout_ms: read_positive("SHELL_EXECUTOR_DEFAULT_TIMEOUT_MS"),
            default_command_max_output_length: read_positive("SHELL_EXECUTOR_DEFAULT_MAX_OUTPUT_LENGTH")
                .map(|n| n as u32)
                .unwrap_or(defaults.default_command_max_output_length),
        }
    }
}

/// Delegated S3-upload convention settings for shell steps
#[derive(Debug, Clone)]
pub struct S3UploadConfig {
    pub allowed_buckets: Vec<String>,
    pub key_prefix: Option<String>,
    pub put_expires_in: Duration,
}

impl S3UploadConfig {
    pub fn from_env() -> Self {
        let allowed_buckets = env::var("SHELL_S3_UPLOAD_ALLOWED_BUCKETS")
            .unwrap_or_default()
            .split(',')
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        let expires = read_positive("SHELL_S3_UPLOAD_PUT_EXPIRES_IN").unwrap_or(1800);
        // Presign lifetimes outside [60s, 7d] are rejected upstream
        let expires = expires.clamp(60, 7 * 24 * 60 * 60);
        Self {
            allowed_buckets,
            key_prefix: env::var("SHELL_S3_UPLOAD_KEY_PREFIX").ok().filter(|p| !p.trim().is_empty()),
            put_expires_in: Duration::from_secs(expires),
        }
    }
}

/// Top-level worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub shell_availability: ShellAvailability,
    pub shell_loop: ShellLoopConfig,
    pub s3_upload: S3UploadConfig,
    pub code_interpreter_memory_limit: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            shell_availability: ShellAvailability::from_env(),
            shell_loop: ShellLoopConfig::from_env(),
            s3_upload: S3UploadConfig::from_env(),
            code_interpreter_memory_limit: env::var("CODE_INTERPRETER_MEMORY_LIMIT").ok(),
        }
    }
}

fn read_positive(name: &str) -> Option<u64> {
    let value = env::var(name).ok()?;
    let parsed = value.trim().parse::<u64>().ok()?;
    if parsed > 0 {
        Some(parsed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_loop_defaults() {
        let config = ShellLoopConfig::default();
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.max_duration, Duration::from_secs(840));
        assert_eq!(config.default_command_max_output_length, 4096);
        assert!(config.default_command_timeout_ms.is_none());
    }
}
