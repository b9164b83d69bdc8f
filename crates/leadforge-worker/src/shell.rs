// Shell execution seam
//
// The sandboxed shell service is an external collaborator; this module
// defines its interface plus a local process-backed implementation for dev
// parity (IS_LOCAL=true). Workspace ids are derived deterministically from
// (tenant, job, step) so reruns land on the same sandbox directory and the
// hex-only form rules out path traversal.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use leadforge_core::{Result, WorkerError};

/// One command's captured output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellCommandOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub outcome: ShellOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellOutcome {
    Exit { exit_code: i32 },
    Timeout,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellJobResult {
    pub output: Vec<ShellCommandOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_length: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ShellJobRequest {
    pub commands: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub max_output_length: Option<u32>,
    pub workspace_id: String,
    pub reset_workspace: bool,
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait ShellExecutor: Send + Sync {
    async fn run(&self, request: &ShellJobRequest) -> Result<ShellJobResult>;
}

/// Deterministic, traversal-safe workspace id for a (tenant, job, step)
pub fn derive_workspace_id(tenant_id: &str, job_id: &str, step_index: usize) -> String {
    let base = format!("{tenant_id}:{job_id}:{step_index}");
    let digest = Sha256::digest(base.as_bytes());
    format!("w_{}", &hex::encode(digest)[..32])
}

/// Truncate a command's captured output to the cap, keeping the head
pub fn truncate_output(output: &str, max_len: u32) -> String {
    let max = max_len as usize;
    if output.len() <= max {
        return output.to_string();
    }
    let mut end = max;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &output[..end])
}

// ============================================================================
// Local process executor (dev parity)
// ============================================================================

/// Runs commands as local subprocesses under a per-workspace directory.
/// Used when IS_LOCAL=true; production points at the sandboxed service.
pub struct ProcessShellExecutor {
    root: std::path::PathBuf,
}

impl ProcessShellExecutor {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ShellExecutor for ProcessShellExecutor {
    async fn run(&self, request: &ShellJobRequest) -> Result<ShellJobResult> {
        let workspace = self.root.join(&request.workspace_id);
        if request.reset_workspace && workspace.exists() {
            tokio::fs::remove_dir_all(&workspace)
                .await
                .map_err(|e| WorkerError::unknown(format!("Failed to reset workspace: {e}")))?;
        }
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| WorkerError::unknown(format!("Failed to create workspace: {e}")))?;

        let max_len = request.max_output_length.unwrap_or(4096);
        let timeout = request.timeout_ms.map(Duration::from_millis);
        let mut outputs = Vec::with_capacity(request.commands.len());

        for command in &request.commands {
            info!(workspace_id = %request.workspace_id, command = %command, "Executing shell command");
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .current_dir(&workspace)
                .envs(request.env.iter());

            let spawned = cmd.output();
            let result = match timeout {
                Some(t) => match tokio::time::timeout(t, spawned).await {
                    Ok(result) => result,
                    Err(_) => {
                        outputs.push(ShellCommandOutput {
                            stdout: String::new(),
                            stderr: format!("Command timed out after {}ms", t.as_millis()),
                            outcome: ShellOutcome::Timeout,
                        });
                        continue;
                    }
                },
                None => spawned.await,
            };

            match result {
                Ok(output) => outputs.push(ShellCommandOutput {
                    stdout: truncate_output(&String::from_utf8_lossy(&output.stdout), max_len),
                    stderr: truncate_output(&String::from_utf8_lossy(&output.stderr), max_len),
                    outcome: ShellOutcome::Exit {
                        exit_code: output.status.code().unwrap_or(-1),
                    },
                }),
                Err(e) => outputs.push(ShellCommandOutput {
                    stdout: String::new(),
                    stderr: e.to_string(),
                    outcome: ShellOutcome::Error { message: e.to_string() },
                }),
            }
        }

        Ok(ShellJobResult {
            output: outputs,
            max_output_length: Some(max_len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_id_is_deterministic_and_safe() {
        let a = derive_workspace_id("t1", "j1", 0);
        let b = derive_workspace_id("t1", "j1", 0);
        let c = derive_workspace_id("t1", "j1", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("w_"));
        assert_eq!(a.len(), 34);
        assert!(a[2..].chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn truncation_keeps_head_and_marks_cut() {
        let long = "a".repeat(5000);
        let truncated = truncate_output(&long, 4096);
        assert!(truncated.starts_with("aaaa"));
        assert!(truncated.ends_with("[output truncated]"));
        assert_eq!(truncate_output("short", 4096), "short");
    }

    #[tokio::test]
    async fn process_executor_runs_commands_in_workspace() {
        let dir = std::env::temp_dir().join(format!("leadforge-shell-{}", uuid::Uuid::now_v7()));
        let executor = ProcessShellExecutor::new(&dir);
        let result = executor
            .run(&ShellJobRequest {
                commands: vec!["echo hello-worker".to_string()],
                timeout_ms: Some(10_000),
                max_output_length: Some(4096),
                workspace_id: derive_workspace_id("t1", "j1", 0),
                reset_workspace: true,
                env: BTreeMap::new(),
            })
            .await
            .unwrap();

        assert_eq!(result.output.len(), 1);
        assert!(result.output[0].stdout.contains("hello-worker"));
        assert!(matches!(result.output[0].outcome, ShellOutcome::Exit { exit_code: 0 }));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
