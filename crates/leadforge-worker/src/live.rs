// Throttled live-step preview writer
//
// The preview is a best-effort, last-writer-wins projection on the job
// record. Persists at most once per 500 ms or 512 new bytes, and always on
// status transitions. Output is capped to the last 100 000 chars with a
// truncated flag. Persistence failures are logged, never surfaced.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use leadforge_core::records::{LiveStep, LiveStepStatus};
use leadforge_storage::RecordStore;

const MAX_LIVE_CHARS: usize = 100_000;
const MIN_PERSIST_INTERVAL_MS: u128 = 500;
const MIN_PERSIST_DELTA_BYTES: usize = 512;

pub struct LiveStepWriter {
    records: Arc<dyn RecordStore>,
    job_id: String,
    step_order: u32,
    output: String,
    truncated: bool,
    error: Option<String>,
    last_persist: Instant,
    persisted_len: usize,
}

impl LiveStepWriter {
    pub fn new(records: Arc<dyn RecordStore>, job_id: impl Into<String>, step_order: u32) -> Self {
        Self {
            records,
            job_id: job_id.into(),
            step_order,
            output: String::new(),
            truncated: false,
            error: None,
            last_persist: Instant::now(),
            persisted_len: 0,
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Append preview text; persists when the throttle window allows
    pub async fn append(&mut self, message: &str) {
        self.push(message);
        self.persist(LiveStepStatus::Streaming, false).await;
    }

    /// Record an error note; persisted immediately
    pub async fn error(&mut self, message: &str, error: impl Into<String>) {
        self.push(message);
        self.error = Some(error.into());
        self.persist(LiveStepStatus::Error, true).await;
    }

    /// Status transition; always persisted
    pub async fn transition(&mut self, status: LiveStepStatus) {
        self.persist(status, true).await;
    }

    /// Terminal persist; an error seen earlier wins over `final`
    pub async fn finish(&mut self, message: &str) {
        self.push(message);
        self.persist(LiveStepStatus::Final, true).await;
    }

    fn push(&mut self, message: &str) {
        if message.is_empty() {
            return;
        }
        self.output.push_str(message);
        if self.output.len() > MAX_LIVE_CHARS {
            // Keep the tail, on a char boundary
            let mut start = self.output.len() - MAX_LIVE_CHARS;
            while !self.output.is_char_boundary(start) {
                start += 1;
            }
            self.output.drain(..start);
            self.truncated = true;
        }
    }

    async fn persist(&mut self, status: LiveStepStatus, force: bool) {
        if !force
            && self.last_persist.elapsed().as_millis() < MIN_PERSIST_INTERVAL_MS
            && self.output.len().saturating_sub(self.persisted_len) < MIN_PERSIST_DELTA_BYTES
        {
            return;
        }
        self.last_persist = Instant::now();
        self.persisted_len = self.output.len();

        let status = if self.error.is_some() && status == LiveStepStatus::Final {
            LiveStepStatus::Error
        } else {
            status
        };
        let live = LiveStep {
            step_order: self.step_order,
            output_text: self.output.clone(),
            status,
            truncated: self.truncated,
            error: self.error.clone(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self
            .records
            .update_job(&self.job_id, json!({ "live_step": live }))
            .await
        {
            debug!(job_id = %self.job_id, error = %e, "Failed to persist live step");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadforge_core::records::Job;
    use leadforge_storage::MemoryRecordStore;
    use serde_json::json as j;

    fn store_with_job() -> Arc<MemoryRecordStore> {
        let store = Arc::new(MemoryRecordStore::new());
        let job: Job = serde_json::from_value(j!({
            "job_id": "j1",
            "tenant_id": "t1",
            "workflow_id": "w1",
            "submission_id": "s1",
            "status": "processing"
        }))
        .unwrap();
        store.insert_job(&job);
        store
    }

    #[tokio::test]
    async fn transitions_always_persist() {
        let store = store_with_job();
        let mut writer = LiveStepWriter::new(store.clone(), "j1", 1);
        writer.append("$ ls -la\n").await;
        writer.finish("\ndone\n").await;

        let job = store.get_job("j1").await.unwrap().unwrap();
        let live = job.live_step.unwrap();
        assert!(live.output_text.contains("$ ls -la"));
        assert_eq!(live.status, LiveStepStatus::Final);
        assert!(!live.truncated);
    }

    #[tokio::test]
    async fn long_output_keeps_tail_and_sets_truncated() {
        let store = store_with_job();
        let mut writer = LiveStepWriter::new(store.clone(), "j1", 2);
        let chunk = "x".repeat(60_000);
        writer.append(&chunk).await;
        writer.append(&chunk).await;
        writer.finish("TAIL").await;

        let live = store.get_job("j1").await.unwrap().unwrap().live_step.unwrap();
        assert!(live.truncated);
        assert_eq!(live.output_text.len(), 100_000);
        assert!(live.output_text.ends_with("TAIL"));
    }

    #[tokio::test]
    async fn error_status_wins_over_final() {
        let store = store_with_job();
        let mut writer = LiveStepWriter::new(store.clone(), "j1", 1);
        writer.error("\nShell loop timed out.\n", "Shell loop timed out").await;
        writer.finish("\nShell execution complete.\n").await;

        let live = store.get_job("j1").await.unwrap().unwrap().live_step.unwrap();
        assert_eq!(live.status, LiveStepStatus::Error);
        assert_eq!(live.error.as_deref(), Some("Shell loop timed out"));
    }
}
