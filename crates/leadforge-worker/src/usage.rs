// Usage recorder
//
// Persists one append-only cost record per provider call.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use leadforge_core::records::{UsageInfo, UsageRecord};
use leadforge_storage::RecordStore;

pub struct UsageRecorder {
    records: Arc<dyn RecordStore>,
}

impl UsageRecorder {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Best-effort persist; a failed usage write never fails the step.
    pub async fn record(&self, tenant_id: &str, job_id: &str, usage: &UsageInfo) {
        let record = UsageRecord {
            usage_id: format!("usage_{}", Uuid::now_v7()),
            tenant_id: tenant_id.to_string(),
            job_id: job_id.to_string(),
            service_type: usage
                .service_type
                .clone()
                .unwrap_or_else(|| "openai_worker_report".to_string()),
            model: usage.model.clone().unwrap_or_default(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: usage.cost_usd,
            created_at: Utc::now(),
        };
        match self.records.put_usage_record(&record).await {
            Ok(()) => {
                debug!(job_id = %job_id, usage_id = %record.usage_id, cost_usd = record.cost_usd, "Stored usage record");
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to store usage record");
            }
        }
    }
}
