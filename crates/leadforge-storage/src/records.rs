// Record store trait
//
// Typed CRUD over the records the worker reads and writes. Jobs are the only
// mutable record; updates are shallow field merges with last-writer-wins
// semantics. Everything else a job references is read-only to the worker.

use async_trait::async_trait;
use serde_json::Value;

use leadforge_core::records::{
    Artifact, Form, Job, Notification, Submission, Template, UsageRecord, Workflow,
};
use leadforge_core::Result;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Merge the given top-level fields into the job record. Fields absent
    /// from the patch are left untouched; the last writer wins per field.
    async fn update_job(&self, job_id: &str, patch: Value) -> Result<()>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>>;

    async fn get_submission(&self, submission_id: &str) -> Result<Option<Submission>>;

    async fn get_form(&self, form_id: &str) -> Result<Option<Form>>;

    async fn get_template(&self, template_id: &str, version: Option<u32>) -> Result<Option<Template>>;

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>>;

    async fn put_artifact(&self, artifact: &Artifact) -> Result<()>;

    async fn list_artifacts_by_job(&self, job_id: &str) -> Result<Vec<Artifact>>;

    async fn put_usage_record(&self, record: &UsageRecord) -> Result<()>;

    async fn put_notification(&self, notification: &Notification) -> Result<()>;
}
