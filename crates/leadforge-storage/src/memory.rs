// In-memory record store for tests and local development

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use leadforge_core::records::{
    Artifact, Form, Job, Notification, Submission, Template, UsageRecord, Workflow,
};
use leadforge_core::{Result, WorkerError};

use crate::records::RecordStore;

#[derive(Default)]
pub struct MemoryRecordStore {
    jobs: Mutex<HashMap<String, Value>>,
    workflows: Mutex<HashMap<String, Workflow>>,
    submissions: Mutex<HashMap<String, Submission>>,
    forms: Mutex<HashMap<String, Form>>,
    templates: Mutex<HashMap<String, Template>>,
    artifacts: Mutex<HashMap<String, Artifact>>,
    usage_records: Mutex<Vec<UsageRecord>>,
    notifications: Mutex<Vec<Notification>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: &Job) {
        let doc = serde_json::to_value(job).expect("job serializes");
        self.jobs.lock().unwrap().insert(job.job_id.clone(), doc);
    }

    pub fn insert_workflow(&self, workflow: Workflow) {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.workflow_id.clone(), workflow);
    }

    pub fn insert_submission(&self, submission: Submission) {
        self.submissions
            .lock()
            .unwrap()
            .insert(submission.submission_id.clone(), submission);
    }

    pub fn insert_form(&self, form: Form) {
        self.forms.lock().unwrap().insert(form.form_id.clone(), form);
    }

    pub fn insert_template(&self, template: Template) {
        self.templates
            .lock()
            .unwrap()
            .insert(template.template_id.clone(), template);
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage_records.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().unwrap();
        match jobs.get(job_id) {
            Some(doc) => {
                let job = serde_json::from_value(doc.clone())
                    .map_err(|e| WorkerError::storage(format!("Corrupt job record {job_id}: {e}")))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn update_job(&self, job_id: &str, patch: Value) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let doc = jobs
            .get_mut(job_id)
            .ok_or_else(|| WorkerError::storage(format!("Job {job_id} not found for update")))?;
        if let (Value::Object(target), Value::Object(fields)) = (doc, patch) {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        Ok(self.workflows.lock().unwrap().get(workflow_id).cloned())
    }

    async fn get_submission(&self, submission_id: &str) -> Result<Option<Submission>> {
        Ok(self.submissions.lock().unwrap().get(submission_id).cloned())
    }

    async fn get_form(&self, form_id: &str) -> Result<Option<Form>> {
        Ok(self.forms.lock().unwrap().get(form_id).cloned())
    }

    async fn get_template(
        &self,
        template_id: &str,
        _version: Option<u32>,
    ) -> Result<Option<Template>> {
        Ok(self.templates.lock().unwrap().get(template_id).cloned())
    }

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>> {
        Ok(self.artifacts.lock().unwrap().get(artifact_id).cloned())
    }

    async fn put_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.artifacts
            .lock()
            .unwrap()
            .insert(artifact.artifact_id.clone(), artifact.clone());
        Ok(())
    }

    async fn list_artifacts_by_job(&self, job_id: &str) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .artifacts
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect();
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    async fn put_usage_record(&self, record: &UsageRecord) -> Result<()> {
        self.usage_records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn put_notification(&self, notification: &Notification) -> Result<()> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadforge_core::records::JobStatus;
    use serde_json::json;

    fn job(id: &str) -> Job {
        serde_json::from_value(json!({
            "job_id": id,
            "tenant_id": "t1",
            "workflow_id": "w1",
            "submission_id": "s1",
            "status": "pending"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn update_job_merges_fields() {
        let store = MemoryRecordStore::new();
        store.insert_job(&job("j1"));

        store
            .update_job("j1", json!({"status": "processing", "output_url": "https://x"}))
            .await
            .unwrap();

        let loaded = store.get_job("j1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);
        assert_eq!(loaded.output_url.as_deref(), Some("https://x"));
        // Untouched fields survive the merge
        assert_eq!(loaded.tenant_id, "t1");
    }

    #[tokio::test]
    async fn update_missing_job_errors() {
        let store = MemoryRecordStore::new();
        let err = store.update_job("nope", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
