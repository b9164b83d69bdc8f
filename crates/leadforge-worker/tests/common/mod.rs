// Shared fixtures: scripted provider fake, in-memory stores, job records
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use leadforge_core::config::{S3UploadConfig, ShellAvailability, ShellLoopConfig, WorkerConfig};
use leadforge_core::records::{Job, Submission, Workflow};
use leadforge_core::Result;
use leadforge_openai::stream::StreamEvent;
use leadforge_openai::types::{Response, ResponseRequest};
use leadforge_openai::ResponsesApi;
use leadforge_storage::{MemoryBlobStore, MemoryRecordStore};
use leadforge_worker::artifacts::ArtifactService;
use leadforge_worker::images::ImagePipeline;
use leadforge_worker::strategies::WorkerServices;

/// Scripted Responses API: pops queued responses in order; when the queue
/// runs dry the last response repeats. A queued value of the form
/// {"__fail__": "message"} produces a classified error instead. Every
/// request is captured.
pub struct FakeApi {
    responses: Mutex<VecDeque<Value>>,
    last: Mutex<Option<Value>>,
    pub requests: Mutex<Vec<ResponseRequest>>,
}

impl FakeApi {
    pub fn new(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> ResponseRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    fn next(&self) -> Result<Response> {
        let value = {
            let mut queue = self.responses.lock().unwrap();
            match queue.pop_front() {
                Some(value) => {
                    *self.last.lock().unwrap() = Some(value.clone());
                    value
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .expect("scripted responses exhausted with no last response"),
            }
        };
        if let Some(message) = value.get("__fail__").and_then(Value::as_str) {
            return Err(leadforge_core::WorkerError::classify_message(message));
        }
        Ok(serde_json::from_value(value).expect("valid scripted response"))
    }
}

#[async_trait]
impl ResponsesApi for FakeApi {
    async fn call(&self, request: &ResponseRequest) -> Result<Response> {
        self.requests.lock().unwrap().push(request.clone());
        self.next()
    }

    async fn stream(
        &self,
        request: &ResponseRequest,
    ) -> Result<leadforge_openai::stream::ResponseStream> {
        self.requests.lock().unwrap().push(request.clone());
        let response = self.next()?;
        let events = vec![
            Ok(StreamEvent::TextDelta(response.text())),
            Ok(StreamEvent::Completed(response)),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

pub fn text_response(id: &str, text: &str, input_tokens: u32, output_tokens: u32) -> Value {
    json!({
        "id": id,
        "output_text": text,
        "output": [],
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens
        }
    })
}

pub struct TestHarness {
    pub api: Arc<FakeApi>,
    pub records: Arc<MemoryRecordStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub services: Arc<WorkerServices>,
}

pub fn harness(api: Arc<FakeApi>) -> TestHarness {
    harness_with(api, None, None)
}

pub fn harness_with(
    api: Arc<FakeApi>,
    shell: Option<Arc<dyn leadforge_worker::shell::ShellExecutor>>,
    browser: Option<Arc<dyn leadforge_worker::browser::BrowserEnvironment>>,
) -> TestHarness {
    let records = Arc::new(MemoryRecordStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let artifacts = Arc::new(ArtifactService::new(records.clone(), blobs.clone()));
    let services = Arc::new(WorkerServices {
        api: api.clone(),
        images_api: None,
        records: records.clone(),
        artifacts,
        pipeline: Arc::new(ImagePipeline::new()),
        secrets: None,
        shell,
        browser,
        config: WorkerConfig {
            shell_availability: ShellAvailability::Enabled,
            shell_loop: ShellLoopConfig::default(),
            s3_upload: S3UploadConfig {
                allowed_buckets: vec!["cc360-pages".to_string()],
                key_prefix: None,
                put_expires_in: Duration::from_secs(1800),
            },
            code_interpreter_memory_limit: None,
        },
    });
    TestHarness { api, records, blobs, services }
}

pub fn seed_job(harness: &TestHarness, workflow: Value, submission: Value) -> Job {
    let workflow: Workflow = serde_json::from_value(workflow).expect("valid workflow");
    let submission: Submission = serde_json::from_value(submission).expect("valid submission");
    let job: Job = serde_json::from_value(json!({
        "job_id": "job-1",
        "tenant_id": "tenant-1",
        "workflow_id": workflow.workflow_id,
        "submission_id": submission.submission_id,
        "status": "pending"
    }))
    .expect("valid job");

    harness.records.insert_workflow(workflow);
    harness.records.insert_submission(submission);
    harness.records.insert_job(&job);
    job
}

