// End-to-end job flows against in-memory stores and a scripted provider

mod common;

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{harness, seed_job, text_response, FakeApi};
use leadforge_core::records::{ExecutionStepKind, JobStatus};
use leadforge_storage::{BlobStore, RecordStore};
use leadforge_worker::JobController;

fn single_step_workflow(delivery_url: Option<&str>) -> Value {
    let mut workflow = json!({
        "workflow_id": "wf-1",
        "workflow_name": "Dragon Course",
        "steps": [{
            "step_order": 1,
            "step_name": "Summarize",
            "step_type": "ai_generation",
            "model": "gpt-5",
            "instructions": "Summarize the form as one paragraph.",
            "tools": [],
            "tool_choice": "auto"
        }]
    });
    if let Some(url) = delivery_url {
        workflow["delivery_method"] = json!("webhook");
        workflow["delivery_webhook_url"] = json!(url);
        workflow["delivery_webhook_headers"] = json!({"X-Token": "abc"});
    }
    workflow
}

fn ada_submission() -> Value {
    json!({
        "submission_id": "sub-1",
        "submission_data": {"name": "Ada", "email": "a@b", "topic": "dragons"}
    })
}

#[tokio::test]
async fn single_text_step_with_webhook_delivery() {
    let hook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&hook)
        .await;

    let api = FakeApi::new(vec![text_response(
        "resp-1",
        "Ada wants a course on dragons.",
        50,
        10,
    )]);
    let h = harness(api.clone());
    let hook_url = format!("{}/hook", hook.uri());
    seed_job(&h, single_step_workflow(Some(&hook_url)), ada_submission());

    let controller = JobController::new(h.services.clone());
    let result = controller.process_job("job-1").await;
    assert!(result.success, "job failed: {:?}", result.error);

    // Job is terminal with the final artifact's public URL
    let job = h.records.get_job("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let output_url = job.output_url.clone().unwrap();

    // Exactly one form_submission, one ai_generation, one final_output;
    // sorted by step_order they are strictly increasing
    let kinds: Vec<ExecutionStepKind> =
        job.execution_steps.iter().map(|s| s.step_type).collect();
    assert_eq!(
        kinds,
        vec![
            ExecutionStepKind::FormSubmission,
            ExecutionStepKind::AiGeneration,
            ExecutionStepKind::FinalOutput
        ]
    );
    let orders: Vec<u32> = job.execution_steps.iter().map(|s| s.step_order).collect();
    assert!(orders.windows(2).all(|w| w[0] < w[1]));

    // The final markdown artifact holds the returned text verbatim
    let artifacts = h.records.list_artifacts_by_job("job-1").await.unwrap();
    let final_artifact = artifacts
        .iter()
        .find(|a| a.artifact_name == "final.md")
        .expect("final.md artifact");
    let body = h.blobs.get(&final_artifact.s3_key).await.unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), "Ada wants a course on dragons.");
    assert_eq!(final_artifact.public_url.as_deref(), Some(output_url.as_str()));

    // Webhook payload: lead fields, flattened submission fields, output_url
    let requests = hook.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].headers.get("x-token").map(|v| v.to_str().unwrap()),
        Some("abc")
    );
    let payload: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(payload["lead_name"], "Ada");
    assert_eq!(payload["submission_topic"], "dragons");
    assert_eq!(payload["output_url"], output_url.as_str());
    assert_eq!(payload["status"], "completed");

    // One usage record for the single provider call
    let usage = h.records.usage_records();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].input_tokens, 50);
    assert_eq!(usage[0].output_tokens, 10);
    assert!(usage[0].cost_usd > 0.0);
}

#[tokio::test]
async fn dependent_step_sees_predecessor_output() {
    let api = FakeApi::new(vec![
        text_response("resp-1", "MARKET: demand 7/10", 40, 8),
        text_response("resp-2", "# Report\nGreat demand.", 60, 20),
    ]);
    let h = harness(api.clone());
    seed_job(
        &h,
        json!({
            "workflow_id": "wf-2",
            "steps": [
                {"step_order": 1, "step_name": "Research", "model": "gpt-5",
                 "instructions": "Research", "tools": [], "tool_choice": "auto"},
                {"step_order": 2, "step_name": "Write", "model": "gpt-5",
                 "instructions": "Write markdown report", "tools": [], "tool_choice": "auto",
                 "depends_on": [0]}
            ]
        }),
        ada_submission(),
    );

    let controller = JobController::new(h.services.clone());
    let result = controller.process_job("job-1").await;
    assert!(result.success, "job failed: {:?}", result.error);

    // Step 2's request carries step 1's output in the previous context
    assert_eq!(api.request_count(), 2);
    let second = api.request(1);
    let input = second.input.as_str().unwrap();
    assert!(
        input.contains("=== Step 1: Research ===\nMARKET: demand 7/10"),
        "missing dependency block in: {input}"
    );
    assert!(input.contains("=== Form Submission ==="));

    // Final artifact is the step-2 text
    let job = h.records.get_job("job-1").await.unwrap().unwrap();
    let final_step = job
        .execution_steps
        .iter()
        .find(|s| s.step_type == ExecutionStepKind::FinalOutput)
        .unwrap();
    let artifact_id = final_step.artifact_id.clone().unwrap();
    let artifact = h.records.get_artifact(&artifact_id).await.unwrap().unwrap();
    let body = h.blobs.get(&artifact.s3_key).await.unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), "# Report\nGreat demand.");
}

#[tokio::test]
async fn failed_step_skips_dependents_but_not_independents() {
    // Step 1 fails; step 2 depends on it and is skipped; step 3 declares no
    // dependencies and still runs. The job completes on step 3's output.
    let api = FakeApi::new(vec![
        json!({"__fail__": "Rate limit reached for gpt-5"}),
        text_response("resp-3", "independent result", 10, 5),
    ]);
    let h = harness(api.clone());
    seed_job(
        &h,
        json!({
            "workflow_id": "wf-3",
            "steps": [
                {"step_order": 1, "step_name": "Flaky", "model": "gpt-5",
                 "instructions": "do", "tools": [], "tool_choice": "auto"},
                {"step_order": 2, "step_name": "Dependent", "model": "gpt-5",
                 "instructions": "use step 1", "tools": [], "tool_choice": "auto",
                 "depends_on": [0]},
                {"step_order": 3, "step_name": "Independent", "model": "gpt-5",
                 "instructions": "standalone", "tools": [], "tool_choice": "auto",
                 "depends_on": []}
            ]
        }),
        ada_submission(),
    );

    let controller = JobController::new(h.services.clone());
    let result = controller.process_job("job-1").await;
    assert!(result.success, "job failed: {:?}", result.error);

    let job = h.records.get_job("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let step = |order: u32| {
        job.execution_steps
            .iter()
            .find(|s| s.step_order == order && s.step_type == ExecutionStepKind::AiGeneration)
            .unwrap()
    };
    assert!(!step(1).succeeded());
    assert!(step(1).error.as_deref().unwrap().contains("Rate limit"));
    assert!(!step(2).succeeded());
    assert!(step(2).error.as_deref().unwrap().contains("dependency step 1 failed"));
    assert!(step(3).succeeded());
    assert_eq!(step(3).output_text(), "independent result");

    // Final deliverable comes from the surviving step
    let final_step = job
        .execution_steps
        .iter()
        .find(|s| s.step_type == ExecutionStepKind::FinalOutput)
        .unwrap();
    let artifact = h
        .records
        .get_artifact(final_step.artifact_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    let body = String::from_utf8(h.blobs.get(&artifact.s3_key).await.unwrap()).unwrap();
    assert_eq!(body, "independent result");
}

#[tokio::test]
async fn rerun_replaces_step_in_place() {
    let api = FakeApi::new(vec![
        text_response("resp-1", "step one", 10, 5),
        text_response("resp-2", "A", 10, 5),
        text_response("resp-3", "B", 10, 5),
    ]);
    let h = harness(api.clone());
    seed_job(
        &h,
        json!({
            "workflow_id": "wf-4",
            "steps": [
                {"step_order": 1, "step_name": "First", "model": "gpt-5",
                 "instructions": "one", "tools": [], "tool_choice": "auto"},
                {"step_order": 2, "step_name": "Second", "model": "gpt-5",
                 "instructions": "two", "tools": [], "tool_choice": "auto"}
            ]
        }),
        ada_submission(),
    );

    let controller = JobController::new(h.services.clone());
    let r0 = controller.process_single_step("job-1", 0, "workflow_step").await;
    assert!(r0.success, "{:?}", r0.error);
    let r1 = controller.process_single_step("job-1", 1, "workflow_step").await;
    assert!(r1.success, "{:?}", r1.error);

    let before = h.records.get_job("job-1").await.unwrap().unwrap();
    let len_before = before.execution_steps.len();
    let first_output = before
        .execution_steps
        .iter()
        .find(|s| s.step_order == 2 && s.step_type == ExecutionStepKind::AiGeneration)
        .unwrap()
        .output_text()
        .to_string();
    assert_eq!(first_output, "A");

    // Rerun step 2: list length unchanged, only that entry's output changes
    let r1b = controller.process_single_step("job-1", 1, "workflow_step").await;
    assert!(r1b.success, "{:?}", r1b.error);

    let after = h.records.get_job("job-1").await.unwrap().unwrap();
    assert_eq!(after.execution_steps.len(), len_before);
    let rerun_output = after
        .execution_steps
        .iter()
        .find(|s| s.step_order == 2 && s.step_type == ExecutionStepKind::AiGeneration)
        .unwrap()
        .output_text()
        .to_string();
    assert_eq!(rerun_output, "B");
    let step_one = after
        .execution_steps
        .iter()
        .find(|s| s.step_order == 1 && s.step_type == ExecutionStepKind::AiGeneration)
        .unwrap();
    assert_eq!(step_one.output_text(), "step one");
}

#[tokio::test]
async fn published_template_triggers_html_assembly() {
    let api = FakeApi::new(vec![
        text_response("resp-1", "# Markdown research", 10, 5),
        text_response("resp-2", "```html\n<html><body>Styled</body></html>\n```", 30, 40),
    ]);
    let h = harness(api.clone());
    seed_job(
        &h,
        json!({
            "workflow_id": "wf-5",
            "template_id": "tpl-1",
            "steps": [{
                "step_order": 1, "step_name": "Research", "model": "gpt-5",
                "instructions": "research", "tools": [], "tool_choice": "auto"
            }]
        }),
        ada_submission(),
    );
    h.records.insert_template(
        serde_json::from_value(json!({
            "template_id": "tpl-1",
            "html_content": "<html><body>{TEMPLATE}</body></html>",
            "style_description": "dark and modern",
            "is_published": true
        }))
        .unwrap(),
    );

    let controller = JobController::new(h.services.clone());
    let result = controller.process_job("job-1").await;
    assert!(result.success, "job failed: {:?}", result.error);

    // Fences stripped; html_final artifact produced
    let artifacts = h.records.list_artifacts_by_job("job-1").await.unwrap();
    let final_artifact = artifacts.iter().find(|a| a.artifact_name == "final.html").unwrap();
    let body = String::from_utf8(h.blobs.get(&final_artifact.s3_key).await.unwrap()).unwrap();
    assert_eq!(body, "<html><body>Styled</body></html>");

    // The html_generation execution step is recorded
    let job = h.records.get_job("job-1").await.unwrap().unwrap();
    assert!(job
        .execution_steps
        .iter()
        .any(|s| s.step_type == ExecutionStepKind::HtmlGeneration));

    // Usage was recorded for both calls
    assert_eq!(h.records.usage_records().len(), 2);
}
