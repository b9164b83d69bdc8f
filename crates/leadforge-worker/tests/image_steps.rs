// Image-generation step feeding a multimodal text step

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{seed_job, text_response, FakeApi, TestHarness};
use leadforge_core::config::{S3UploadConfig, ShellAvailability, ShellLoopConfig, WorkerConfig};
use leadforge_core::records::{ExecutionStepKind, JobStatus};
use leadforge_openai::images_api::ImagesClient;
use leadforge_storage::{MemoryBlobStore, MemoryRecordStore, RecordStore};
use leadforge_worker::artifacts::ArtifactService;
use leadforge_worker::images::ImagePipeline;
use leadforge_worker::strategies::WorkerServices;
use leadforge_worker::JobController;

fn tiny_png() -> Vec<u8> {
    use image::{DynamicImage, ImageFormat, RgbImage};
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30])));
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png).unwrap();
    out
}

fn image_harness(api: Arc<FakeApi>, images_api: ImagesClient) -> TestHarness {
    let records = Arc::new(MemoryRecordStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let artifacts = Arc::new(ArtifactService::new(records.clone(), blobs.clone()));
    let services = Arc::new(WorkerServices {
        api: api.clone(),
        images_api: Some(images_api),
        records: records.clone(),
        artifacts,
        pipeline: Arc::new(ImagePipeline::new()),
        secrets: None,
        shell: None,
        browser: None,
        config: WorkerConfig {
            shell_availability: ShellAvailability::Disabled,
            shell_loop: ShellLoopConfig::default(),
            s3_upload: S3UploadConfig {
                allowed_buckets: Vec::new(),
                key_prefix: None,
                put_expires_in: Duration::from_secs(1800),
            },
            code_interpreter_memory_limit: None,
        },
    });
    TestHarness { api, records, blobs, services }
}

#[tokio::test]
async fn generated_images_flow_into_the_next_step_as_multimodal_input() {
    // The Images API returns two URLs; both are served so the worker can
    // mirror them into image artifacts
    let assets = MockServer::start().await;
    for name in ["gen-1.png", "gen-2.png"] {
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(tiny_png())
                    .insert_header("Content-Type", "image/png"),
            )
            .mount(&assets)
            .await;
    }
    let img1 = format!("{}/gen-1.png", assets.uri());
    let img2 = format!("{}/gen-2.png", assets.uri());

    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"url": img1}, {"url": img2}],
            "usage": {"input_tokens": 15, "output_tokens": 0, "total_tokens": 15}
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let api = FakeApi::new(vec![text_response("resp-2", "Analysis complete.", 80, 12)]);
    let h = image_harness(api.clone(), ImagesClient::with_base_url("k", provider.uri()));
    seed_job(
        &h,
        json!({
            "workflow_id": "wf-img",
            "steps": [
                {"step_order": 1, "step_name": "Make Art", "model": "gpt-5",
                 "instructions": "Generate two hero images",
                 "tools": [{"type": "image_generation", "model": "gpt-image-1.5", "n": 2}],
                 "tool_choice": "auto"},
                {"step_order": 2, "step_name": "Describe", "model": "gpt-5",
                 "instructions": "Describe the generated art",
                 "tools": [{"type": "image_generation", "model": "dall-e-3"}],
                 "tool_choice": "auto"}
            ]
        }),
        json!({"submission_id": "sub-1", "submission_data": {"name": "Ada"}}),
    );

    let controller = JobController::new(h.services.clone());
    let result = controller.process_job("job-1").await;
    assert!(result.success, "job failed: {:?}", result.error);

    let job = h.records.get_job("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // Step 1 recorded both image URLs
    let art_step = job
        .execution_steps
        .iter()
        .find(|s| s.step_order == 1 && s.step_type == ExecutionStepKind::AiGeneration)
        .unwrap();
    assert_eq!(art_step.image_urls.len(), 2);
    assert!(art_step.output_text().contains("Generated 2 image(s)"));

    // Step 2's request is multimodal with exactly the two deduplicated URLs
    assert_eq!(api.request_count(), 1);
    let describe = api.request(0);
    let input_images = describe.input_image_urls();
    assert_eq!(input_images, vec![img1.clone(), img2.clone()]);

    // Both generated images are stored as image artifacts on the job
    let artifacts = h.records.list_artifacts_by_job("job-1").await.unwrap();
    let image_artifacts: Vec<_> = artifacts.iter().filter(|a| a.is_image()).collect();
    assert_eq!(image_artifacts.len(), 2);
    for artifact in &image_artifacts {
        assert!(job.artifacts.contains(&artifact.artifact_id));
        assert!(artifact.public_url.is_some());
    }
}
