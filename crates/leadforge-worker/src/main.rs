use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leadforge_core::config::WorkerConfig;
use leadforge_openai::images_api::ImagesClient;
use leadforge_openai::ResponsesClient;
use leadforge_storage::{EnvSecretProvider, MemoryBlobStore, PostgresRecordStore};
use leadforge_worker::artifacts::ArtifactService;
use leadforge_worker::images::ImagePipeline;
use leadforge_worker::shell::ProcessShellExecutor;
use leadforge_worker::strategies::WorkerServices;
use leadforge_worker::JobController;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leadforge_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("leadforge-worker starting...");

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str);

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let records = Arc::new(PostgresRecordStore::from_url(&database_url).await?);
    records.migrate().await?;
    tracing::info!("Record store connection established");

    let config = WorkerConfig::from_env();
    let pipeline = Arc::new(ImagePipeline::new());
    let api_key =
        std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable required")?;
    let api = Arc::new(
        ResponsesClient::new(api_key.clone()).with_rescuer(pipeline.clone()),
    );
    // Object store binding is deployment-specific; the in-memory store backs
    // local runs
    let blobs = Arc::new(MemoryBlobStore::new());
    let artifacts = Arc::new(ArtifactService::new(records.clone(), blobs.clone()));

    // Shell runs in-process only for local development; production points
    // at the sandboxed executor service
    let is_local = std::env::var("IS_LOCAL")
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let shell = if is_local {
        Some(Arc::new(ProcessShellExecutor::new(std::env::temp_dir().join("leadforge-shell")))
            as Arc<dyn leadforge_worker::shell::ShellExecutor>)
    } else {
        None
    };

    let services = Arc::new(WorkerServices {
        api,
        images_api: Some(ImagesClient::new(api_key)),
        records,
        artifacts,
        pipeline,
        secrets: Some(Arc::new(EnvSecretProvider)),
        shell,
        browser: None,
        config,
    });
    let controller = JobController::new(services);

    match mode {
        Some("process-job") => {
            let job_id = args.get(2).context("usage: leadforge-worker process-job <job_id>")?;
            let result = controller.process_job(job_id).await;
            if !result.success {
                bail!("Job {} failed: {}", job_id, result.error.unwrap_or_default());
            }
            tracing::info!(job_id = %job_id, output_url = ?result.output_url, "Job completed");
        }
        Some("process-step") => {
            let job_id = args
                .get(2)
                .context("usage: leadforge-worker process-step <job_id> <step_index> [step_kind]")?;
            let step_index: usize = args
                .get(3)
                .context("usage: leadforge-worker process-step <job_id> <step_index> [step_kind]")?
                .parse()
                .context("step_index must be an integer")?;
            let step_kind = args.get(4).map(String::as_str).unwrap_or("workflow_step");
            let result = controller.process_single_step(job_id, step_index, step_kind).await;
            if !result.success {
                bail!(
                    "Step {} of job {} failed: {}",
                    step_index,
                    job_id,
                    result.error.unwrap_or_default()
                );
            }
            tracing::info!(
                job_id = %job_id,
                step_index,
                artifact_id = ?result.artifact_id,
                "Step completed"
            );
        }
        _ => {
            bail!("usage: leadforge-worker <process-job <job_id> | process-step <job_id> <step_index> [step_kind]>");
        }
    }

    Ok(())
}
