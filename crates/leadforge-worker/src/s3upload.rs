// Delegated S3-upload convention for shell steps
//
// When a shell step's instructions ask to upload a previous artifact to a
// bucket, the executor injects a structured context block with a presigned
// PUT URL and a worked example, so the model can complete the upload with
// plain curl. Buckets must be allow-listed; keys are sanitized.

use regex::Regex;
use tracing::info;

use leadforge_core::config::S3UploadConfig;
use leadforge_core::records::Artifact;
use leadforge_core::{Result, WorkerError};
use leadforge_storage::BlobStore;

#[derive(Debug, Clone, PartialEq)]
pub struct S3UploadTarget {
    pub bucket: String,
    pub region: String,
}

/// Best-effort parse of an upload request from step instructions.
///
/// Recognized phrasings: "upload ... to s3://bucket in us-west-2",
/// "upload this file to aws s3 bucket cc360-pages in us west 2".
pub fn parse_upload_target(instructions: &str, default_region: &str) -> Option<S3UploadTarget> {
    let lower = instructions.to_lowercase();
    if !lower.contains("upload") || !lower.contains("s3") {
        return None;
    }

    let bucket = Regex::new(r"s3://([a-z0-9][a-z0-9.-]{1,61}[a-z0-9])")
        .ok()?
        .captures(&lower)
        .map(|c| c[1].to_string())
        .or_else(|| {
            Regex::new(r"\bbucket\s+([a-z0-9][a-z0-9.-]{1,61}[a-z0-9])\b")
                .ok()?
                .captures(&lower)
                .map(|c| c[1].to_string())
        })?;

    let region = Regex::new(r"\b([a-z]{2}-[a-z0-9-]+-\d)\b")
        .ok()?
        .captures(&lower)
        .map(|c| c[1].to_string())
        .or_else(|| {
            Regex::new(r"\b(us)\s+(east|west)\s+(\d)\b")
                .ok()?
                .captures(&lower)
                .map(|c| format!("{}-{}-{}", &c[1], &c[2], &c[3]))
        })
        .unwrap_or_else(|| default_region.to_string());

    Some(S3UploadTarget { bucket, region })
}

/// Keep filenames safe for S3 keys and shell interpolation
pub fn sanitize_key_filename(filename: &str) -> String {
    let safe: String = filename
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = safe.trim_matches('_').to_string();
    if safe.is_empty() {
        "artifact.bin".to_string()
    } else {
        safe
    }
}

fn key_prefix(config: &S3UploadConfig, tenant_id: &str, job_id: &str) -> Result<String> {
    let mut prefix = config
        .key_prefix
        .clone()
        .unwrap_or_else(|| format!("leadmagnet/{tenant_id}/{job_id}/"));
    prefix = prefix.trim_start_matches('/').to_string();
    if prefix.contains("..") {
        return Err(WorkerError::validation(
            "Invalid S3 upload key prefix (must not contain '..')",
        ));
    }
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    Ok(prefix)
}

/// Build the context block for a parsed upload target, or error when the
/// bucket is not allow-listed.
pub async fn build_upload_context(
    blobs: &dyn BlobStore,
    config: &S3UploadConfig,
    target: &S3UploadTarget,
    artifact: &Artifact,
    source_url: &str,
    tenant_id: &str,
    job_id: &str,
) -> Result<String> {
    if !config.allowed_buckets.iter().any(|b| b == &target.bucket) {
        return Err(WorkerError::validation(format!(
            "S3 upload bucket '{}' is not allowed. Set SHELL_S3_UPLOAD_ALLOWED_BUCKETS to include it.",
            target.bucket
        )));
    }

    let filename = sanitize_key_filename(&artifact.artifact_name);
    let prefix = key_prefix(config, tenant_id, job_id)?;
    // Prefix the artifact id so same-named artifacts never overwrite
    let dest_key = format!("{prefix}{}-{filename}", artifact.artifact_id);
    let content_type = artifact.mime_type.as_str();

    let put_url = blobs
        .presigned_put(
            &target.bucket,
            &dest_key,
            content_type,
            config.put_expires_in.as_secs(),
        )
        .await?;
    let object_url = format!(
        "https://{}.s3.{}.amazonaws.com/{}",
        target.bucket, target.region, dest_key
    );

    info!(
        job_id = %job_id,
        dest_bucket = %target.bucket,
        dest_region = %target.region,
        source_artifact_id = %artifact.artifact_id,
        "Injected S3 upload context"
    );

    Ok([
        "=== S3 Upload (Shell Tool) ===".to_string(),
        "Upload the SOURCE file to the DEST bucket using the presigned PUT URL.".to_string(),
        String::new(),
        format!("SOURCE_ARTIFACT_ID: {}", artifact.artifact_id),
        format!("SOURCE_ARTIFACT_URL: {source_url}"),
        String::new(),
        format!("DEST_BUCKET: {}", target.bucket),
        format!("DEST_REGION: {}", target.region),
        format!("DEST_KEY: {dest_key}"),
        format!("DEST_CONTENT_TYPE: {content_type}"),
        format!("DEST_PUT_URL: {put_url}"),
        format!("DEST_OBJECT_URL: {object_url}"),
        String::new(),
        "Execute this as shell commands (replace the <> placeholders with the values above):".to_string(),
        "  set -euo pipefail".to_string(),
        "  LOCAL_FILE=\"source_file\"".to_string(),
        "  curl -fsSL \"<SOURCE_ARTIFACT_URL>\" -o \"$LOCAL_FILE\"".to_string(),
        "  curl -fsS -X PUT -H \"Content-Type: <DEST_CONTENT_TYPE>\" --upload-file \"$LOCAL_FILE\" \"<DEST_PUT_URL>\"".to_string(),
        String::new(),
        "Then respond with EXACTLY ONE LINE of JSON (no extra text):".to_string(),
        format!(
            "{{\"bucket\":\"{}\",\"region\":\"{}\",\"key\":\"{}\",\"content_type\":\"{}\",\"s3_uri\":\"s3://{}/{}\",\"object_url\":\"{}\"}}",
            target.bucket, target.region, dest_key, content_type, target.bucket, dest_key, object_url
        ),
    ]
    .join("\n"))
}
