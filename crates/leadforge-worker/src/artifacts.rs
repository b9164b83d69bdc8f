// Artifact service
//
// Writes step/final content into the blob store, mints the artifact record,
// and returns the id plus public URL. Blob keys are UUID v7 so writers never
// collide.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use leadforge_core::records::{Artifact, ArtifactKind};
use leadforge_core::Result;
use leadforge_storage::{BlobStore, RecordStore};

pub struct ArtifactService {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub artifact_id: String,
    pub public_url: String,
}

impl ArtifactService {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { records, blobs }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Store text content (step outputs, final deliverables)
    pub async fn store_text(
        &self,
        tenant_id: &str,
        job_id: &str,
        kind: ArtifactKind,
        content: &str,
        filename: &str,
        public: bool,
    ) -> Result<StoredArtifact> {
        let mime_type = if filename.ends_with(".html") {
            "text/html"
        } else {
            "text/markdown"
        };
        self.store_bytes(
            tenant_id,
            job_id,
            kind,
            content.as_bytes().to_vec(),
            filename,
            mime_type,
            public,
        )
        .await
    }

    /// Store raw bytes (images, screenshots)
    pub async fn store_bytes(
        &self,
        tenant_id: &str,
        job_id: &str,
        kind: ArtifactKind,
        bytes: Vec<u8>,
        filename: &str,
        mime_type: &str,
        public: bool,
    ) -> Result<StoredArtifact> {
        let artifact_id = Uuid::now_v7().to_string();
        let key = format!("artifacts/{tenant_id}/{job_id}/{artifact_id}/{filename}");
        let size = bytes.len() as u64;
        let public_url = self.blobs.put(&key, bytes, mime_type, public).await?;

        let artifact = Artifact {
            artifact_id: artifact_id.clone(),
            tenant_id: tenant_id.to_string(),
            job_id: job_id.to_string(),
            artifact_type: kind,
            artifact_name: filename.to_string(),
            s3_key: key,
            public_url: Some(public_url.clone()),
            file_size_bytes: Some(size),
            mime_type: mime_type.to_string(),
            created_at: Utc::now(),
        };
        self.records.put_artifact(&artifact).await?;

        info!(
            job_id = %job_id,
            artifact_id = %artifact_id,
            artifact_name = %filename,
            size_bytes = size,
            "Stored artifact"
        );
        Ok(StoredArtifact { artifact_id, public_url })
    }

    /// Store an image that already lives at a URL by reference, or raw bytes
    /// fetched from the provider.
    pub async fn store_image_bytes(
        &self,
        tenant_id: &str,
        job_id: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<StoredArtifact> {
        let ext = match mime_type {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            _ => "png",
        };
        let filename = format!("{}.{ext}", Uuid::now_v7());
        self.store_bytes(
            tenant_id,
            job_id,
            ArtifactKind::Image,
            bytes,
            &filename,
            mime_type,
            true,
        )
        .await
    }

    pub async fn public_url(&self, artifact_id: &str) -> Result<Option<String>> {
        let artifact = self.records.get_artifact(artifact_id).await?;
        Ok(artifact.map(|a| {
            a.public_url
                .unwrap_or_else(|| self.blobs.public_url(&a.s3_key))
        }))
    }
}

/// Filename for a step-output artifact: `step_<order>_<name_snake>.md`
pub fn step_output_filename(step_order: u32, step_name: &str) -> String {
    let snake = step_name.to_lowercase().replace(' ', "_");
    format!("step_{step_order}_{snake}.md")
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadforge_storage::{MemoryBlobStore, MemoryRecordStore};

    #[tokio::test]
    async fn store_text_mints_record_and_url() {
        let records = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let service = ArtifactService::new(records.clone(), blobs);

        let stored = service
            .store_text("t1", "j1", ArtifactKind::StepOutput, "# report", "step_1_research.md", false)
            .await
            .unwrap();

        let artifact = records.get_artifact(&stored.artifact_id).await.unwrap().unwrap();
        assert_eq!(artifact.artifact_name, "step_1_research.md");
        assert_eq!(artifact.mime_type, "text/markdown");
        assert_eq!(artifact.file_size_bytes, Some(8));
        assert_eq!(artifact.public_url.as_deref(), Some(stored.public_url.as_str()));

        let listed = records.list_artifacts_by_job("j1").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn step_output_filenames() {
        assert_eq!(step_output_filename(2, "Market Research"), "step_2_market_research.md");
    }
}
