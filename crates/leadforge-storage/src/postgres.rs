// Postgres record store
//
// Each record type lives in its own table as a JSONB document keyed by id.
// Job updates merge the patch into the document with the `||` operator, which
// gives shallow last-writer-wins per top-level field. Template versions are
// part of the key so workflows can pin a version.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;

use leadforge_core::records::{
    Artifact, Form, Job, Notification, Submission, Template, UsageRecord, Workflow,
};
use leadforge_core::{Result, WorkerError};

use crate::records::RecordStore;

#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| WorkerError::storage(format!("Failed to connect to Postgres: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the document tables if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        const TABLES: &[&str] = &[
            "jobs",
            "workflows",
            "submissions",
            "forms",
            "templates",
            "artifacts",
            "usage_records",
            "notifications",
        ];
        for table in TABLES {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    doc JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
            ))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        }
        // Artifact listing is by job; index the foreign key inside the doc
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS artifacts_job_id_idx ON artifacts ((doc->>'job_id'))",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn fetch_doc<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>> {
        let row: Option<(Value,)> =
            sqlx::query_as(&format!("SELECT doc FROM {table} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        match row {
            Some((doc,)) => {
                let record = serde_json::from_value(doc)
                    .map_err(|e| WorkerError::storage(format!("Corrupt {table} record {id}: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put_doc<T: Serialize>(&self, table: &str, id: &str, record: &T) -> Result<()> {
        let doc = serde_json::to_value(record)
            .map_err(|e| WorkerError::storage(format!("Failed to serialize {table} record: {e}")))?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, doc, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc, updated_at = NOW()
            "#
        ))
        .bind(id)
        .bind(doc)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> WorkerError {
    WorkerError::storage(format!("Record store error: {e}"))
}

fn template_key(template_id: &str, version: Option<u32>) -> String {
    match version {
        Some(v) if v > 0 => format!("{template_id}@{v}"),
        _ => template_id.to_string(),
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.fetch_doc("jobs", job_id).await
    }

    async fn update_job(&self, job_id: &str, patch: Value) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET doc = doc || $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(&patch)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(WorkerError::storage(format!(
                "Job {job_id} not found for update"
            )));
        }
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        self.fetch_doc("workflows", workflow_id).await
    }

    async fn get_submission(&self, submission_id: &str) -> Result<Option<Submission>> {
        self.fetch_doc("submissions", submission_id).await
    }

    async fn get_form(&self, form_id: &str) -> Result<Option<Form>> {
        self.fetch_doc("forms", form_id).await
    }

    async fn get_template(
        &self,
        template_id: &str,
        version: Option<u32>,
    ) -> Result<Option<Template>> {
        // Fall back to the unversioned key when the pinned version is absent
        if let Some(template) = self
            .fetch_doc("templates", &template_key(template_id, version))
            .await?
        {
            return Ok(Some(template));
        }
        if version.is_some() {
            return self.fetch_doc("templates", template_id).await;
        }
        Ok(None)
    }

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>> {
        self.fetch_doc("artifacts", artifact_id).await
    }

    async fn put_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.put_doc("artifacts", &artifact.artifact_id, artifact).await
    }

    async fn list_artifacts_by_job(&self, job_id: &str) -> Result<Vec<Artifact>> {
        let rows: Vec<(Value,)> = sqlx::query_as(
            r#"
            SELECT doc FROM artifacts
            WHERE doc->>'job_id' = $1
            ORDER BY doc->>'created_at'
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut artifacts = Vec::with_capacity(rows.len());
        for (doc,) in rows {
            match serde_json::from_value::<Artifact>(doc) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Skipping corrupt artifact record");
                }
            }
        }
        Ok(artifacts)
    }

    async fn put_usage_record(&self, record: &UsageRecord) -> Result<()> {
        self.put_doc("usage_records", &record.usage_id, record).await
    }

    async fn put_notification(&self, notification: &Notification) -> Result<()> {
        self.put_doc("notifications", &notification.notification_id, notification)
            .await
    }
}
