use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IngestionJob {
    pub id: Uuid,
    pub property_id: Uuid,
    pub certificate_category: String,
    pub file_name: String,
    pub storage_key: Option<String>,
    pub file_base64: Option<String>,
    pub mime_type: Option<String>,
    pub webhook_url: Option<String>,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub certificate_id: Option<Uuid>,
    pub status: String,
    pub status_message: Option<String>,
    pub error_details: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, property_id, certificate_category, file_name, storage_key, \
                       file_base64, mime_type, webhook_url, attempt_count, last_attempt_at, \
                       certificate_id, status, status_message, error_details, created_at, \
                       updated_at";

pub struct NewIngestionJob<'a> {
    pub property_id: Uuid,
    pub certificate_category: &'a str,
    pub file_name: &'a str,
    pub storage_key: Option<&'a str>,
    pub file_base64: Option<&'a str>,
    pub mime_type: Option<&'a str>,
    pub webhook_url: Option<&'a str>,
}

pub async fn create<'c, E>(executor: E, job: NewIngestionJob<'_>) -> Result<IngestionJob, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, IngestionJob>(&format!(
        "INSERT INTO ingestion_jobs \
         (property_id, certificate_category, file_name, storage_key, file_base64, mime_type, webhook_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {COLUMNS}"
    ))
    .bind(job.property_id)
    .bind(job.certificate_category)
    .bind(job.file_name)
    .bind(job.storage_key)
    .bind(job.file_base64)
    .bind(job.mime_type)
    .bind(job.webhook_url)
    .fetch_one(executor)
    .await
}

pub async fn get<'c, E>(executor: E, id: Uuid) -> Result<Option<IngestionJob>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, IngestionJob>(&format!(
        "SELECT {COLUMNS} FROM ingestion_jobs WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Atomic claim: move the job to PROCESSING and bump the attempt counter in
/// one conditional statement. Rows already COMPLETE, or FAILED with no
/// retries left, match nothing and return `None`. This row-level condition
/// is the sole concurrency control for job idempotency.
pub async fn try_begin_processing<'c, E>(
    executor: E,
    id: Uuid,
    max_attempts: i32,
) -> Result<Option<IngestionJob>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, IngestionJob>(&format!(
        "UPDATE ingestion_jobs \
         SET status = 'PROCESSING', attempt_count = attempt_count + 1, \
             last_attempt_at = NOW(), updated_at = NOW() \
         WHERE id = $1 AND status <> 'COMPLETE' \
           AND (status <> 'FAILED' OR attempt_count < $2) \
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(max_attempts)
    .fetch_optional(executor)
    .await
}

pub async fn mark_extracting<'c, E>(executor: E, id: Uuid) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE ingestion_jobs SET status = 'EXTRACTING', updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Pin the certificate onto the job for idempotent replays. Write-once:
/// an already-set certificate id is never overwritten.
pub async fn pin_certificate<'c, E>(
    executor: E,
    id: Uuid,
    certificate_id: Uuid,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE ingestion_jobs \
         SET certificate_id = COALESCE(certificate_id, $2), updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(certificate_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_complete<'c, E>(executor: E, id: Uuid, message: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE ingestion_jobs \
         SET status = 'COMPLETE', status_message = $2, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(message)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_failed<'c, E>(
    executor: E,
    id: Uuid,
    message: &str,
    error_details: &Value,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE ingestion_jobs \
         SET status = 'FAILED', status_message = $2, error_details = $3, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(message)
    .bind(error_details)
    .execute(executor)
    .await?;
    Ok(())
}
