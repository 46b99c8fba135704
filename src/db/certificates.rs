use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Certificate {
    pub id: Uuid,
    pub property_id: Uuid,
    pub organisation_id: Option<Uuid>,
    pub category: String,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub status: String,
    pub status_message: Option<String>,
    pub certificate_number: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub outcome: Option<String>,
    pub extracted_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, property_id, organisation_id, category, file_name, file_size, \
                       mime_type, status, status_message, certificate_number, issue_date, \
                       expiry_date, outcome, extracted_metadata, created_at, updated_at";

pub async fn create<'c, E>(
    executor: E,
    property_id: Uuid,
    category: &str,
    file_name: &str,
    file_size: Option<i64>,
    mime_type: Option<&str>,
) -> Result<Certificate, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Certificate>(&format!(
        "INSERT INTO certificates (property_id, category, file_name, file_size, mime_type, status) \
         VALUES ($1, $2, $3, $4, $5, 'PROCESSING') RETURNING {COLUMNS}"
    ))
    .bind(property_id)
    .bind(category)
    .bind(file_name)
    .bind(file_size)
    .bind(mime_type)
    .fetch_one(executor)
    .await
}

pub async fn get<'c, E>(executor: E, id: Uuid) -> Result<Option<Certificate>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Certificate>(&format!("SELECT {COLUMNS} FROM certificates WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub struct ExtractionUpdate<'a> {
    pub category: &'a str,
    pub certificate_number: Option<&'a str>,
    pub issue_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub outcome: &'a str,
    pub extracted_metadata: &'a Value,
    pub status: &'a str,
}

/// Apply extracted fields after a successful orchestrator pass. The
/// outcome is never downgraded from UNSATISFACTORY once a human review has
/// approved the certificate.
pub async fn apply_extraction<'c, E>(
    executor: E,
    id: Uuid,
    update: ExtractionUpdate<'_>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE certificates SET \
             category = $2, \
             certificate_number = COALESCE($3, certificate_number), \
             issue_date = COALESCE($4, issue_date), \
             expiry_date = COALESCE($5, expiry_date), \
             outcome = CASE \
                 WHEN status = 'APPROVED' AND outcome = 'UNSATISFACTORY' THEN outcome \
                 ELSE $6 END, \
             extracted_metadata = $7, \
             status = $8, \
             status_message = NULL, \
             updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(update.category)
    .bind(update.certificate_number)
    .bind(update.issue_date)
    .bind(update.expiry_date)
    .bind(update.outcome)
    .bind(update.extracted_metadata)
    .bind(update.status)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn update_status<'c, E>(
    executor: E,
    id: Uuid,
    status: &str,
    message: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE certificates SET status = $2, status_message = $3, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(status)
    .bind(message)
    .execute(executor)
    .await?;
    Ok(())
}

/// Watchdog sweep: fail every certificate stuck in PROCESSING past the
/// cut-off, in one statement, returning what was transitioned.
pub async fn fail_stuck_processing(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    message: &str,
) -> Result<Vec<(Uuid, Uuid)>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (Uuid, Uuid)>(
        "UPDATE certificates SET status = 'FAILED', status_message = $2, updated_at = NOW() \
         WHERE status = 'PROCESSING' AND updated_at < $1 \
         RETURNING id, property_id",
    )
    .bind(cutoff)
    .bind(message)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
