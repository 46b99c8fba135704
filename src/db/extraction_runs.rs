use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, Row};
use uuid::Uuid;

/// Open a run in PROCESSING before the first tier attempt so audit rows
/// have something to hang off.
pub async fn create<'c, E>(executor: E, certificate_id: Uuid) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "INSERT INTO extraction_runs (certificate_id, status) VALUES ($1, 'PROCESSING') \
         RETURNING id",
    )
    .bind(certificate_id)
    .fetch_one(executor)
    .await?;
    Ok(row.get("id"))
}

pub struct FinaliseRun<'a> {
    pub document_type: Option<&'a str>,
    pub classification_confidence: Option<f64>,
    pub raw_output: &'a Value,
    pub validated_output: Option<&'a Value>,
    pub normalised_output: Option<&'a Value>,
    pub final_tier: i32,
    pub tier_name: &'a str,
    pub processing_time_ms: i64,
    pub processing_cost_pence: i64,
    pub validation_passed: bool,
    pub status: &'a str,
}

pub async fn finalise<'c, E>(
    executor: E,
    run_id: Uuid,
    run: FinaliseRun<'_>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE extraction_runs SET \
             document_type = $2, classification_confidence = $3, raw_output = $4, \
             validated_output = $5, normalised_output = $6, final_tier = $7, tier_name = $8, \
             processing_time_ms = $9, processing_cost_pence = $10, validation_passed = $11, \
             status = $12, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(run_id)
    .bind(run.document_type)
    .bind(run.classification_confidence)
    .bind(run.raw_output)
    .bind(run.validated_output)
    .bind(run.normalised_output)
    .bind(run.final_tier)
    .bind(run.tier_name)
    .bind(run.processing_time_ms)
    .bind(run.processing_cost_pence)
    .bind(run.validation_passed)
    .bind(run.status)
    .execute(executor)
    .await?;
    Ok(())
}

pub struct NewTierAudit<'a> {
    pub run_id: Uuid,
    pub tier_name: &'a str,
    pub tier_order: i32,
    pub status: &'a str,
    pub confidence: Option<f64>,
    pub processing_time_ms: i64,
    pub cost_pence: i64,
    pub field_count: i32,
    pub escalation_reason: Option<&'a str>,
    pub page_count: Option<i32>,
    pub raw_output: Option<&'a Value>,
}

pub async fn insert_tier_audit<'c, E>(
    executor: E,
    audit: NewTierAudit<'_>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO extraction_tier_audits \
         (run_id, tier_name, tier_order, status, confidence, processing_time_ms, cost_pence, \
          field_count, escalation_reason, page_count, raw_output, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())",
    )
    .bind(audit.run_id)
    .bind(audit.tier_name)
    .bind(audit.tier_order)
    .bind(audit.status)
    .bind(audit.confidence)
    .bind(audit.processing_time_ms)
    .bind(audit.cost_pence)
    .bind(audit.field_count)
    .bind(audit.escalation_reason)
    .bind(audit.page_count)
    .bind(audit.raw_output)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TierAudit {
    pub id: Uuid,
    pub run_id: Uuid,
    pub tier_name: String,
    pub tier_order: i32,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: i64,
    pub status: String,
    pub confidence: Option<f64>,
    pub cost_pence: i64,
    pub field_count: i32,
    pub escalation_reason: Option<String>,
    pub page_count: Option<i32>,
    pub raw_output: Option<Value>,
}

pub async fn audits_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<TierAudit>, sqlx::Error> {
    sqlx::query_as::<_, TierAudit>(
        "SELECT id, run_id, tier_name, tier_order, attempted_at, completed_at, \
                processing_time_ms, status, confidence, cost_pence, field_count, \
                escalation_reason, page_count, raw_output \
         FROM extraction_tier_audits WHERE run_id = $1 ORDER BY tier_order",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
}

pub async fn latest_run_for_certificate(
    pool: &PgPool,
    certificate_id: Uuid,
) -> Result<Option<Uuid>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id FROM extraction_runs WHERE certificate_id = $1 \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(certificate_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| row.get("id")))
}
