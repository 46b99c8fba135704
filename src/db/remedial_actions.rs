use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, PgPool, Postgres, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RemedialAction {
    pub id: Uuid,
    pub certificate_id: Uuid,
    pub property_id: Uuid,
    pub code: String,
    pub description: String,
    pub location: String,
    pub severity: String,
    pub status: String,
    pub due_date: DateTime<Utc>,
    pub cost_estimate: String,
    pub notes: Option<String>,
    pub cost_actual_pence: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, certificate_id, property_id, code, description, location, severity, \
                       status, due_date, cost_estimate, notes, cost_actual_pence, scheduled_at, \
                       resolved_at, created_at, updated_at";

pub struct NewRemedialAction<'a> {
    pub certificate_id: Uuid,
    pub property_id: Uuid,
    pub code: &'a str,
    pub description: &'a str,
    pub location: &'a str,
    pub severity: &'a str,
    pub due_date: DateTime<Utc>,
    pub cost_estimate: &'a str,
}

pub async fn insert<'c, E>(executor: E, action: NewRemedialAction<'_>) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "INSERT INTO remedial_actions \
         (certificate_id, property_id, code, description, location, severity, due_date, cost_estimate) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
    )
    .bind(action.certificate_id)
    .bind(action.property_id)
    .bind(action.code)
    .bind(action.description)
    .bind(action.location)
    .bind(action.severity)
    .bind(action.due_date)
    .bind(action.cost_estimate)
    .fetch_one(executor)
    .await?;
    Ok(row.get("id"))
}

pub async fn list_for_certificate(
    pool: &PgPool,
    certificate_id: Uuid,
) -> Result<Vec<RemedialAction>, sqlx::Error> {
    sqlx::query_as::<_, RemedialAction>(&format!(
        "SELECT {COLUMNS} FROM remedial_actions WHERE certificate_id = $1 ORDER BY created_at"
    ))
    .bind(certificate_id)
    .fetch_all(pool)
    .await
}

pub struct IntegrationUpdate<'a> {
    pub status: &'a str,
    pub notes: Option<&'a str>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cost_actual_pence: Option<i64>,
}

/// Apply a status report from the housing-management system. Returns the
/// updated row, or `None` when the action id is unknown.
pub async fn apply_integration_update(
    pool: &PgPool,
    action_id: Uuid,
    update: IntegrationUpdate<'_>,
) -> Result<Option<RemedialAction>, sqlx::Error> {
    sqlx::query_as::<_, RemedialAction>(&format!(
        "UPDATE remedial_actions SET \
             status = $2, \
             notes = COALESCE($3, notes), \
             resolved_at = CASE WHEN $2 = 'COMPLETED' THEN COALESCE($4, NOW()) ELSE resolved_at END, \
             cost_actual_pence = COALESCE($5, cost_actual_pence), \
             updated_at = NOW() \
         WHERE id = $1 RETURNING {COLUMNS}"
    ))
    .bind(action_id)
    .bind(update.status)
    .bind(update.notes)
    .bind(update.completed_at)
    .bind(update.cost_actual_pence)
    .fetch_optional(pool)
    .await
}

/// Record scheduling information from an inbound work order.
pub async fn apply_work_order(
    pool: &PgPool,
    action_id: Uuid,
    scheduled_at: Option<DateTime<Utc>>,
    notes: Option<&str>,
) -> Result<Option<RemedialAction>, sqlx::Error> {
    sqlx::query_as::<_, RemedialAction>(&format!(
        "UPDATE remedial_actions SET \
             status = CASE WHEN status = 'OPEN' THEN 'IN_PROGRESS' ELSE status END, \
             scheduled_at = COALESCE($2, scheduled_at), \
             notes = COALESCE($3, notes), \
             updated_at = NOW() \
         WHERE id = $1 RETURNING {COLUMNS}"
    ))
    .bind(action_id)
    .bind(scheduled_at)
    .bind(notes)
    .fetch_optional(pool)
    .await
}
