use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub url: String,
    pub auth_mode: String,
    pub secret: Option<String>,
    pub event_types: Vec<String>,
    pub custom_headers: Option<Value>,
    pub retry_count: i32,
    pub timeout_seconds: i32,
    pub failure_count: i32,
    pub status: String,
}

const ENDPOINT_COLUMNS: &str = "id, url, auth_mode, secret, event_types, custom_headers, \
                                retry_count, timeout_seconds, failure_count, status";

pub async fn active_endpoints_for(
    pool: &PgPool,
    event_type: &str,
) -> Result<Vec<WebhookEndpoint>, sqlx::Error> {
    sqlx::query_as::<_, WebhookEndpoint>(&format!(
        "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints \
         WHERE status = 'ACTIVE' AND $1 = ANY(event_types)"
    ))
    .bind(event_type)
    .fetch_all(pool)
    .await
}

pub async fn get_endpoint<'c, E>(
    executor: E,
    id: Uuid,
) -> Result<Option<WebhookEndpoint>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, WebhookEndpoint>(&format!(
        "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn reset_endpoint_failures<'c, E>(executor: E, id: Uuid) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE webhook_endpoints SET failure_count = 0, last_success_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Bump the endpoint failure counter, disabling the endpoint once it
/// reaches the cut-off. Returns the new count.
pub async fn bump_endpoint_failures<'c, E>(
    executor: E,
    id: Uuid,
    disable_at: i32,
) -> Result<i32, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "UPDATE webhook_endpoints SET \
             failure_count = failure_count + 1, \
             status = CASE WHEN failure_count + 1 >= $2 THEN 'FAILED' ELSE status END \
         WHERE id = $1 RETURNING failure_count",
    )
    .bind(id)
    .bind(disable_at)
    .fetch_one(executor)
    .await?;
    Ok(row.get("failure_count"))
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_event<'c, E>(
    executor: E,
    event_type: &str,
    entity_type: &str,
    entity_id: &str,
    payload: &Value,
) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "INSERT INTO webhook_events (event_type, entity_type, entity_id, payload) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(event_type)
    .bind(entity_type)
    .bind(entity_id)
    .bind(payload)
    .fetch_one(executor)
    .await?;
    Ok(row.get("id"))
}

pub async fn unprocessed_events(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<WebhookEvent>, sqlx::Error> {
    sqlx::query_as::<_, WebhookEvent>(
        "SELECT id, event_type, entity_type, entity_id, payload, processed, created_at \
         FROM webhook_events WHERE NOT processed ORDER BY created_at LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn mark_event_processed<'c, E>(executor: E, id: Uuid) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE webhook_events SET processed = TRUE WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub event_id: Uuid,
    pub endpoint_id: Uuid,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    pub status: String,
}

const DELIVERY_COLUMNS: &str = "id, event_id, endpoint_id, attempt_count, last_attempt_at, \
                                response_status, response_body, next_retry_at, status";

pub async fn insert_delivery<'c, E>(
    executor: E,
    event_id: Uuid,
    endpoint_id: Uuid,
) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "INSERT INTO webhook_deliveries (event_id, endpoint_id) VALUES ($1, $2) RETURNING id",
    )
    .bind(event_id)
    .bind(endpoint_id)
    .fetch_one(executor)
    .await?;
    Ok(row.get("id"))
}

/// Deliveries whose retry clock has come due, oldest first.
pub async fn due_deliveries(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<WebhookDelivery>, sqlx::Error> {
    sqlx::query_as::<_, WebhookDelivery>(&format!(
        "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
         WHERE status IN ('PENDING', 'RETRYING') AND next_retry_at <= NOW() \
         ORDER BY next_retry_at LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn get_delivery(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<WebhookDelivery>, sqlx::Error> {
    sqlx::query_as::<_, WebhookDelivery>(&format!(
        "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_event<'c, E>(executor: E, id: Uuid) -> Result<Option<WebhookEvent>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, WebhookEvent>(
        "SELECT id, event_type, entity_type, entity_id, payload, processed, created_at \
         FROM webhook_events WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn mark_delivery_sent<'c, E>(
    executor: E,
    id: Uuid,
    response_status: i32,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE webhook_deliveries SET \
             status = 'SENT', attempt_count = attempt_count + 1, last_attempt_at = NOW(), \
             response_status = $2, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(response_status)
    .execute(executor)
    .await?;
    Ok(())
}

pub struct DeliveryFailure<'a> {
    pub response_status: Option<i32>,
    pub response_body: Option<&'a str>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub terminal: bool,
}

pub async fn mark_delivery_failed<'c, E>(
    executor: E,
    id: Uuid,
    failure: DeliveryFailure<'_>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE webhook_deliveries SET \
             status = $2, attempt_count = attempt_count + 1, last_attempt_at = NOW(), \
             response_status = $3, response_body = $4, \
             next_retry_at = COALESCE($5, next_retry_at), updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(if failure.terminal { "FAILED" } else { "RETRYING" })
    .bind(failure.response_status)
    .bind(failure.response_body)
    .bind(failure.next_retry_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn insert_incoming_log<'c, E>(
    executor: E,
    source: &str,
    event_type: &str,
    payload: &Value,
    headers: Option<&Value>,
) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "INSERT INTO incoming_webhook_logs (source, event_type, payload, headers) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(source)
    .bind(event_type)
    .bind(payload)
    .bind(headers)
    .fetch_one(executor)
    .await?;
    Ok(row.get("id"))
}

pub async fn finish_incoming_log<'c, E>(
    executor: E,
    id: Uuid,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE incoming_webhook_logs SET processed = TRUE, error_message = $2 WHERE id = $1",
    )
    .bind(id)
    .bind(error_message)
    .execute(executor)
    .await?;
    Ok(())
}
