use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Extension, Json};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use tokio::time::sleep;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::circuit::CircuitBreaker;
use crate::db::remedial_actions::{self, IntegrationUpdate};
use crate::db::webhook::{self, DeliveryFailure, WebhookEndpoint};
use crate::error::{AppError, AppResult};
use crate::job_queue::{JobQueue, SendOptions, QUEUE_WEBHOOK_DELIVERY};

type HmacSha256 = Hmac<Sha256>;

/// Attempt-indexed retry delays; attempts past the table reuse the last
/// entry.
pub const RETRY_DELAYS_SECONDS: [i64; 5] = [1, 5, 30, 120, 300];

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_BATCH: i64 = 50;
const DELIVERY_BATCH: i64 = 100;
const RESPONSE_BODY_PREFIX: usize = 256;
const ENDPOINT_DISABLE_AT: i32 = 10;
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(120);

/// Shared state for the delivery workers.
#[derive(Clone)]
pub struct WebhookDeliverer {
    pool: PgPool,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl WebhookDeliverer {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            http: reqwest::Client::new(),
            breaker: Arc::new(CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN)),
        }
    }

    /// One delivery attempt. Terminal states are idempotent: replaying a
    /// job for an already-sent delivery does nothing.
    pub async fn deliver(&self, delivery_id: Uuid) -> Result<(), anyhow::Error> {
        let Some(delivery) = webhook::get_delivery(&self.pool, delivery_id).await? else {
            warn!(%delivery_id, "delivery job referenced missing delivery row");
            return Ok(());
        };
        if delivery.status == "SENT" || delivery.status == "FAILED" {
            return Ok(());
        }
        let Some(event) = webhook::get_event(&self.pool, delivery.event_id).await? else {
            warn!(%delivery_id, "delivery references missing event");
            return Ok(());
        };
        let Some(endpoint) = webhook::get_endpoint(&self.pool, delivery.endpoint_id).await? else {
            warn!(%delivery_id, "delivery references missing endpoint");
            return Ok(());
        };
        if endpoint.status != "ACTIVE" {
            webhook::mark_delivery_failed(
                &self.pool,
                delivery_id,
                DeliveryFailure {
                    response_status: None,
                    response_body: Some("endpoint disabled"),
                    next_retry_at: None,
                    terminal: true,
                },
            )
            .await?;
            return Ok(());
        }

        let host = Url::parse(&endpoint.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| endpoint.url.clone());
        if !self.breaker.allows(&host) {
            // Open circuit counts as a transient failure: reschedule
            // without dinging the endpoint's failure counter.
            let terminal = delivery.attempt_count + 1 >= endpoint.retry_count;
            webhook::mark_delivery_failed(
                &self.pool,
                delivery_id,
                DeliveryFailure {
                    response_status: None,
                    response_body: Some("circuit open"),
                    next_retry_at: (!terminal).then(|| next_retry_at(delivery.attempt_count)),
                    terminal,
                },
            )
            .await?;
            return Ok(());
        }

        let body = json!({
            "event": event.event_type,
            "timestamp": Utc::now().to_rfc3339(),
            "deliveryId": delivery_id,
            "data": event.payload,
        });
        let body_bytes = serde_json::to_vec(&body)?;

        let mut request = self
            .http
            .post(&endpoint.url)
            .timeout(Duration::from_secs(endpoint.timeout_seconds.max(1) as u64))
            .header("Content-Type", "application/json")
            .header("X-Webhook-Source", "ComplianceAI")
            .header("X-Webhook-Event", &event.event_type)
            .header("X-Webhook-Delivery", delivery_id.to_string());
        if let Some(Value::Object(headers)) = &endpoint.custom_headers {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        request = match (endpoint.auth_mode.as_str(), endpoint.secret.as_deref()) {
            ("API_KEY", Some(secret)) => request.header("X-API-Key", secret),
            ("BEARER", Some(secret)) => {
                request.header("Authorization", format!("Bearer {secret}"))
            }
            ("HMAC_SHA256", Some(secret)) => {
                request.header("X-Webhook-Signature", sign_payload(secret, &body_bytes))
            }
            _ => request,
        };

        match request.body(body_bytes).send().await {
            Ok(response) if response.status().is_success() => {
                webhook::mark_delivery_sent(
                    &self.pool,
                    delivery_id,
                    response.status().as_u16() as i32,
                )
                .await?;
                webhook::reset_endpoint_failures(&self.pool, endpoint.id).await?;
                self.breaker.record_success(&host);
                info!(%delivery_id, url = %endpoint.url, "webhook delivered");
            }
            Ok(response) => {
                let status = response.status().as_u16() as i32;
                let body = response.text().await.unwrap_or_default();
                let prefix: String = body.chars().take(RESPONSE_BODY_PREFIX).collect();
                self.record_failure(
                    delivery.attempt_count,
                    delivery_id,
                    &endpoint,
                    Some(status),
                    &prefix,
                    &host,
                )
                .await?;
            }
            Err(err) => {
                self.record_failure(
                    delivery.attempt_count,
                    delivery_id,
                    &endpoint,
                    None,
                    &err.to_string(),
                    &host,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        attempt_count: i32,
        delivery_id: Uuid,
        endpoint: &WebhookEndpoint,
        response_status: Option<i32>,
        detail: &str,
        host: &str,
    ) -> Result<(), anyhow::Error> {
        let attempts_after = attempt_count + 1;
        let terminal = attempts_after >= endpoint.retry_count;
        webhook::mark_delivery_failed(
            &self.pool,
            delivery_id,
            DeliveryFailure {
                response_status,
                response_body: Some(detail),
                next_retry_at: (!terminal).then(|| next_retry_at(attempt_count)),
                terminal,
            },
        )
        .await?;
        let failures =
            webhook::bump_endpoint_failures(&self.pool, endpoint.id, ENDPOINT_DISABLE_AT).await?;
        if failures >= ENDPOINT_DISABLE_AT {
            warn!(url = %endpoint.url, failures, "endpoint disabled after repeated failures");
        }
        self.breaker.record_failure(host);
        warn!(
            %delivery_id,
            url = %endpoint.url,
            attempts = attempts_after,
            ?response_status,
            terminal,
            "webhook delivery attempt failed"
        );
        Ok(())
    }
}

fn next_retry_at(attempt_count: i32) -> DateTime<Utc> {
    let index = (attempt_count.max(0) as usize).min(RETRY_DELAYS_SECONDS.len() - 1);
    Utc::now() + ChronoDuration::seconds(RETRY_DELAYS_SECONDS[index])
}

pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Poller: fan unprocessed events out into delivery rows, then push every
/// due delivery onto the `webhook-delivery` queue. Delivery retries are
/// scheduled through `next_retry_at` on the row, not queue-level retry.
pub fn spawn_event_poller(queue: JobQueue) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = fan_out_events(queue.pool()).await {
                error!(?err, "webhook event fan-out failed");
            }
            if let Err(err) = enqueue_due_deliveries(&queue).await {
                error!(?err, "webhook delivery enqueue failed");
            }
            sleep(POLL_INTERVAL).await;
        }
    });
}

async fn fan_out_events(pool: &PgPool) -> Result<(), sqlx::Error> {
    let events = webhook::unprocessed_events(pool, EVENT_BATCH).await?;
    for event in events {
        let endpoints = webhook::active_endpoints_for(pool, &event.event_type).await?;
        for endpoint in &endpoints {
            webhook::insert_delivery(pool, event.id, endpoint.id).await?;
        }
        webhook::mark_event_processed(pool, event.id).await?;
        if !endpoints.is_empty() {
            info!(event_type = %event.event_type, fan_out = endpoints.len(), "webhook event staged");
        }
    }
    Ok(())
}

async fn enqueue_due_deliveries(queue: &JobQueue) -> Result<(), sqlx::Error> {
    let due = webhook::due_deliveries(queue.pool(), DELIVERY_BATCH).await?;
    for delivery in due {
        queue
            .send(
                QUEUE_WEBHOOK_DELIVERY,
                &json!({ "deliveryId": delivery.id }),
                SendOptions {
                    retry_limit: Some(0),
                    singleton_key: Some(format!(
                        "delivery-{}-{}",
                        delivery.id, delivery.attempt_count
                    )),
                    singleton_seconds: Some(300),
                    ..SendOptions::default()
                },
            )
            .await?;
    }
    Ok(())
}

/// Make sure an ad-hoc webhook URL supplied on an ingestion job receives
/// lifecycle events, without requiring pre-registration.
pub async fn ensure_endpoint_for_url(pool: &PgPool, url: &str) -> Result<(), sqlx::Error> {
    let existing =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM webhook_endpoints WHERE url = $1")
            .bind(url)
            .fetch_one(pool)
            .await?;
    if existing == 0 {
        sqlx::query(
            "INSERT INTO webhook_endpoints (url, auth_mode, event_types) \
             VALUES ($1, 'NONE', ARRAY['ingestion.completed', 'ingestion.failed'])",
        )
        .bind(url)
        .execute(pool)
        .await?;
        info!(url, "registered ad-hoc webhook endpoint");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmsActionUpdate {
    pub action_id: Uuid,
    pub status: String,
    pub notes: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cost_actual: Option<i64>,
}

/// `POST /integrations/hms/actions`: a housing-management system reports
/// progress on a remedial action. Every body is persisted for replay.
pub async fn hms_action_update(
    Extension(pool): Extension<PgPool>,
    Json(update): Json<HmsActionUpdate>,
) -> AppResult<Json<Value>> {
    let payload = json!({
        "actionId": update.action_id,
        "status": update.status,
        "notes": update.notes,
        "completedAt": update.completed_at,
        "costActual": update.cost_actual,
    });
    let log_id = webhook::insert_incoming_log(&pool, "hms", "action.update", &payload, None).await?;

    let status = update.status.trim().to_uppercase();
    if !["OPEN", "IN_PROGRESS", "COMPLETED", "CANCELLED"].contains(&status.as_str()) {
        let message = format!("unknown action status: {status}");
        let _ = webhook::finish_incoming_log(&pool, log_id, Some(&message)).await;
        return Err(AppError::BadRequest(message));
    }

    let updated = remedial_actions::apply_integration_update(
        &pool,
        update.action_id,
        IntegrationUpdate {
            status: &status,
            notes: update.notes.as_deref(),
            completed_at: update.completed_at,
            cost_actual_pence: update.cost_actual,
        },
    )
    .await?;

    match updated {
        Some(action) => {
            webhook::insert_event(
                &pool,
                if status == "COMPLETED" {
                    "action.completed"
                } else {
                    "action.updated"
                },
                "remedial_action",
                &action.id.to_string(),
                &serde_json::to_value(&action).unwrap_or_default(),
            )
            .await?;
            let _ = webhook::finish_incoming_log(&pool, log_id, None).await;
            Ok(Json(json!({ "actionId": action.id, "status": action.status })))
        }
        None => {
            let _ = webhook::finish_incoming_log(&pool, log_id, Some("action not found")).await;
            Err(AppError::NotFound)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmsWorkOrder {
    pub action_id: Uuid,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// `POST /integrations/hms/work-orders`: scheduled works against an
/// action.
pub async fn hms_work_order(
    Extension(pool): Extension<PgPool>,
    Json(order): Json<HmsWorkOrder>,
) -> AppResult<Json<Value>> {
    let payload = json!({
        "actionId": order.action_id,
        "scheduledAt": order.scheduled_at,
        "notes": order.notes,
    });
    let log_id = webhook::insert_incoming_log(&pool, "hms", "work_order", &payload, None).await?;

    let updated = remedial_actions::apply_work_order(
        &pool,
        order.action_id,
        order.scheduled_at,
        order.notes.as_deref(),
    )
    .await?;

    match updated {
        Some(action) => {
            let _ = webhook::finish_incoming_log(&pool, log_id, None).await;
            Ok(Json(json!({ "actionId": action.id, "status": action.status })))
        }
        None => {
            let _ = webhook::finish_incoming_log(&pool, log_id, Some("action not found")).await;
            Err(AppError::NotFound)
        }
    }
}
