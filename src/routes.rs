use axum::{
    extract::Extension,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::job_queue::JobQueue;
use crate::{events, ingest, watchdog, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/ingestion-jobs", post(ingest::create_ingestion_job))
        .route("/events", get(events::sse_handler))
        .route(
            "/integrations/hms/actions",
            post(webhooks::hms_action_update),
        )
        .route(
            "/integrations/hms/work-orders",
            post(webhooks::hms_work_order),
        )
        .route("/watchdog/run", post(trigger_watchdog))
}

async fn trigger_watchdog(Extension(queue): Extension<JobQueue>) -> AppResult<Json<Value>> {
    let triggered = watchdog::trigger_manual(&queue).await?;
    Ok(Json(json!({ "triggered": triggered })))
}
