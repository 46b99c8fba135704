use axum::{
    body::Body,
    http::{Request, StatusCode},
    Extension, Router,
};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use compliance_host::config::RuntimeSettings;
use compliance_host::events::EventBroadcaster;
use compliance_host::job_queue::JobQueue;
use compliance_host::routes::api_routes;

fn app(pool: &PgPool) -> Router {
    Router::new()
        .merge(api_routes())
        .layer(Extension(pool.clone()))
        .layer(Extension(JobQueue::new(pool.clone(), RuntimeSettings::default())))
        .layer(Extension(EventBroadcaster::new()))
}

async fn post_json(app: Router, path: &str, body: Value) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, bytes.to_vec())
}

#[sqlx::test]
async fn ingestion_jobs_endpoint_creates_and_enqueues(pool: PgPool) {
    let property_id: Uuid = sqlx::query_scalar(
        "INSERT INTO properties (address_line1) VALUES ('3 Handler Way') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let (status, body) = post_json(
        app(&pool),
        "/ingestion-jobs",
        json!({
            "propertyId": property_id,
            "certificateType": "GAS_SAFETY",
            "fileName": "cp12.pdf",
            "objectPath": "certs/cp12.pdf"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let response: Value = serde_json::from_slice(&body).unwrap();
    let job_id = response["jobId"].as_str().unwrap();
    let job_status: String =
        sqlx::query_scalar("SELECT status FROM ingestion_jobs WHERE id = $1::uuid")
            .bind(job_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(job_status, "PENDING");

    let queued: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM queue_jobs WHERE queue = 'certificate-ingestion'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(queued, 1);
}

#[sqlx::test]
async fn unknown_property_is_rejected(pool: PgPool) {
    let (status, _) = post_json(
        app(&pool),
        "/ingestion-jobs",
        json!({
            "propertyId": Uuid::new_v4(),
            "certificateType": "EICR",
            "fileName": "eicr.pdf",
            "objectPath": "certs/eicr.pdf"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[sqlx::test]
async fn a_document_source_is_required(pool: PgPool) {
    let property_id: Uuid = sqlx::query_scalar(
        "INSERT INTO properties (address_line1) VALUES ('4 Handler Way') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let (status, _) = post_json(
        app(&pool),
        "/ingestion-jobs",
        json!({
            "propertyId": property_id,
            "certificateType": "EICR",
            "fileName": "eicr.pdf"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[sqlx::test]
async fn inbound_action_updates_are_logged_even_when_unknown(pool: PgPool) {
    let (status, _) = post_json(
        app(&pool),
        "/integrations/hms/actions",
        json!({
            "actionId": Uuid::new_v4(),
            "status": "COMPLETED"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The body is persisted for replay regardless of the outcome.
    let logged: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM incoming_webhook_logs WHERE source = 'hms'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(logged, 1);
}
