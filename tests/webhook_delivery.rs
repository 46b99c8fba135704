use chrono::Utc;
use httpmock::prelude::*;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use compliance_host::db::webhook;
use compliance_host::webhooks::WebhookDeliverer;

async fn create_endpoint(pool: &PgPool, url: &str, auth_mode: &str, secret: Option<&str>) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO webhook_endpoints (url, auth_mode, secret, event_types, retry_count) \
         VALUES ($1, $2, $3, ARRAY['ingestion.completed'], 5) RETURNING id",
    )
    .bind(url)
    .bind(auth_mode)
    .bind(secret)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn stage_delivery(pool: &PgPool, endpoint_id: Uuid) -> Uuid {
    let event_id = webhook::insert_event(
        pool,
        "ingestion.completed",
        "ingestion_job",
        "test-entity",
        &json!({"certificateId": "abc"}),
    )
    .await
    .unwrap();
    webhook::insert_delivery(pool, event_id, endpoint_id).await.unwrap()
}

#[sqlx::test]
async fn failed_attempts_follow_the_retry_ladder_then_succeed(pool: PgPool) {
    let server = MockServer::start_async().await;
    let mut failing = server.mock(|when, then| {
        when.method(POST).path("/hook");
        then.status(500).body("upstream exploded");
    });

    let endpoint_id = create_endpoint(&pool, &server.url("/hook"), "NONE", None).await;
    let delivery_id = stage_delivery(&pool, endpoint_id).await;
    let deliverer = WebhookDeliverer::new(pool.clone());

    deliverer.deliver(delivery_id).await.unwrap();
    let delivery = webhook::get_delivery(&pool, delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, "RETRYING");
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.response_status, Some(500));
    assert!(delivery.response_body.as_deref().unwrap().contains("exploded"));
    let delay = (delivery.next_retry_at - Utc::now()).num_seconds();
    assert!((0..=2).contains(&delay), "first retry in {delay}s");

    deliverer.deliver(delivery_id).await.unwrap();
    let delivery = webhook::get_delivery(&pool, delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.attempt_count, 2);
    let delay = (delivery.next_retry_at - Utc::now()).num_seconds();
    assert!((3..=6).contains(&delay), "second retry in {delay}s");

    let failure_count: i32 =
        sqlx::query_scalar("SELECT failure_count FROM webhook_endpoints WHERE id = $1")
            .bind(endpoint_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failure_count, 2);

    // Endpoint recovers: the next attempt lands and resets the counter.
    failing.delete();
    let ok = server.mock(|when, then| {
        when.method(POST)
            .path("/hook")
            .header("X-Webhook-Source", "ComplianceAI")
            .header("X-Webhook-Event", "ingestion.completed")
            .header("Content-Type", "application/json");
        then.status(200);
    });

    deliverer.deliver(delivery_id).await.unwrap();
    ok.assert();
    let delivery = webhook::get_delivery(&pool, delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, "SENT");
    assert_eq!(delivery.attempt_count, 3);
    assert_eq!(delivery.response_status, Some(200));

    let failure_count: i32 =
        sqlx::query_scalar("SELECT failure_count FROM webhook_endpoints WHERE id = $1")
            .bind(endpoint_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failure_count, 0);

    // Replaying a sent delivery is a no-op.
    deliverer.deliver(delivery_id).await.unwrap();
    let delivery = webhook::get_delivery(&pool, delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.attempt_count, 3);
}

#[sqlx::test]
async fn hmac_endpoints_get_a_signature_header(pool: PgPool) {
    let server = MockServer::start_async().await;
    let signed = server.mock(|when, then| {
        when.method(POST)
            .path("/signed")
            .header_exists("X-Webhook-Signature")
            .header_exists("X-Webhook-Delivery");
        then.status(204);
    });

    let endpoint_id =
        create_endpoint(&pool, &server.url("/signed"), "HMAC_SHA256", Some("s3cret")).await;
    let delivery_id = stage_delivery(&pool, endpoint_id).await;
    WebhookDeliverer::new(pool.clone())
        .deliver(delivery_id)
        .await
        .unwrap();

    signed.assert();
    let delivery = webhook::get_delivery(&pool, delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, "SENT");
}

#[sqlx::test]
async fn bearer_endpoints_get_an_authorization_header(pool: PgPool) {
    let server = MockServer::start_async().await;
    let authed = server.mock(|when, then| {
        when.method(POST)
            .path("/bearer")
            .header("Authorization", "Bearer token-123");
        then.status(200);
    });

    let endpoint_id =
        create_endpoint(&pool, &server.url("/bearer"), "BEARER", Some("token-123")).await;
    let delivery_id = stage_delivery(&pool, endpoint_id).await;
    WebhookDeliverer::new(pool.clone())
        .deliver(delivery_id)
        .await
        .unwrap();
    authed.assert();
}

#[sqlx::test]
async fn repeated_failures_disable_the_endpoint(pool: PgPool) {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/down");
        then.status(503);
    });

    let endpoint_id = create_endpoint(&pool, &server.url("/down"), "NONE", None).await;
    sqlx::query("UPDATE webhook_endpoints SET failure_count = 9 WHERE id = $1")
        .bind(endpoint_id)
        .execute(&pool)
        .await
        .unwrap();

    let delivery_id = stage_delivery(&pool, endpoint_id).await;
    WebhookDeliverer::new(pool.clone())
        .deliver(delivery_id)
        .await
        .unwrap();

    let (status, failures): (String, i32) =
        sqlx::query_as("SELECT status, failure_count FROM webhook_endpoints WHERE id = $1")
            .bind(endpoint_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failures, 10);
    assert_eq!(status, "FAILED");

    // A disabled endpoint terminates any further deliveries.
    let next_delivery = stage_delivery(&pool, endpoint_id).await;
    WebhookDeliverer::new(pool.clone())
        .deliver(next_delivery)
        .await
        .unwrap();
    let delivery = webhook::get_delivery(&pool, next_delivery).await.unwrap().unwrap();
    assert_eq!(delivery.status, "FAILED");
}
