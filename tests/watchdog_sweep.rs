use sqlx::PgPool;
use uuid::Uuid;

use compliance_host::events::{EventBroadcaster, LifecycleEvent};
use compliance_host::watchdog;

async fn create_processing_certificate(pool: &PgPool, minutes_old: i32) -> Uuid {
    let property_id: Uuid = sqlx::query_scalar(
        "INSERT INTO properties (address_line1) VALUES ('2 Sweep Road') RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    sqlx::query_scalar(
        "INSERT INTO certificates (property_id, category, file_name, status, updated_at) \
         VALUES ($1, 'GAS_SAFETY', 'stuck.pdf', 'PROCESSING', NOW() - make_interval(mins => $2)) \
         RETURNING id",
    )
    .bind(property_id)
    .bind(minutes_old)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[sqlx::test]
async fn stuck_certificates_are_failed_and_fresh_ones_left_alone(pool: PgPool) {
    let stuck = create_processing_certificate(&pool, 25).await;
    let fresh = create_processing_certificate(&pool, 5).await;

    let broadcaster = EventBroadcaster::new();
    let (_, mut rx) = broadcaster.subscribe();

    let swept = watchdog::run_sweep(&pool, &broadcaster, 20).await.unwrap();
    assert_eq!(swept, 1);

    let status: String = sqlx::query_scalar("SELECT status FROM certificates WHERE id = $1")
        .bind(stuck)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "FAILED");

    let status: String = sqlx::query_scalar("SELECT status FROM certificates WHERE id = $1")
        .bind(fresh)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "PROCESSING");

    match rx.recv().await {
        Some(LifecycleEvent::ExtractionFailed { certificate_id, .. }) => {
            assert_eq!(certificate_id, stuck);
        }
        other => panic!("expected ExtractionFailed, got {other:?}"),
    }

    // An immediate re-run has nothing left to sweep.
    assert_eq!(watchdog::run_sweep(&pool, &broadcaster, 20).await.unwrap(), 0);
}
