use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tokio::time::sleep;

use compliance_host::config::RuntimeSettings;
use compliance_host::job_queue::{JobQueue, SendOptions};

fn queue(pool: &PgPool) -> JobQueue {
    JobQueue::new(pool.clone(), RuntimeSettings::default())
}

async fn job_state(pool: &PgPool, id: uuid::Uuid) -> (String, i32) {
    sqlx::query_as("SELECT state, retry_count FROM queue_jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn wait_for_state(pool: &PgPool, id: uuid::Uuid, expected: &str) -> (String, i32) {
    for _ in 0..60 {
        let (state, retries) = job_state(pool, id).await;
        if state == expected {
            return (state, retries);
        }
        sleep(Duration::from_millis(500)).await;
    }
    job_state(pool, id).await
}

#[sqlx::test]
async fn singleton_key_deduplicates_within_the_window(pool: PgPool) {
    let queue = queue(&pool);
    let opts = || SendOptions {
        singleton_key: Some("job-X".into()),
        singleton_seconds: Some(60),
        ..SendOptions::default()
    };

    let first = queue.send("test-queue", &json!({"n": 1}), opts()).await.unwrap();
    let second = queue.send("test-queue", &json!({"n": 2}), opts()).await.unwrap();
    assert!(first.is_some());
    assert!(second.is_none());

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_jobs WHERE queue = 'test-queue'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Without a singleton key every send lands.
    queue
        .send("test-queue", &json!({"n": 3}), SendOptions::default())
        .await
        .unwrap();
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_jobs WHERE queue = 'test-queue'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 2);
}

#[sqlx::test]
async fn failed_jobs_are_retried_until_they_succeed(pool: PgPool) {
    let queue = queue(&pool);
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    queue.work("flaky", 1, move |_job| {
        let seen = seen.clone();
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient wobble");
            }
            Ok(())
        }
    });

    let id = queue
        .send(
            "flaky",
            &json!({}),
            SendOptions {
                retry_limit: Some(2),
                retry_delay_seconds: Some(0),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

    let (state, retries) = wait_for_state(&pool, id, "completed").await;
    assert_eq!(state, "completed");
    assert_eq!(retries, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[sqlx::test]
async fn retry_exhaustion_moves_the_job_to_failed(pool: PgPool) {
    let queue = queue(&pool);
    queue.work("doomed", 1, move |_job| async move {
        anyhow::bail!("always broken")
    });

    let id = queue
        .send(
            "doomed",
            &json!({}),
            SendOptions {
                retry_limit: Some(1),
                retry_delay_seconds: Some(0),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

    let (state, retries) = wait_for_state(&pool, id, "failed").await;
    assert_eq!(state, "failed");
    assert_eq!(retries, 1);

    let stats = queue.stats("doomed").await.unwrap();
    assert_eq!(stats.failed, 1);
}

#[sqlx::test]
async fn due_schedules_fire_once_per_tick(pool: PgPool) {
    let queue = queue(&pool);
    queue
        .schedule("scheduled-q", "* * * * *", None, &json!({"from": "cron"}), &SendOptions::default())
        .await
        .unwrap();
    // Backdate the schedule so a tick is due right now.
    sqlx::query("UPDATE queue_schedules SET created_at = NOW() - INTERVAL '10 minutes'")
        .execute(&pool)
        .await
        .unwrap();

    queue.fire_due_schedules().await.unwrap();
    let rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM queue_jobs WHERE queue = 'scheduled-q'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(rows, 1);

    // Rewind last_fired_at to the same instant: the tick recomputes to the
    // same occurrence and the singleton key swallows the duplicate.
    sqlx::query("UPDATE queue_schedules SET last_fired_at = created_at")
        .execute(&pool)
        .await
        .unwrap();
    queue.fire_due_schedules().await.unwrap();
    let rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM queue_jobs WHERE queue = 'scheduled-q'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(rows, 1);

    queue.unschedule("scheduled-q").await.unwrap();
    let schedules: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_schedules")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(schedules, 0);
}
