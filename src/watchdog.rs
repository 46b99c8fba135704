use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::RuntimeSettings;
use crate::db::certificates;
use crate::events::{EventBroadcaster, LifecycleEvent};
use crate::job_queue::{JobQueue, SendOptions, QUEUE_WATCHDOG};

pub const MANUAL_TRIGGER_KEY: &str = "manual-watchdog-trigger";
const MANUAL_TRIGGER_WINDOW_SECONDS: i64 = 60;

const TIMEOUT_MESSAGE: &str = "Extraction exceeded the processing timeout";

/// Fail every certificate stuck in PROCESSING past the timeout, emitting
/// an `extraction_failed` event per transition. Returns how many were
/// swept.
pub async fn run_sweep(
    pool: &PgPool,
    broadcaster: &EventBroadcaster,
    timeout_minutes: i64,
) -> Result<usize, sqlx::Error> {
    let cutoff = Utc::now() - Duration::minutes(timeout_minutes);
    let stuck = certificates::fail_stuck_processing(pool, cutoff, TIMEOUT_MESSAGE).await?;
    for (certificate_id, property_id) in &stuck {
        warn!(%certificate_id, "watchdog failed stuck certificate");
        broadcaster.broadcast(LifecycleEvent::ExtractionFailed {
            certificate_id: *certificate_id,
            property_id: Some(*property_id),
            status: Some("FAILED".into()),
        });
    }
    if !stuck.is_empty() {
        info!(count = stuck.len(), "watchdog sweep complete");
    }
    Ok(stuck.len())
}

/// Register the watchdog worker and its cron schedule.
pub async fn register(
    queue: &JobQueue,
    broadcaster: EventBroadcaster,
    settings: &RuntimeSettings,
) -> Result<(), sqlx::Error> {
    let timeout_minutes = settings.processing_timeout_minutes;
    let worker_queue = queue.clone();
    queue.work(QUEUE_WATCHDOG, 1, move |_job| {
        let pool = worker_queue.pool().clone();
        let broadcaster = broadcaster.clone();
        async move {
            run_sweep(&pool, &broadcaster, timeout_minutes).await?;
            Ok(())
        }
    });

    let cron = format!("*/{} * * * *", settings.watchdog_interval_minutes.clamp(1, 59));
    queue
        .schedule(QUEUE_WATCHDOG, &cron, None, &json!({}), &SendOptions::default())
        .await
}

/// Manual trigger, deduplicated within a 60-second window so an operator
/// mashing the button still gets one sweep.
pub async fn trigger_manual(queue: &JobQueue) -> Result<bool, sqlx::Error> {
    let sent = queue
        .send(
            QUEUE_WATCHDOG,
            &json!({ "manual": true }),
            SendOptions {
                singleton_key: Some(MANUAL_TRIGGER_KEY.to_string()),
                singleton_seconds: Some(MANUAL_TRIGGER_WINDOW_SECONDS),
                ..SendOptions::default()
            },
        )
        .await?;
    Ok(sent.is_some())
}
