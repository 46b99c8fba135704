use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RuntimeSettings;

pub const QUEUE_INGESTION: &str = "certificate-ingestion";
pub const QUEUE_WEBHOOK_DELIVERY: &str = "webhook-delivery";
pub const QUEUE_RATE_LIMIT_CLEANUP: &str = "rate-limit-cleanup";
pub const QUEUE_WATCHDOG: &str = "certificate-watchdog";
pub const QUEUE_REPORTING_REFRESH: &str = "reporting-refresh";
pub const QUEUE_SCHEDULED_REPORT: &str = "scheduled-report";
pub const QUEUE_PATTERN_ANALYSIS: &str = "pattern-analysis";
pub const QUEUE_MV_REFRESH: &str = "mv-refresh";

pub const INGESTION_WORKERS: usize = 3;
pub const WEBHOOK_WORKERS: usize = 5;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const SCHEDULER_INTERVAL: Duration = Duration::from_secs(30);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
/// Completed jobs are archived after a day regardless of the failed-job
/// retention setting.
const ARCHIVE_COMPLETED_AFTER_HOURS: i64 = 24;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendOptions {
    pub retry_limit: Option<i32>,
    pub retry_delay_seconds: Option<i32>,
    pub retry_backoff: bool,
    pub expire_in_minutes: Option<i32>,
    pub singleton_key: Option<String>,
    pub singleton_seconds: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueJob {
    pub id: Uuid,
    pub queue: String,
    pub payload: Value,
    pub state: String,
    pub retry_limit: i32,
    pub retry_count: i32,
    pub retry_delay_seconds: i32,
    pub retry_backoff: bool,
    pub expire_in_minutes: i32,
    pub start_after: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub singleton_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, queue, payload, state, retry_limit, retry_count, \
                           retry_delay_seconds, retry_backoff, expire_in_minutes, start_after, \
                           started_at, singleton_key, created_at";

#[derive(Debug, Default, Clone, Serialize)]
pub struct QueueStats {
    pub created: i64,
    pub retry: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

// key: job-queue -> durable-queues
/// Handle over the PostgreSQL-backed queues. Initialised once at start-up
/// and passed into workers explicitly; shut down with the pool.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    settings: RuntimeSettings,
}

impl JobQueue {
    pub fn new(pool: PgPool, settings: RuntimeSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Enqueue a job. Returns `None` when a singleton key deduplicated the
    /// enqueue within its window.
    pub async fn send(
        &self,
        queue: &str,
        payload: &Value,
        opts: SendOptions,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        let singleton_on = match (&opts.singleton_key, opts.singleton_seconds) {
            (Some(_), Some(window)) if window > 0 => {
                let bucket = Utc::now().timestamp() / window * window;
                Some(Utc.timestamp_opt(bucket, 0).single().unwrap_or_else(Utc::now))
            }
            (Some(_), _) => Some(Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now)),
            _ => None,
        };

        let row = sqlx::query(
            "INSERT INTO queue_jobs \
             (queue, payload, retry_limit, retry_delay_seconds, retry_backoff, \
              expire_in_minutes, singleton_key, singleton_on) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (queue, singleton_key, singleton_on) \
                 WHERE singleton_key IS NOT NULL AND state IN ('created', 'retry', 'active') \
                 DO NOTHING \
             RETURNING id",
        )
        .bind(queue)
        .bind(payload)
        .bind(opts.retry_limit.unwrap_or(self.settings.job_retry_limit))
        .bind(
            opts.retry_delay_seconds
                .unwrap_or(self.settings.job_retry_delay_seconds),
        )
        .bind(opts.retry_backoff)
        .bind(opts.expire_in_minutes.unwrap_or(15))
        .bind(&opts.singleton_key)
        .bind(singleton_on)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.get("id"))),
            None => {
                info!(queue, singleton_key = ?opts.singleton_key, "enqueue deduplicated by singleton");
                Ok(None)
            }
        }
    }

    /// Register `concurrency` workers for a queue. Each worker claims one
    /// job at a time with `FOR UPDATE SKIP LOCKED`, runs it under the job's
    /// expiry budget, and applies the retry policy on failure.
    pub fn work<F, Fut>(&self, queue: &'static str, concurrency: usize, handler: F)
    where
        F: Fn(QueueJob) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        for worker in 0..concurrency {
            let runtime = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                info!(queue, worker, "queue worker started");
                loop {
                    match runtime.claim_next(queue).await {
                        Ok(Some(job)) => runtime.run_job(job, &handler).await,
                        Ok(None) => sleep(POLL_INTERVAL).await,
                        Err(err) => {
                            error!(?err, queue, "failed to claim next job");
                            sleep(POLL_INTERVAL).await;
                        }
                    }
                }
            });
        }
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<QueueJob>, sqlx::Error> {
        sqlx::query_as::<_, QueueJob>(&format!(
            "UPDATE queue_jobs SET state = 'active', started_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM queue_jobs \
                 WHERE queue = $1 AND state IN ('created', 'retry') AND start_after <= NOW() \
                 ORDER BY created_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
    }

    async fn run_job<F, Fut>(&self, job: QueueJob, handler: &F)
    where
        F: Fn(QueueJob) -> Fut,
        Fut: Future<Output = Result<(), anyhow::Error>>,
    {
        let id = job.id;
        let queue = job.queue.clone();
        let budget = Duration::from_secs(job.expire_in_minutes.max(1) as u64 * 60);
        let outcome = timeout(budget, handler(job.clone())).await;

        let result = match outcome {
            Ok(Ok(())) => self.complete(id).await,
            Ok(Err(err)) => {
                warn!(%id, queue = %queue, ?err, "job failed");
                self.fail_or_retry(&job, &format!("{err:#}"), false).await
            }
            Err(_) => {
                warn!(%id, queue = %queue, "job exceeded its expiry budget");
                self.fail_or_retry(&job, "job timed out", true).await
            }
        };
        if let Err(err) = result {
            error!(?err, %id, "failed to record job outcome");
        }
    }

    async fn complete(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE queue_jobs SET state = 'completed', completed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_or_retry(
        &self,
        job: &QueueJob,
        message: &str,
        is_timeout: bool,
    ) -> Result<(), sqlx::Error> {
        let output = json!({ "error": message, "isTimeout": is_timeout });
        if job.retry_count < job.retry_limit {
            let delay = if job.retry_backoff {
                job.retry_delay_seconds as i64 * (1i64 << job.retry_count.min(16))
            } else {
                job.retry_delay_seconds as i64
            };
            sqlx::query(
                "UPDATE queue_jobs SET \
                     state = 'retry', retry_count = retry_count + 1, \
                     start_after = NOW() + make_interval(secs => $2), output = $3 \
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(delay as f64)
            .bind(&output)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE queue_jobs SET state = 'failed', completed_at = NOW(), output = $2 \
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(&output)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Register (or replace) a cron emitter for a queue.
    pub async fn schedule(
        &self,
        queue: &str,
        cron: &str,
        timezone: Option<&str>,
        payload: &Value,
        opts: &SendOptions,
    ) -> Result<(), sqlx::Error> {
        let options = serde_json::to_value(opts).unwrap_or_else(|_| json!({}));
        sqlx::query(
            "INSERT INTO queue_schedules (queue, cron, timezone, payload, options) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (queue) DO UPDATE SET \
                 cron = EXCLUDED.cron, timezone = EXCLUDED.timezone, \
                 payload = EXCLUDED.payload, options = EXCLUDED.options, updated_at = NOW()",
        )
        .bind(queue)
        .bind(cron)
        .bind(timezone)
        .bind(payload)
        .bind(options)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unschedule(&self, queue: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM queue_schedules WHERE queue = $1")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cron evaluation loop. Each due tick enqueues with a singleton key
    /// derived from the tick instant, so restarts and multiple schedulers
    /// cannot double-fire.
    pub fn start_scheduler(&self) {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = runtime.fire_due_schedules().await {
                    error!(?err, "schedule sweep failed");
                }
                sleep(SCHEDULER_INTERVAL).await;
            }
        });
    }

    /// One scheduler sweep. Exposed so tests can drive ticks directly.
    pub async fn fire_due_schedules(&self) -> Result<(), sqlx::Error> {
        let rows = sqlx::query(
            "SELECT queue, cron, timezone, payload, options, last_fired_at, created_at \
             FROM queue_schedules",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let queue: String = row.get("queue");
            let cron: String = row.get("cron");
            let timezone: Option<String> = row.try_get("timezone").ok().flatten();
            let payload: Value = row.get("payload");
            let options: Value = row.get("options");
            let last_fired_at: Option<DateTime<Utc>> = row.try_get("last_fired_at").ok().flatten();
            let created_at: DateTime<Utc> = row.get("created_at");

            let Some(due) = next_occurrence(
                &cron,
                timezone.as_deref(),
                last_fired_at.unwrap_or(created_at),
            ) else {
                warn!(%queue, %cron, "unparseable cron expression; skipping schedule");
                continue;
            };
            if due > Utc::now() {
                continue;
            }

            let mut opts: SendOptions = serde_json::from_value(options).unwrap_or_default();
            opts.singleton_key = Some(format!("{queue}-{}", due.timestamp()));
            opts.singleton_seconds = opts.singleton_seconds.or(Some(60));
            self.send(&queue, &payload, opts).await?;
            sqlx::query("UPDATE queue_schedules SET last_fired_at = $2 WHERE queue = $1")
                .bind(&queue)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Housekeeping loop: requeue expired active jobs, archive settled
    /// jobs, and trim the archive per the retention settings.
    pub fn start_maintenance(&self) {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = runtime.run_maintenance().await {
                    error!(?err, "queue maintenance failed");
                }
                sleep(MAINTENANCE_INTERVAL).await;
            }
        });
    }

    async fn run_maintenance(&self) -> Result<(), sqlx::Error> {
        // Workers that died mid-job leave rows active past their expiry.
        sqlx::query(
            "UPDATE queue_jobs SET \
                 state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'failed' END, \
                 retry_count = retry_count + 1, \
                 completed_at = CASE WHEN retry_count < retry_limit THEN NULL ELSE NOW() END, \
                 start_after = NOW() + make_interval(secs => \
                     CASE WHEN retry_backoff \
                          THEN retry_delay_seconds * POWER(2, retry_count) \
                          ELSE retry_delay_seconds END), \
                 output = '{\"error\": \"job expired\", \"isTimeout\": true}'::jsonb \
             WHERE state = 'active' \
               AND started_at + make_interval(mins => expire_in_minutes) < NOW()",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "WITH settled AS ( \
                 DELETE FROM queue_jobs \
                 WHERE (state = 'failed' AND completed_at < NOW() - make_interval(days => $1)) \
                    OR (state = 'completed' AND completed_at < NOW() - make_interval(hours => $2)) \
                 RETURNING id, queue, payload, state, retry_count, output, created_at, completed_at) \
             INSERT INTO queue_jobs_archive \
                 (id, queue, payload, state, retry_count, output, created_at, completed_at) \
             SELECT id, queue, payload, state, retry_count, output, created_at, completed_at \
             FROM settled",
        )
        .bind(self.settings.job_archive_failed_after_days as i32)
        .bind(ARCHIVE_COMPLETED_AFTER_HOURS as i32)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "DELETE FROM queue_jobs_archive WHERE archived_at < NOW() - make_interval(days => $1)",
        )
        .bind(self.settings.job_delete_after_days as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS total FROM queue_jobs WHERE queue = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;
        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let total: i64 = row.get("total");
            match state.as_str() {
                "created" => stats.created = total,
                "retry" => stats.retry = total,
                "active" => stats.active = total,
                "completed" => stats.completed = total,
                "failed" => stats.failed = total,
                other => warn!(state = other, "unknown queue job state in stats"),
            }
        }
        Ok(stats)
    }
}

/// Next cron occurrence strictly after `after`, interpreted in the given
/// timezone (UTC by default). Accepts standard five-field expressions by
/// prepending a seconds column.
pub fn next_occurrence(
    cron: &str,
    timezone: Option<&str>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let normalised = if cron.split_whitespace().count() == 5 {
        format!("0 {cron}")
    } else {
        cron.to_string()
    };
    let schedule = Schedule::from_str(&normalised).ok()?;
    let tz: Tz = timezone.unwrap_or("UTC").parse().ok()?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|occurrence| occurrence.with_timezone(&Utc))
}
