use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::db::factory_settings;
use crate::job_queue::{
    next_occurrence, JobQueue, SendOptions, QUEUE_MV_REFRESH, QUEUE_PATTERN_ANALYSIS,
    QUEUE_RATE_LIMIT_CLEANUP, QUEUE_REPORTING_REFRESH, QUEUE_SCHEDULED_REPORT,
};

/// Materialised views refreshed by the reporting queues, overridable via
/// the `REPORTING_VIEWS` factory setting (comma-separated).
const DEFAULT_REPORTING_VIEWS: &str = "mv_compliance_summary,mv_action_backlog";

pub async fn cleanup_rate_limits(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM rate_limits WHERE expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Trigger point for the downstream analytics views. The view definitions
/// belong to the reporting layer; we only drive the refresh.
pub async fn refresh_reporting_views(pool: &PgPool) -> Result<(), sqlx::Error> {
    let views = factory_settings::get(pool, "REPORTING_VIEWS")
        .await?
        .unwrap_or_else(|| DEFAULT_REPORTING_VIEWS.to_string());
    for view in views.split(',').map(str::trim).filter(|view| !view.is_empty()) {
        if !view.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            warn!(view, "skipping view with unexpected characters");
            continue;
        }
        let statement = format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {view}");
        if let Err(err) = sqlx::query(&statement).execute(pool).await {
            warn!(?err, view, "materialised view refresh failed");
        } else {
            info!(view, "materialised view refreshed");
        }
    }
    Ok(())
}

/// Materialise every due scheduled report into `generated_reports`. The
/// report cadence comes from `parameters->>'cron'`, defaulting to daily.
pub async fn run_due_reports(pool: &PgPool) -> Result<usize, sqlx::Error> {
    let due = sqlx::query(
        "SELECT id, report_type, parameters FROM scheduled_reports \
         WHERE active AND (next_run_at IS NULL OR next_run_at <= NOW())",
    )
    .fetch_all(pool)
    .await?;

    let mut generated = 0;
    for row in due {
        let id: uuid::Uuid = row.get("id");
        let report_type: String = row.get("report_type");
        let parameters: Value = row.get("parameters");

        let payload = build_report_payload(pool, &report_type).await?;
        sqlx::query(
            "INSERT INTO generated_reports (scheduled_report_id, report_type, parameters, payload) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(&report_type)
        .bind(&parameters)
        .bind(&payload)
        .execute(pool)
        .await?;

        let cron = parameters
            .get("cron")
            .and_then(Value::as_str)
            .unwrap_or("0 6 * * *");
        let next = next_occurrence(cron, None, Utc::now())
            .unwrap_or_else(|| Utc::now() + Duration::days(1));
        sqlx::query(
            "UPDATE scheduled_reports SET last_run_at = NOW(), next_run_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(next)
        .execute(pool)
        .await?;
        generated += 1;
    }
    Ok(generated)
}

async fn build_report_payload(pool: &PgPool, report_type: &str) -> Result<Value, sqlx::Error> {
    let certificates_by_status = sqlx::query(
        "SELECT status, COUNT(*) AS total FROM certificates GROUP BY status",
    )
    .fetch_all(pool)
    .await?;
    let open_actions: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM remedial_actions WHERE status IN ('OPEN', 'IN_PROGRESS')",
    )
    .fetch_one(pool)
    .await?;
    let overdue_actions: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM remedial_actions \
         WHERE status IN ('OPEN', 'IN_PROGRESS') AND due_date < NOW()",
    )
    .fetch_one(pool)
    .await?;

    let statuses: Value = certificates_by_status
        .into_iter()
        .map(|row| {
            let status: String = row.get("status");
            let total: i64 = row.get("total");
            (status, json!(total))
        })
        .collect::<serde_json::Map<_, _>>()
        .into();

    Ok(json!({
        "reportType": report_type,
        "generatedAt": Utc::now().to_rfc3339(),
        "certificatesByStatus": statuses,
        "openActions": open_actions,
        "overdueActions": overdue_actions,
    }))
}

/// Recompute per-category extraction success rates so threshold tuning has
/// data to work from. Stored as a factory setting for the ops surfaces.
pub async fn analyse_extraction_patterns(pool: &PgPool) -> Result<(), sqlx::Error> {
    let rows = sqlx::query(
        "SELECT c.category, \
                COUNT(*) AS runs, \
                COUNT(*) FILTER (WHERE r.validation_passed) AS passed, \
                AVG(r.final_tier)::float8 AS mean_tier \
         FROM extraction_runs r \
         JOIN certificates c ON c.id = r.certificate_id \
         GROUP BY c.category",
    )
    .fetch_all(pool)
    .await?;

    let mut stats = serde_json::Map::new();
    for row in rows {
        let category: String = row.get("category");
        let runs: i64 = row.get("runs");
        let passed: i64 = row.get("passed");
        let mean_tier: Option<f64> = row.try_get("mean_tier").ok().flatten();
        stats.insert(
            category,
            json!({
                "runs": runs,
                "passed": passed,
                "passRate": if runs > 0 { passed as f64 / runs as f64 } else { 0.0 },
                "meanFinalTier": mean_tier,
            }),
        );
    }

    let encoded = Value::Object(stats).to_string();
    factory_settings::set(pool, "PATTERN_STATS", &encoded).await?;
    info!("extraction pattern statistics refreshed");
    Ok(())
}

/// Wire the maintenance and reporting queues: one worker each, plus their
/// cron schedules. The mv-refresh schedule runs in the configured
/// reporting timezone; everything else is UTC.
pub async fn register(queue: &JobQueue, reporting_timezone: &str) -> Result<(), sqlx::Error> {
    let cleanup_queue = queue.clone();
    queue.work(QUEUE_RATE_LIMIT_CLEANUP, 1, move |_job| {
        let pool = cleanup_queue.pool().clone();
        async move {
            cleanup_rate_limits(&pool).await?;
            Ok(())
        }
    });
    let refresh_queue = queue.clone();
    queue.work(QUEUE_REPORTING_REFRESH, 1, move |_job| {
        let pool = refresh_queue.pool().clone();
        async move {
            refresh_reporting_views(&pool).await?;
            Ok(())
        }
    });
    let mv_queue = queue.clone();
    queue.work(QUEUE_MV_REFRESH, 1, move |_job| {
        let pool = mv_queue.pool().clone();
        async move {
            refresh_reporting_views(&pool).await?;
            Ok(())
        }
    });
    let report_queue = queue.clone();
    queue.work(QUEUE_SCHEDULED_REPORT, 1, move |_job| {
        let pool = report_queue.pool().clone();
        async move {
            run_due_reports(&pool).await?;
            Ok(())
        }
    });
    let pattern_queue = queue.clone();
    queue.work(QUEUE_PATTERN_ANALYSIS, 1, move |_job| {
        let pool = pattern_queue.pool().clone();
        async move {
            analyse_extraction_patterns(&pool).await?;
            Ok(())
        }
    });

    let empty = json!({});
    let opts = SendOptions::default();
    queue
        .schedule(QUEUE_RATE_LIMIT_CLEANUP, "15 * * * *", None, &empty, &opts)
        .await?;
    queue
        .schedule(QUEUE_REPORTING_REFRESH, "*/30 * * * *", None, &empty, &opts)
        .await?;
    queue
        .schedule(
            QUEUE_MV_REFRESH,
            "0 2 * * *",
            Some(reporting_timezone),
            &empty,
            &opts,
        )
        .await?;
    queue
        .schedule(QUEUE_SCHEDULED_REPORT, "*/10 * * * *", None, &empty, &opts)
        .await?;
    queue
        .schedule(QUEUE_PATTERN_ANALYSIS, "30 3 * * *", None, &empty, &opts)
        .await?;
    Ok(())
}
