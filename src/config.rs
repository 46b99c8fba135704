use once_cell::sync::Lazy;
use sqlx::PgPool;
use tracing::warn;

/// Address the HTTP listener binds to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP listener binds to. Defaults to `8080`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080)
});

/// Root directory for the local document store. Defaults to `storage`.
pub static DOCUMENT_STORE_ROOT: Lazy<String> =
    Lazy::new(|| std::env::var("DOCUMENT_STORE_ROOT").unwrap_or_else(|_| "storage".to_string()));

/// Document-Intelligence analyze endpoint. The OCR tier reports itself
/// unavailable when unset.
pub static OCR_ENDPOINT: Lazy<Option<String>> = Lazy::new(|| std::env::var("OCR_ENDPOINT").ok());

/// API key for the Document-Intelligence service.
pub static OCR_API_KEY: Lazy<Option<String>> = Lazy::new(|| std::env::var("OCR_API_KEY").ok());

/// Messages endpoint of the multimodal LLM used by the vision tier.
pub static LLM_API_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("LLM_API_URL").unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".into())
});

/// API key for the vision LLM. The vision tier is skipped when unset.
pub static LLM_API_KEY: Lazy<Option<String>> = Lazy::new(|| std::env::var("LLM_API_KEY").ok());

/// Model identifier recorded against extractions.
pub static LLM_MODEL: Lazy<String> = Lazy::new(|| {
    std::env::var("LLM_MODEL").unwrap_or_else(|_| "claude-3-5-sonnet-latest".to_string())
});

/// Timezone used by the materialised-view refresh schedule.
pub static REPORTING_TIMEZONE: Lazy<String> = Lazy::new(|| {
    std::env::var("REPORTING_TIMEZONE").unwrap_or_else(|_| "Europe/London".to_string())
});

/// Runtime tunables sourced from the `factory_settings` table at start-up.
/// Every field falls back to its named default when the table is unreachable
/// or the key is absent.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub job_retry_limit: i32,
    pub job_retry_delay_seconds: i32,
    pub job_archive_failed_after_days: i64,
    pub job_delete_after_days: i64,
    pub watchdog_interval_minutes: i64,
    pub processing_timeout_minutes: i64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            job_retry_limit: 3,
            job_retry_delay_seconds: 30,
            job_archive_failed_after_days: 7,
            job_delete_after_days: 30,
            watchdog_interval_minutes: 5,
            processing_timeout_minutes: 20,
        }
    }
}

impl RuntimeSettings {
    pub async fn load(pool: &PgPool) -> Self {
        let defaults = Self::default();
        let settings = match crate::db::factory_settings::load_all(pool).await {
            Ok(map) => map,
            Err(err) => {
                warn!(?err, "factory_settings unreachable; using default settings");
                return defaults;
            }
        };

        let get = |key: &str, fallback: i64| -> i64 {
            match settings.get(key) {
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    warn!(key, %raw, "unparseable factory setting; using default");
                    fallback
                }),
                None => fallback,
            }
        };

        Self {
            job_retry_limit: get("JOB_RETRY_LIMIT", defaults.job_retry_limit as i64) as i32,
            job_retry_delay_seconds: get(
                "JOB_RETRY_DELAY_SECONDS",
                defaults.job_retry_delay_seconds as i64,
            ) as i32,
            job_archive_failed_after_days: get(
                "JOB_ARCHIVE_FAILED_AFTER_DAYS",
                defaults.job_archive_failed_after_days,
            ),
            job_delete_after_days: get("JOB_DELETE_AFTER_DAYS", defaults.job_delete_after_days),
            watchdog_interval_minutes: get(
                "CERTIFICATE_WATCHDOG_INTERVAL_MINUTES",
                defaults.watchdog_interval_minutes,
            ),
            processing_timeout_minutes: get(
                "CERTIFICATE_PROCESSING_TIMEOUT_MINUTES",
                defaults.processing_timeout_minutes,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.job_retry_limit, 3);
        assert_eq!(settings.job_archive_failed_after_days, 7);
        assert_eq!(settings.job_delete_after_days, 30);
        assert_eq!(settings.watchdog_interval_minutes, 5);
        assert_eq!(settings.processing_timeout_minutes, 20);
    }
}
