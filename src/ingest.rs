use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Extension, http::StatusCode, Json};
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::circuit::CircuitBreaker;
use crate::classify::{
    determine_outcome, item_str, iter_items, map_appliance_outcome,
    map_certificate_type_to_code, map_document_type_to_category, normalise_address, Category,
    NormalisedAddress,
};
use crate::db::certificates::{self, ExtractionUpdate};
use crate::db::extraction_runs::{self, FinaliseRun};
use crate::db::extractions::{self, NewExtraction};
use crate::db::ingestion_jobs::{self, IngestionJob, NewIngestionJob};
use crate::db::properties;
use crate::db::remedial_actions::{self, NewRemedialAction};
use crate::db::webhook;
use crate::document_store::{DocumentStore, StoreError};
use crate::error::{AppError, AppResult};
use crate::events::{EventBroadcaster, LifecycleEvent};
use crate::extraction::{ExtractOptions, TieredExtractor, TieredResult, METHOD_MANUAL};
use crate::job_queue::{JobQueue, SendOptions, INGESTION_WORKERS, QUEUE_INGESTION};
use crate::linker;
use crate::llm::PROMPT_VERSION;
use crate::patterns;
use crate::remedial;
use crate::webhooks;

const MAX_JOB_ATTEMPTS: i32 = 3;
const BYTES_TIMEOUT: Duration = Duration::from_secs(60);
const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(300);
const STORE_BREAKER_KEY: &str = "document-store";
const STORE_BREAKER_THRESHOLD: u32 = 3;
const STORE_BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl IngestError {
    /// Everything here is transient from the queue's point of view; the
    /// terminal paths (missing input, idempotency skips) never surface as
    /// errors.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

pub struct IngestCoordinator {
    pool: PgPool,
    store: Arc<dyn DocumentStore>,
    extractor: Arc<TieredExtractor>,
    broadcaster: EventBroadcaster,
    store_breaker: CircuitBreaker,
}

impl IngestCoordinator {
    pub fn new(
        pool: PgPool,
        store: Arc<dyn DocumentStore>,
        extractor: Arc<TieredExtractor>,
        broadcaster: EventBroadcaster,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            store,
            extractor,
            broadcaster,
            store_breaker: CircuitBreaker::new(STORE_BREAKER_THRESHOLD, STORE_BREAKER_COOLDOWN),
        })
    }

    pub async fn process(&self, job_id: Uuid) -> Result<(), anyhow::Error> {
        self.process_with(job_id, &ExtractOptions::default()).await
    }

    /// Entry point for one dequeued ingestion job. Transient failures are
    /// re-thrown so the queue applies its retry policy; terminal outcomes
    /// return `Ok`.
    pub async fn process_with(
        &self,
        job_id: Uuid,
        opts: &ExtractOptions,
    ) -> Result<(), anyhow::Error> {
        let Some(job) = ingestion_jobs::get(&self.pool, job_id).await? else {
            warn!(%job_id, "ingestion job not found");
            return Ok(());
        };

        // Idempotency gate.
        if job.status == "COMPLETE" {
            return Ok(());
        }
        if job.status == "FAILED" && job.attempt_count >= MAX_JOB_ATTEMPTS {
            return Ok(());
        }
        if let Some(certificate_id) = job.certificate_id {
            if let Some(certificate) = certificates::get(&self.pool, certificate_id).await? {
                if certificate.status != "FAILED" {
                    info!(%job_id, %certificate_id, "job already produced a healthy certificate");
                    return Ok(());
                }
            }
        }

        let Some(job) =
            ingestion_jobs::try_begin_processing(&self.pool, job_id, MAX_JOB_ATTEMPTS).await?
        else {
            return Ok(());
        };

        match self.run(&job, opts).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_failure(&job, &err).await;
                if err.is_retryable() {
                    Err(err.into())
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn run(&self, job: &IngestionJob, opts: &ExtractOptions) -> Result<(), IngestError> {
        let Some(bytes) = self.load_bytes(job).await? else {
            self.handle_missing_input(job).await?;
            return Ok(());
        };

        // Create (or revive) the certificate and pin it onto the job
        // before extraction starts, so replays converge on one row.
        let certificate = match job.certificate_id {
            Some(id) => match certificates::get(&self.pool, id).await? {
                Some(existing) => {
                    certificates::update_status(&self.pool, id, "PROCESSING", None).await?;
                    existing
                }
                None => self.create_certificate(job, &bytes).await?,
            },
            None => self.create_certificate(job, &bytes).await?,
        };
        ingestion_jobs::mark_extracting(&self.pool, job.id).await?;

        let mime_type = job.mime_type.as_deref().unwrap_or("application/pdf");
        let category_hint = Category::from_db(&job.certificate_category);
        let result = timeout(
            EXTRACTION_TIMEOUT,
            self.extractor.extract(
                &self.pool,
                certificate.id,
                &bytes,
                mime_type,
                &job.file_name,
                category_hint,
                opts,
            ),
        )
        .await
        .map_err(|_| IngestError::Timeout("extraction"))??;

        self.persist(job, certificate.id, certificate.property_id, result)
            .await
    }

    async fn create_certificate(
        &self,
        job: &IngestionJob,
        bytes: &[u8],
    ) -> Result<crate::db::certificates::Certificate, IngestError> {
        let certificate = certificates::create(
            &self.pool,
            job.property_id,
            &job.certificate_category,
            &job.file_name,
            Some(bytes.len() as i64),
            job.mime_type.as_deref(),
        )
        .await?;
        ingestion_jobs::pin_certificate(&self.pool, job.id, certificate.id).await?;
        Ok(certificate)
    }

    /// Byte sources in preference order: inline base64, then the document
    /// store behind a circuit breaker and a 60-second budget. `None` means
    /// no source could produce bytes, which is terminal for the job.
    async fn load_bytes(&self, job: &IngestionJob) -> Result<Option<Vec<u8>>, IngestError> {
        if let Some(encoded) = &job.file_base64 {
            match base64::engine::general_purpose::STANDARD.decode(encoded) {
                Ok(bytes) if !bytes.is_empty() => return Ok(Some(bytes)),
                Ok(_) => warn!(job_id = %job.id, "inline payload was empty"),
                Err(err) => warn!(?err, job_id = %job.id, "inline payload was not valid base64"),
            }
        }

        let Some(key) = job.storage_key.as_deref().filter(|key| !key.is_empty()) else {
            return Ok(None);
        };
        if !self.store_breaker.allows(STORE_BREAKER_KEY) {
            return Err(IngestError::StoreUnavailable("circuit open".into()));
        }
        match timeout(BYTES_TIMEOUT, self.store.fetch(key)).await {
            Ok(Ok(bytes)) => {
                self.store_breaker.record_success(STORE_BREAKER_KEY);
                Ok(Some(bytes))
            }
            Ok(Err(StoreError::NotFound(key))) => {
                self.store_breaker.record_success(STORE_BREAKER_KEY);
                warn!(%key, "document missing from store");
                Ok(None)
            }
            Ok(Err(StoreError::Unavailable(detail))) => {
                self.store_breaker.record_failure(STORE_BREAKER_KEY);
                Err(IngestError::StoreUnavailable(detail))
            }
            Err(_) => {
                self.store_breaker.record_failure(STORE_BREAKER_KEY);
                Err(IngestError::Timeout("document fetch"))
            }
        }
    }

    /// No bytes from any source. Terminal: stub a MANUAL extraction, park
    /// the certificate for review, fail the job without re-throwing.
    async fn handle_missing_input(&self, job: &IngestionJob) -> Result<(), IngestError> {
        let certificate = match job.certificate_id {
            Some(id) => certificates::get(&self.pool, id).await?,
            None => None,
        };
        let certificate = match certificate {
            Some(existing) => existing,
            None => {
                let created = certificates::create(
                    &self.pool,
                    job.property_id,
                    &job.certificate_category,
                    &job.file_name,
                    None,
                    job.mime_type.as_deref(),
                )
                .await?;
                ingestion_jobs::pin_certificate(&self.pool, job.id, created.id).await?;
                created
            }
        };

        let stub = json!({ "requiresManualUpload": true });
        extractions::insert(
            &self.pool,
            NewExtraction {
                certificate_id: certificate.id,
                method: METHOD_MANUAL,
                model: None,
                prompt_version: None,
                payload: &stub,
                confidence: None,
                text_quality: None,
            },
        )
        .await?;
        certificates::update_status(
            &self.pool,
            certificate.id,
            "NEEDS_REVIEW",
            Some("Document bytes unavailable; manual upload required"),
        )
        .await?;
        ingestion_jobs::mark_failed(
            &self.pool,
            job.id,
            "No document bytes available from any source",
            &json!({ "error": "missing_input" }),
        )
        .await?;

        self.emit_failure_events(job, Some(certificate.id)).await;
        warn!(job_id = %job.id, "ingestion terminal: no document bytes");
        Ok(())
    }

    async fn persist(
        &self,
        job: &IngestionJob,
        certificate_id: Uuid,
        property_id: Uuid,
        result: TieredResult,
    ) -> Result<(), IngestError> {
        let payload = &result.payload;

        let raw_type = payload
            .get("certificateType")
            .or_else(|| payload.get("documentType"))
            .and_then(Value::as_str)
            .unwrap_or(&job.certificate_category);
        let mut category = map_certificate_type_to_code(raw_type).to_string();
        if category == "UNKNOWN" {
            category = if job.certificate_category != "OTHER" {
                job.certificate_category.clone()
            } else {
                payload
                    .get("documentType")
                    .and_then(Value::as_str)
                    .map(|document_type| {
                        map_document_type_to_category(document_type).as_str().to_string()
                    })
                    .unwrap_or_else(|| "OTHER".to_string())
            };
        }

        let outcome = determine_outcome(&category, payload);
        let certificate_number = payload.get("certificateNumber").and_then(Value::as_str);
        let issue_date = payload
            .get("issueDate")
            .and_then(Value::as_str)
            .and_then(patterns::parse_date);
        let expiry_date = payload
            .get("expiryDate")
            .or_else(|| payload.get("nextInspectionDate"))
            .or_else(|| payload.get("nextExaminationDate"))
            .and_then(Value::as_str)
            .and_then(patterns::parse_date);
        let address = payload
            .get("address")
            .map(normalise_address)
            .unwrap_or_default();
        let appliances: Vec<Value> = iter_items(payload, &["appliances"])
            .map(|appliance| {
                json!({
                    "type": item_str(appliance, &["type", "appliance"]),
                    "location": item_str(appliance, &["location"]),
                    "outcome": item_str(appliance, &["outcome", "status", "result"])
                        .and_then(map_appliance_outcome),
                })
            })
            .collect();

        let normalised = json!({
            "certificateType": category,
            "certificateNumber": certificate_number,
            "issueDate": issue_date.map(|date| date.to_string()),
            "expiryDate": expiry_date.map(|date| date.to_string()),
            "outcome": outcome.as_str(),
            "address": {
                "line1": address.line1,
                "city": address.city,
                "postcode": address.postcode,
            },
            "appliances": appliances,
            "ocrProvider": result.ocr_provider,
        });

        let mut tx = self.pool.begin().await?;
        extractions::insert(
            &mut *tx,
            NewExtraction {
                certificate_id,
                method: result.method,
                model: result.model.as_deref(),
                prompt_version: result.model.is_some().then_some(PROMPT_VERSION),
                payload,
                confidence: Some(result.confidence),
                text_quality: Some(result.text_quality),
            },
        )
        .await?;
        extraction_runs::finalise(
            &mut *tx,
            result.run_id,
            FinaliseRun {
                document_type: result.document_type.as_deref(),
                classification_confidence: Some(result.confidence),
                raw_output: payload,
                validated_output: result.validation_passed.then_some(payload),
                normalised_output: Some(&normalised),
                final_tier: result.tier.ordinal(),
                tier_name: result.tier.as_str(),
                processing_time_ms: result.processing_time_ms,
                processing_cost_pence: result.cost_pence,
                validation_passed: result.validation_passed,
                status: if result.validation_passed {
                    "AWAITING_REVIEW"
                } else {
                    "VALIDATION_FAILED"
                },
            },
        )
        .await?;
        certificates::apply_extraction(
            &mut *tx,
            certificate_id,
            ExtractionUpdate {
                category: &category,
                certificate_number,
                issue_date,
                expiry_date,
                outcome: outcome.as_str(),
                extracted_metadata: payload,
                status: "NEEDS_REVIEW",
            },
        )
        .await?;
        properties::update_extracted_metadata(
            &mut *tx,
            property_id,
            &json!({
                "lastCertificateId": certificate_id,
                "lastCategory": category,
                "address": normalised["address"],
            }),
        )
        .await?;
        let address_updated = if address_looks_valid(&address) {
            let line1 = address.line1.as_deref().unwrap_or_default();
            properties::update_address(
                &mut *tx,
                property_id,
                line1,
                address.city.as_deref(),
                address.postcode.as_deref(),
            )
            .await?;
            true
        } else {
            false
        };
        tx.commit().await?;

        // The rulebook is loaded per call so config edits take effect on
        // the next certificate.
        let now = Utc::now();
        let actions = remedial::generate_actions(&self.pool, &category, payload, outcome).await;
        for action in &actions {
            remedial_actions::insert(
                &self.pool,
                NewRemedialAction {
                    certificate_id,
                    property_id,
                    code: &action.code,
                    description: &action.description,
                    location: &action.location,
                    severity: action.severity.as_str(),
                    due_date: action.severity.due_date(now),
                    cost_estimate: &action.cost_estimate,
                },
            )
            .await?;
        }

        linker::link_components(&self.pool, property_id, &category, payload).await?;
        linker::link_contractor(&self.pool, payload).await?;

        ingestion_jobs::mark_complete(&self.pool, job.id, "Ingestion complete").await?;

        if let Some(url) = job.webhook_url.as_deref() {
            webhooks::ensure_endpoint_for_url(&self.pool, url).await?;
        }
        webhook::insert_event(
            &self.pool,
            "ingestion.completed",
            "ingestion_job",
            &job.id.to_string(),
            &json!({
                "jobId": job.id,
                "certificateId": certificate_id,
                "propertyId": property_id,
                "category": category,
                "outcome": outcome.as_str(),
                "actionCount": actions.len(),
            }),
        )
        .await?;

        self.broadcaster.broadcast(LifecycleEvent::ExtractionComplete {
            certificate_id,
            property_id: Some(property_id),
            status: Some("NEEDS_REVIEW".into()),
        });
        self.broadcaster.broadcast(LifecycleEvent::CertificateUpdated {
            certificate_id,
            status: "NEEDS_REVIEW".into(),
        });
        if address_updated {
            self.broadcaster
                .broadcast(LifecycleEvent::PropertyUpdated { property_id });
        }

        info!(
            job_id = %job.id,
            %certificate_id,
            category = %category,
            outcome = outcome.as_str(),
            tier = result.tier.as_str(),
            actions = actions.len(),
            "ingestion complete"
        );
        Ok(())
    }

    async fn record_failure(&self, job: &IngestionJob, err: &IngestError) {
        error!(?err, job_id = %job.id, "ingestion failed");
        let details = json!({
            "error": err.to_string(),
            "detail": format!("{err:?}"),
            "isTimeout": matches!(err, IngestError::Timeout(_)),
        });
        if let Err(db_err) =
            ingestion_jobs::mark_failed(&self.pool, job.id, &err.to_string(), &details).await
        {
            error!(?db_err, job_id = %job.id, "failed to record job failure");
        }

        let certificate_id = match ingestion_jobs::get(&self.pool, job.id).await {
            Ok(Some(fresh)) => fresh.certificate_id,
            _ => job.certificate_id,
        };
        if let Some(certificate_id) = certificate_id {
            if let Err(db_err) = certificates::update_status(
                &self.pool,
                certificate_id,
                "FAILED",
                Some(&err.to_string()),
            )
            .await
            {
                error!(?db_err, %certificate_id, "failed to fail certificate");
            }
        }
        self.emit_failure_events(job, certificate_id).await;
    }

    async fn emit_failure_events(&self, job: &IngestionJob, certificate_id: Option<Uuid>) {
        if let Some(url) = job.webhook_url.as_deref() {
            let _ = webhooks::ensure_endpoint_for_url(&self.pool, url).await;
        }
        let _ = webhook::insert_event(
            &self.pool,
            "ingestion.failed",
            "ingestion_job",
            &job.id.to_string(),
            &json!({
                "jobId": job.id,
                "certificateId": certificate_id,
                "propertyId": job.property_id,
            }),
        )
        .await;
        if let Some(certificate_id) = certificate_id {
            self.broadcaster.broadcast(LifecycleEvent::ExtractionFailed {
                certificate_id,
                property_id: Some(job.property_id),
                status: Some("FAILED".into()),
            });
        }
    }
}

fn address_looks_valid(address: &NormalisedAddress) -> bool {
    let line1_ok = address
        .line1
        .as_deref()
        .map(|line1| line1.len() > 5)
        .unwrap_or(false);
    let city_ok = address
        .city
        .as_deref()
        .map(|city| !city.eq_ignore_ascii_case("To Be Verified"))
        .unwrap_or(true);
    let postcode_ok = address
        .postcode
        .as_deref()
        .map(|postcode| postcode != "UNKNOWN")
        .unwrap_or(true);
    line1_ok && city_ok && postcode_ok
}

/// Hook the coordinator onto the `certificate-ingestion` queue.
pub fn register_workers(queue: &JobQueue, coordinator: Arc<IngestCoordinator>) {
    queue.work(QUEUE_INGESTION, INGESTION_WORKERS, move |job| {
        let coordinator = coordinator.clone();
        async move {
            let job_id = job
                .payload
                .get("jobId")
                .and_then(Value::as_str)
                .and_then(|raw| Uuid::parse_str(raw).ok())
                .ok_or_else(|| anyhow::anyhow!("ingestion job payload missing jobId"))?;
            let opts = ExtractOptions {
                force_ai: job
                    .payload
                    .get("forceAi")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            };
            coordinator.process_with(job_id, &opts).await
        }
    });
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIngestionJob {
    pub property_id: Uuid,
    pub certificate_type: String,
    pub file_name: String,
    pub object_path: Option<String>,
    pub file_base64: Option<String>,
    pub mime_type: Option<String>,
    pub webhook_url: Option<String>,
    pub singleton_key: Option<String>,
    #[serde(default)]
    pub force_ai: bool,
}

/// `POST /ingestion-jobs`: create the job row and enqueue it.
pub async fn create_ingestion_job(
    Extension(pool): Extension<PgPool>,
    Extension(queue): Extension<JobQueue>,
    Json(request): Json<CreateIngestionJob>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if request.object_path.is_none() && request.file_base64.is_none() {
        return Err(AppError::BadRequest(
            "one of objectPath or fileBase64 is required".into(),
        ));
    }
    let property = properties::get(&pool, request.property_id).await?;
    if property.is_none() {
        return Err(AppError::NotFound);
    }

    let category = Category::from_db(&request.certificate_type.to_uppercase());
    let job = ingestion_jobs::create(
        &pool,
        NewIngestionJob {
            property_id: request.property_id,
            certificate_category: category.as_str(),
            file_name: &request.file_name,
            storage_key: request.object_path.as_deref(),
            file_base64: request.file_base64.as_deref(),
            mime_type: request.mime_type.as_deref(),
            webhook_url: request.webhook_url.as_deref(),
        },
    )
    .await?;

    queue
        .send(
            QUEUE_INGESTION,
            &json!({ "jobId": job.id, "forceAi": request.force_ai }),
            SendOptions {
                retry_limit: Some(MAX_JOB_ATTEMPTS),
                retry_backoff: true,
                singleton_key: request.singleton_key,
                singleton_seconds: Some(60),
                ..SendOptions::default()
            },
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job.id }))))
}
