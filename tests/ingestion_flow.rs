use std::sync::Arc;

use base64::Engine;
use chrono::{Duration, Utc};
use httpmock::prelude::*;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use compliance_host::db::{extraction_runs, ingestion_jobs, remedial_actions};
use compliance_host::document_store::MemoryDocumentStore;
use compliance_host::events::EventBroadcaster;
use compliance_host::extraction::TieredExtractor;
use compliance_host::ingest::IngestCoordinator;
use compliance_host::llm::LlmClient;
use compliance_host::ocr::OcrClient;

async fn create_property(pool: &PgPool) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO properties (address_line1, city, postcode) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind("1 Test Street")
    .bind("Leeds")
    .bind("LS1 1AA")
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn create_job(pool: &PgPool, property_id: Uuid, category: &str) -> Uuid {
    let encoded = base64::engine::general_purpose::STANDARD.encode(b"\xff\xd8\xff\xe0 fake jpeg");
    let job = ingestion_jobs::create(
        pool,
        ingestion_jobs::NewIngestionJob {
            property_id,
            certificate_category: category,
            file_name: "certificate.jpg",
            storage_key: None,
            file_base64: Some(&encoded),
            mime_type: Some("image/jpeg"),
            webhook_url: None,
        },
    )
    .await
    .unwrap();
    job.id
}

fn mock_llm<'a>(server: &'a MockServer, extraction: &Value) -> httpmock::Mock<'a> {
    let body = json!({
        "content": [{
            "type": "text",
            "text": format!("```json\n{extraction}\n```"),
        }]
    });
    server.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(body);
    })
}

fn coordinator(pool: &PgPool, server: &MockServer) -> Arc<IngestCoordinator> {
    let extractor = Arc::new(TieredExtractor::new(
        OcrClient::new(None, None),
        LlmClient::new(
            server.url("/v1/messages"),
            Some("test-key".into()),
            "claude-test".into(),
        ),
    ));
    IngestCoordinator::new(
        pool.clone(),
        Arc::new(MemoryDocumentStore::new()),
        extractor,
        EventBroadcaster::new(),
    )
}

#[sqlx::test]
async fn eicr_image_with_c2_observations_is_unsatisfactory(pool: PgPool) {
    let server = MockServer::start_async().await;
    let extraction = json!({
        "documentType": "EICR",
        "certificateType": "EICR",
        "certificateNumber": "EICR-2024-001",
        "issueDate": "2024-03-14",
        "c2Count": 2,
        "observations": [
            {"code": "C2", "description": "Loose earth", "location": "Kitchen"}
        ]
    });
    let _mock = mock_llm(&server, &extraction);

    let property_id = create_property(&pool).await;
    let job_id = create_job(&pool, property_id, "EICR").await;
    coordinator(&pool, &server).process(job_id).await.unwrap();

    let job = ingestion_jobs::get(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "COMPLETE");
    let certificate_id = job.certificate_id.unwrap();

    let certificate = compliance_host::db::certificates::get(&pool, certificate_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(certificate.status, "NEEDS_REVIEW");
    assert_eq!(certificate.outcome.as_deref(), Some("UNSATISFACTORY"));
    assert_eq!(certificate.category, "EICR");
    assert_eq!(certificate.certificate_number.as_deref(), Some("EICR-2024-001"));

    let actions = remedial_actions::list_for_certificate(&pool, certificate_id)
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].code, "C2");
    assert_eq!(actions[0].severity, "URGENT");
    let due_in = (actions[0].due_date - Utc::now()).num_hours();
    assert!((167..=168).contains(&due_in), "due in {due_in}h");

    // One run; the vision tier won; audits are strictly tier-ordered.
    let run_id = extraction_runs::latest_run_for_certificate(&pool, certificate_id)
        .await
        .unwrap()
        .unwrap();
    let audits = extraction_runs::audits_for_run(&pool, run_id).await.unwrap();
    assert!(!audits.is_empty());
    for pair in audits.windows(2) {
        assert!(pair[0].tier_order < pair[1].tier_order);
    }
    let vision = audits.iter().find(|audit| audit.tier_name == "tier-3").unwrap();
    assert_eq!(vision.status, "success");

    let extractions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM extractions WHERE certificate_id = $1")
            .bind(certificate_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(extractions, 1);

    let events: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM webhook_events WHERE event_type = 'ingestion.completed'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(events, 1);
}

#[sqlx::test]
async fn clean_gas_record_is_satisfactory_and_links_a_component(pool: PgPool) {
    let server = MockServer::start_async().await;
    let extraction = json!({
        "certificateType": "Landlord Gas Safety Record",
        "certificateNumber": "GSR-77",
        "issueDate": "2024-02-01",
        "expiryDate": "2025-02-01",
        "address": {"addressLine1": "1 Test Street", "city": "Leeds", "postcode": "LS1 1AA"},
        "engineer": {"name": "A Fitter", "registrationNumber": "GS-12345", "company": "HeatCo"},
        "appliances": [{
            "type": "Gas Boiler",
            "location": "Kitchen",
            "applianceSafe": true,
            "outcome": "Pass",
            "serialNumber": "SN-9000"
        }]
    });
    let _mock = mock_llm(&server, &extraction);

    let property_id = create_property(&pool).await;
    let job_id = create_job(&pool, property_id, "GAS_SAFETY").await;
    coordinator(&pool, &server).process(job_id).await.unwrap();

    let job = ingestion_jobs::get(&pool, job_id).await.unwrap().unwrap();
    let certificate_id = job.certificate_id.unwrap();
    let certificate = compliance_host::db::certificates::get(&pool, certificate_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(certificate.category, "GAS_SAFETY");
    assert_eq!(certificate.outcome.as_deref(), Some("SATISFACTORY"));

    let actions = remedial_actions::list_for_certificate(&pool, certificate_id)
        .await
        .unwrap();
    assert!(actions.is_empty());

    let component_type: String =
        sqlx::query_scalar("SELECT component_type FROM components WHERE property_id = $1")
            .bind(property_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(component_type, "Gas Boiler");

    let contractor: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM contractors WHERE registration_number = 'GS-12345'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(contractor, 1);
}

#[sqlx::test]
async fn replaying_a_complete_job_changes_nothing(pool: PgPool) {
    let server = MockServer::start_async().await;
    let extraction = json!({
        "certificateType": "EPC",
        "certificateNumber": "EPC-1",
        "issueDate": "2024-01-10",
        "currentRating": "C"
    });
    let _mock = mock_llm(&server, &extraction);

    let property_id = create_property(&pool).await;
    let job_id = create_job(&pool, property_id, "EPC").await;
    let coordinator = coordinator(&pool, &server);
    coordinator.process(job_id).await.unwrap();

    let counts = || async {
        let certificates: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM certificates")
            .fetch_one(&pool)
            .await
            .unwrap();
        let extractions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM extractions")
            .fetch_one(&pool)
            .await
            .unwrap();
        let runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM extraction_runs")
            .fetch_one(&pool)
            .await
            .unwrap();
        (certificates, extractions, runs)
    };
    let before = counts().await;
    assert_eq!(before, (1, 1, 1));

    coordinator.process(job_id).await.unwrap();
    assert_eq!(counts().await, before);
}

#[sqlx::test]
async fn missing_bytes_are_terminal_with_a_manual_stub(pool: PgPool) {
    let server = MockServer::start_async().await;
    let property_id = create_property(&pool).await;
    let job = ingestion_jobs::create(
        &pool,
        ingestion_jobs::NewIngestionJob {
            property_id,
            certificate_category: "GAS_SAFETY",
            file_name: "lost.pdf",
            storage_key: Some("missing/lost.pdf"),
            file_base64: None,
            mime_type: Some("application/pdf"),
            webhook_url: None,
        },
    )
    .await
    .unwrap();

    // Does not re-throw: a missing document is not retryable.
    coordinator(&pool, &server).process(job.id).await.unwrap();

    let job = ingestion_jobs::get(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(job.status, "FAILED");
    let certificate_id = job.certificate_id.unwrap();
    let certificate = compliance_host::db::certificates::get(&pool, certificate_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(certificate.status, "NEEDS_REVIEW");

    let (method, payload): (String, Value) = sqlx::query_as(
        "SELECT method, payload FROM extractions WHERE certificate_id = $1",
    )
    .bind(certificate_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(method, "MANUAL");
    assert_eq!(payload["requiresManualUpload"], true);

    let failed_events: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM webhook_events WHERE event_type = 'ingestion.failed'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(failed_events, 1);
}

#[sqlx::test]
async fn failed_llm_parks_the_certificate_for_review(pool: PgPool) {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "content": [{"type": "text", "text": "I could not read this document."}]
            }));
    });

    let property_id = create_property(&pool).await;
    let job_id = create_job(&pool, property_id, "GAS_SAFETY").await;
    coordinator(&pool, &server).process(job_id).await.unwrap();

    let job = ingestion_jobs::get(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "COMPLETE");
    let certificate_id = job.certificate_id.unwrap();

    let run_id = extraction_runs::latest_run_for_certificate(&pool, certificate_id)
        .await
        .unwrap()
        .unwrap();
    let audits = extraction_runs::audits_for_run(&pool, run_id).await.unwrap();
    let vision = audits.iter().find(|audit| audit.tier_name == "tier-3").unwrap();
    assert_eq!(vision.status, "failed");
    assert_eq!(vision.escalation_reason.as_deref(), Some("invalid_json"));
    let review = audits.iter().find(|audit| audit.tier_name == "tier-4").unwrap();
    assert_eq!(review.status, "pending");

    let (final_tier, validation_passed): (i32, bool) = sqlx::query_as(
        "SELECT final_tier, validation_passed FROM extraction_runs WHERE id = $1",
    )
    .bind(run_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(!validation_passed);
    let _ = final_tier;
}

#[sqlx::test]
async fn due_dates_respect_the_severity_ladder(pool: PgPool) {
    let server = MockServer::start_async().await;
    let extraction = json!({
        "certificateType": "Fire Risk Assessment",
        "certificateNumber": "FRA-9",
        "issueDate": "2024-04-01",
        "riskLevel": "Substantial",
        "findings": [
            {"priority": "Intolerable", "description": "Escape route blocked"},
            {"priority": "Low", "description": "Signage faded"}
        ]
    });
    let _mock = mock_llm(&server, &extraction);

    let property_id = create_property(&pool).await;
    let job_id = create_job(&pool, property_id, "FIRE_RISK_ASSESSMENT").await;
    coordinator(&pool, &server).process(job_id).await.unwrap();

    let job = ingestion_jobs::get(&pool, job_id).await.unwrap().unwrap();
    let actions = remedial_actions::list_for_certificate(&pool, job.certificate_id.unwrap())
        .await
        .unwrap();
    assert_eq!(actions.len(), 2);
    for action in &actions {
        let horizon = match action.severity.as_str() {
            "IMMEDIATE" => Duration::days(1),
            "URGENT" => Duration::days(7),
            "ROUTINE" => Duration::days(30),
            _ => Duration::days(90),
        };
        assert!(action.due_date <= action.created_at + horizon);
    }
}
