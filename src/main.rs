mod circuit;
mod classify;
mod config;
mod db;
mod document_store;
mod error;
mod events;
mod extraction;
mod ingest;
mod job_queue;
mod linker;
mod llm;
mod ocr;
mod patterns;
mod remedial;
mod reports;
mod routes;
mod text_extract;
mod watchdog;
mod webhooks;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::Extension, routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use crate::config::RuntimeSettings;
use crate::document_store::{DocumentStore, LocalDocumentStore};
use crate::events::EventBroadcaster;
use crate::extraction::TieredExtractor;
use crate::ingest::IngestCoordinator;
use crate::job_queue::{JobQueue, QUEUE_WEBHOOK_DELIVERY, WEBHOOK_WORKERS};
use crate::routes::api_routes;
use crate::webhooks::WebhookDeliverer;

async fn root() -> &'static str {
    "Compliance Host API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let db_url = std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&db_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let settings = RuntimeSettings::load(&pool).await;
    tracing::info!(?settings, "runtime settings loaded");

    let broadcaster = EventBroadcaster::new();
    let queue = JobQueue::new(pool.clone(), settings.clone());
    let store: Arc<dyn DocumentStore> = Arc::new(LocalDocumentStore::from_env());
    let extractor = Arc::new(TieredExtractor::from_env());
    let coordinator = IngestCoordinator::new(pool.clone(), store, extractor, broadcaster.clone());

    ingest::register_workers(&queue, coordinator);

    let deliverer = WebhookDeliverer::new(pool.clone());
    queue.work(QUEUE_WEBHOOK_DELIVERY, WEBHOOK_WORKERS, move |job| {
        let deliverer = deliverer.clone();
        async move {
            let delivery_id = job
                .payload
                .get("deliveryId")
                .and_then(Value::as_str)
                .and_then(|raw| Uuid::parse_str(raw).ok())
                .ok_or_else(|| anyhow::anyhow!("delivery job payload missing deliveryId"))?;
            deliverer.deliver(delivery_id).await
        }
    });
    webhooks::spawn_event_poller(queue.clone());

    watchdog::register(&queue, broadcaster.clone(), &settings).await?;
    reports::register(&queue, config::REPORTING_TIMEZONE.as_str()).await?;
    queue.start_scheduler();
    queue.start_maintenance();

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(queue.clone()))
        .layer(Extension(broadcaster.clone()));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
