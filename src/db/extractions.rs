use serde_json::Value;
use sqlx::{Executor, Postgres, Row};
use uuid::Uuid;

pub struct NewExtraction<'a> {
    pub certificate_id: Uuid,
    pub method: &'a str,
    pub model: Option<&'a str>,
    pub prompt_version: Option<&'a str>,
    pub payload: &'a Value,
    pub confidence: Option<f64>,
    pub text_quality: Option<&'a str>,
}

pub async fn insert<'c, E>(executor: E, extraction: NewExtraction<'_>) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "INSERT INTO extractions \
         (certificate_id, method, model, prompt_version, payload, confidence, text_quality) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
    )
    .bind(extraction.certificate_id)
    .bind(extraction.method)
    .bind(extraction.model)
    .bind(extraction.prompt_version)
    .bind(extraction.payload)
    .bind(extraction.confidence)
    .bind(extraction.text_quality)
    .fetch_one(executor)
    .await?;
    Ok(row.get("id"))
}
