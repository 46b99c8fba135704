use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Property {
    pub id: Uuid,
    pub organisation_id: Option<Uuid>,
    pub address_line1: String,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub postcode: Option<String>,
    pub extracted_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn get<'c, E>(executor: E, id: Uuid) -> Result<Option<Property>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Property>(
        "SELECT id, organisation_id, address_line1, address_line2, city, postcode, \
                extracted_metadata, created_at, updated_at \
         FROM properties WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn update_extracted_metadata<'c, E>(
    executor: E,
    id: Uuid,
    metadata: &Value,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE properties SET extracted_metadata = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(metadata)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn update_address<'c, E>(
    executor: E,
    id: Uuid,
    line1: &str,
    city: Option<&str>,
    postcode: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE properties SET \
             address_line1 = $2, \
             city = COALESCE($3, city), \
             postcode = COALESCE($4, postcode), \
             updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(line1)
    .bind(city)
    .bind(postcode)
    .execute(executor)
    .await?;
    Ok(())
}
