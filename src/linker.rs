use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::classify::{item_str, iter_items};

/// Component category and default type name per certificate category.
/// Categories outside this table do not auto-create components.
fn component_mapping(category: &str) -> Option<(&'static str, &'static str)> {
    match category {
        "GAS_SAFETY" | "GAS_SVC" | "OIL" | "LPG" => Some(("HEATING", "Gas Boiler")),
        "EICR" | "ELEC" => Some(("ELECTRICAL", "Consumer Unit")),
        "FRA" | "FRAEW" | "FIRE_RISK_ASSESSMENT" | "FIRE_ALARM" | "FIRE_DOOR" | "AOV"
        | "SPRINKLER" => Some(("FIRE_SAFETY", "Fire Safety System")),
        "LEG_RA" | "LEG_MONITOR" | "LEGIONELLA_ASSESSMENT" | "WATER_TANK" | "TMV" => {
            Some(("WATER", "Water System"))
        }
        "ASB_SURVEY" | "ASB_MGMT" | "ASBESTOS_SURVEY" => {
            Some(("STRUCTURE", "Asbestos Containing Material"))
        }
        "LOLER" | "LIFT" | "STAIRLIFT" | "HOIST" | "LIFT_LOLER" => {
            Some(("LIFTING", "Passenger Lift"))
        }
        "EPC" => Some(("ENERGY", "Heating System")),
        _ => None,
    }
}

/// Create `components` rows for the appliances and equipment a certificate
/// identified. Deduplicates by serial number when present, otherwise by
/// property + component type.
pub async fn link_components(
    pool: &PgPool,
    property_id: Uuid,
    category: &str,
    payload: &Value,
) -> Result<usize, sqlx::Error> {
    let Some((component_category, default_type)) = component_mapping(category) else {
        return Ok(0);
    };

    let mut created = 0;
    for item in iter_items(payload, &["appliances", "equipment"]) {
        let component_type = item_str(item, &["type", "appliance", "description"])
            .map(str::trim)
            .filter(|component_type| !component_type.is_empty())
            .unwrap_or(default_type);
        let serial = item_str(item, &["serialNumber", "serial_number", "serial", "identifier"])
            .map(str::trim)
            .filter(|serial| !serial.is_empty());

        let exists = match serial {
            Some(serial) => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM components WHERE property_id = $1 AND serial_number = $2",
            )
            .bind(property_id)
            .bind(serial)
            .fetch_one(pool)
            .await?,
            None => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM components WHERE property_id = $1 AND component_type = $2",
            )
            .bind(property_id)
            .bind(component_type)
            .fetch_one(pool)
            .await?,
        };
        if exists > 0 {
            debug!(%property_id, component_type, "component already linked");
            continue;
        }

        sqlx::query(
            "INSERT INTO components \
             (property_id, component_type, category, name, serial_number, manufacturer, model, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(property_id)
        .bind(component_type)
        .bind(component_category)
        .bind(item_str(item, &["name", "type", "appliance"]).unwrap_or(component_type))
        .bind(serial)
        .bind(item_str(item, &["make", "manufacturer"]))
        .bind(item_str(item, &["model"]))
        .bind(item)
        .execute(pool)
        .await?;
        created += 1;
    }
    if created > 0 {
        info!(%property_id, category, created, "auto-created components");
    }
    Ok(created)
}

const ISSUER_KEYS: &[&str] = &["engineer", "inspector", "assessor", "surveyor", "examiner"];

/// Create a `contractors` row from the certificate's issuer block unless a
/// contractor with the same name or registration number already exists.
pub async fn link_contractor(pool: &PgPool, payload: &Value) -> Result<Option<Uuid>, sqlx::Error> {
    let issuer = ISSUER_KEYS
        .iter()
        .find_map(|key| payload.get(*key))
        .filter(|issuer| issuer.is_object());
    let Some(issuer) = issuer else {
        return Ok(None);
    };
    let Some(name) = item_str(issuer, &["name", "fullName"])
        .map(str::trim)
        .filter(|name| !name.is_empty())
    else {
        return Ok(None);
    };
    let registration = item_str(
        issuer,
        &["registrationNumber", "registration_number", "gasSafeNumber", "licenseNumber"],
    )
    .map(str::trim)
    .filter(|registration| !registration.is_empty());

    let existing = sqlx::query(
        "SELECT id FROM contractors WHERE name = $1 OR ($2::text IS NOT NULL AND registration_number = $2) \
         LIMIT 1",
    )
    .bind(name)
    .bind(registration)
    .fetch_optional(pool)
    .await?;
    if let Some(row) = existing {
        return Ok(Some(row.get("id")));
    }

    let row = sqlx::query(
        "INSERT INTO contractors (name, registration_number, company, contact) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(name)
    .bind(registration)
    .bind(item_str(issuer, &["company", "organisation"]))
    .bind(issuer)
    .fetch_one(pool)
    .await?;
    let id: Uuid = row.get("id");
    info!(%id, name, "auto-created contractor");
    Ok(Some(id))
}
