use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// The eight user-selectable certificate categories. Everything else in the
/// canonical code set is reachable through `map_certificate_type_to_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    GasSafety,
    Eicr,
    Epc,
    FireRiskAssessment,
    LegionellaAssessment,
    AsbestosSurvey,
    LiftLoler,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::GasSafety => "GAS_SAFETY",
            Category::Eicr => "EICR",
            Category::Epc => "EPC",
            Category::FireRiskAssessment => "FIRE_RISK_ASSESSMENT",
            Category::LegionellaAssessment => "LEGIONELLA_ASSESSMENT",
            Category::AsbestosSurvey => "ASBESTOS_SURVEY",
            Category::LiftLoler => "LIFT_LOLER",
            Category::Other => "OTHER",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "GAS_SAFETY" => Category::GasSafety,
            "EICR" => Category::Eicr,
            "EPC" => Category::Epc,
            "FIRE_RISK_ASSESSMENT" => Category::FireRiskAssessment,
            "LEGIONELLA_ASSESSMENT" => Category::LegionellaAssessment,
            "ASBESTOS_SURVEY" => Category::AsbestosSurvey,
            "LIFT_LOLER" => Category::LiftLoler,
            _ => Category::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Satisfactory,
    Unsatisfactory,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Satisfactory => "SATISFACTORY",
            Outcome::Unsatisfactory => "UNSATISFACTORY",
        }
    }
}

/// Ordered substring rules mapping free-text certificate-type strings to the
/// canonical code set. Each entry lists its own code first so the mapping is
/// idempotent; more specific rules sit above the generic ones they overlap
/// with (EICR before ELEC, STAIRLIFT before LIFT, FRAEW before FRA).
const TYPE_RULES: &[(&str, &[&str])] = &[
    ("GAS_SVC", &["GAS_SVC", "GAS SERVIC", "BOILER SERVIC"]),
    (
        "GAS_SAFETY",
        &["GAS_SAFETY", "GAS SAFETY", "LGSR", "CP12", "LANDLORD GAS"],
    ),
    ("LPG", &["LPG"]),
    ("OIL", &["OIL FIRING", "OIL BOILER", "OIL"]),
    (
        "EICR",
        &["EICR", "ELECTRICAL INSTALLATION CONDITION", "PERIODIC INSPECTION"],
    ),
    ("PAT", &["PAT", "PORTABLE APPLIANCE"]),
    ("EMLT", &["EMLT", "EMERGENCY LIGHT"]),
    ("ELEC", &["ELEC", "ELECTRICAL"]),
    ("EPC", &["EPC", "ENERGY PERFORMANCE"]),
    ("SAP", &["SAP"]),
    ("DEC", &["DEC", "DISPLAY ENERGY"]),
    ("FRAEW", &["FRAEW", "EXTERNAL WALL"]),
    ("FRA", &["FRA", "FIRE RISK"]),
    ("FIRE_ALARM", &["FIRE_ALARM", "FIRE ALARM", "FIRE DETECTION"]),
    ("FIRE_EXT", &["FIRE_EXT", "FIRE EXTINGUISH"]),
    ("FIRE_DOOR", &["FIRE_DOOR", "FIRE DOOR"]),
    (
        "SMOKE_CO",
        &["SMOKE_CO", "SMOKE ALARM", "CARBON MONOXIDE", "CO ALARM", "CO DETECTOR"],
    ),
    ("AOV", &["AOV", "AUTOMATIC OPENING VENT"]),
    ("SPRINKLER", &["SPRINKLER"]),
    ("LEG_MONITOR", &["LEG_MONITOR", "LEGIONELLA MONITOR", "WATER TEMPERATURE"]),
    ("LEG_RA", &["LEG_RA", "LEGIONELLA"]),
    ("WATER_TANK", &["WATER_TANK", "WATER TANK", "WATER STORAGE"]),
    ("TMV", &["TMV", "THERMOSTATIC MIXING"]),
    ("ASB_MGMT", &["ASB_MGMT", "ASBESTOS MANAGEMENT PLAN", "ASBESTOS RE-INSPECTION"]),
    ("ASB_SURVEY", &["ASB_SURVEY", "ASBESTOS"]),
    ("LOLER", &["LOLER", "THOROUGH EXAMINATION"]),
    ("STAIRLIFT", &["STAIRLIFT", "STAIR LIFT"]),
    ("HOIST", &["HOIST"]),
    ("LIFT", &["LIFT", "ELEVATOR"]),
    ("BLDG_SAFETY", &["BLDG_SAFETY", "BUILDING SAFETY CASE", "BUILDING SAFETY"]),
    ("BSR_REG", &["BSR_REG", "BSR REGISTRATION", "BUILDING SAFETY REGULATOR"]),
    ("STRUCT", &["STRUCT", "STRUCTURAL"]),
    ("FACADE", &["FACADE", "CLADDING"]),
    ("ROOF", &["ROOF"]),
    ("PLAY", &["PLAY", "PLAYGROUND", "PLAY AREA"]),
    ("TREE", &["TREE", "ARBORICULT"]),
    ("CCTV", &["CCTV"]),
    ("ACCESS_CTRL", &["ACCESS_CTRL", "ACCESS CONTROL", "DOOR ENTRY"]),
    ("HHSRS", &["HHSRS", "HOUSING HEALTH"]),
    ("DAMP_MOULD", &["DAMP_MOULD", "DAMP", "MOULD", "CONDENSATION"]),
    ("VENTILATION", &["VENTILATION", "EXTRACT FAN"]),
    ("DDA", &["DDA", "DISABILITY", "ACCESSIBILITY AUDIT"]),
    ("PEST", &["PEST"]),
    ("WASTE", &["WASTE", "REFUSE"]),
    ("COMM_CLEAN", &["COMM_CLEAN", "COMMUNAL CLEAN", "CLEANING"]),
];

/// Map a free-text certificate-type string to its canonical code. Unknown
/// strings map to `UNKNOWN` with a warning. Deterministic and idempotent.
pub fn map_certificate_type_to_code(raw: &str) -> &'static str {
    let normalised = raw.trim().to_uppercase();
    if normalised.is_empty() || normalised == "UNKNOWN" {
        return "UNKNOWN";
    }
    for (code, patterns) in TYPE_RULES {
        if patterns.iter().any(|pattern| normalised.contains(pattern)) {
            return code;
        }
    }
    warn!(certificate_type = raw, "unmapped certificate type");
    "UNKNOWN"
}

/// Looser mapping from a model-reported `documentType` to one of the eight
/// user-selectable categories. Applied when the uploader selected `OTHER`.
pub fn map_document_type_to_category(raw: &str) -> Category {
    let normalised = raw.trim().to_uppercase();
    if normalised.contains("GAS") {
        Category::GasSafety
    } else if normalised.contains("EICR") || normalised.contains("ELECTRIC") {
        Category::Eicr
    } else if normalised.contains("EPC") || normalised.contains("ENERGY") {
        Category::Epc
    } else if normalised.contains("FIRE") {
        Category::FireRiskAssessment
    } else if normalised.contains("LEGIONELLA") || normalised.contains("WATER HYGIENE") {
        Category::LegionellaAssessment
    } else if normalised.contains("ASBESTOS") {
        Category::AsbestosSurvey
    } else if normalised.contains("LOLER")
        || normalised.contains("LIFT")
        || normalised.contains("ELEVAT")
    {
        Category::LiftLoler
    } else {
        Category::Other
    }
}

const GAS_FAIL_TOKENS: &[&str] = &[
    "FAIL",
    "UNSAFE",
    "ID",
    "IMMEDIATELY DANGEROUS",
    "AR",
    "AT RISK",
    "NCS",
    "NOT TO CURRENT STANDARD",
    "CONDEMNED",
];

/// Determine the compliance verdict for an extracted payload. Rules run in
/// a fixed order and stop at the first `UNSATISFACTORY`; a category-specific
/// pass is not a verdict until the generic sweep has also been consulted.
pub fn determine_outcome(category: &str, payload: &Value) -> Outcome {
    // 1. Explicit top-level verdict.
    for key in ["overallOutcome", "overallAssessment", "overall_outcome"] {
        if let Some(verdict) = payload.get(key).and_then(Value::as_str) {
            let verdict = verdict.to_uppercase();
            if verdict.contains("UNSATISFACTORY")
                || verdict.contains("FAIL")
                || verdict.contains("NOT SAFE")
            {
                return Outcome::Unsatisfactory;
            }
        }
    }

    // 2. Category-specific rules.
    let unsatisfactory = match category {
        "GAS_SAFETY" | "GAS_SVC" | "OIL" | "LPG" => gas_unsatisfactory(payload),
        "EICR" | "ELEC" => eicr_unsatisfactory(payload),
        "FRA" | "FRAEW" | "FIRE_RISK_ASSESSMENT" => fire_unsatisfactory(payload),
        "ASB_SURVEY" | "ASB_MGMT" | "ASBESTOS_SURVEY" => asbestos_unsatisfactory(payload),
        "LEG_RA" | "LEG_MONITOR" | "LEGIONELLA_ASSESSMENT" => legionella_unsatisfactory(payload),
        "LOLER" | "LIFT" | "STAIRLIFT" | "HOIST" | "LIFT_LOLER" => lift_unsatisfactory(payload),
        _ => false,
    };
    if unsatisfactory {
        return Outcome::Unsatisfactory;
    }

    // 3. Generic sweep.
    if let Some(risk) = payload.get("riskLevel").and_then(Value::as_str) {
        let risk = risk.to_uppercase();
        if ["HIGH", "VERY HIGH", "SUBSTANTIAL", "INTOLERABLE", "CRITICAL"]
            .contains(&risk.as_str())
        {
            return Outcome::Unsatisfactory;
        }
    }
    for defect in iter_items(payload, &["defects"]) {
        if let Some(classification) = item_str(defect, &["classification", "code", "severity"]) {
            let classification = classification.to_uppercase();
            let exact = ["ID", "A", "C1"].contains(&classification.trim());
            let fuzzy = classification.contains("IMMEDIATELY DANGEROUS")
                || classification.contains("CRITICAL")
                || classification.contains("DANGER");
            if exact || fuzzy {
                return Outcome::Unsatisfactory;
            }
        }
    }

    Outcome::Satisfactory
}

fn gas_unsatisfactory(payload: &Value) -> bool {
    for appliance in iter_items(payload, &["appliances"]) {
        if appliance.get("applianceSafe").and_then(Value::as_bool) == Some(false) {
            return true;
        }
        if let Some(outcome) = item_str(appliance, &["outcome", "status", "result"]) {
            let outcome = outcome.to_uppercase();
            if GAS_FAIL_TOKENS.iter().any(|token| outcome.contains(token)) {
                return true;
            }
        }
    }
    for defect in iter_items(payload, &["defects"]) {
        if let Some(classification) = item_str(defect, &["classification", "code"]) {
            let classification = classification.trim().to_uppercase();
            if ["ID", "AR", "NCS", "CONDEMNED"].contains(&classification.as_str()) {
                return true;
            }
        }
    }
    false
}

fn eicr_unsatisfactory(payload: &Value) -> bool {
    for key in ["c1Count", "c2Count", "fiCount"] {
        if payload.get(key).and_then(Value::as_i64).unwrap_or(0) > 0 {
            return true;
        }
    }
    iter_items(payload, &["observations"]).any(|observation| {
        item_str(observation, &["code", "classification"])
            .map(|code| ["C1", "C2", "FI"].contains(&code.trim().to_uppercase().as_str()))
            .unwrap_or(false)
    })
}

fn fire_unsatisfactory(payload: &Value) -> bool {
    if let Some(risk) = payload.get("riskLevel").and_then(Value::as_str) {
        if ["HIGH", "SUBSTANTIAL", "INTOLERABLE", "CRITICAL"]
            .contains(&risk.trim().to_uppercase().as_str())
        {
            return true;
        }
    }
    iter_items(payload, &["findings", "actions"]).any(|finding| {
        item_str(finding, &["priority"])
            .map(|priority| {
                ["HIGH", "IMMEDIATE", "INTOLERABLE"]
                    .contains(&priority.trim().to_uppercase().as_str())
            })
            .unwrap_or(false)
    })
}

fn asbestos_unsatisfactory(payload: &Value) -> bool {
    iter_items(payload, &["materials", "acms"]).any(|material| {
        let condition = item_str(material, &["condition"])
            .map(|condition| condition.trim().to_uppercase())
            .unwrap_or_default();
        let risk = item_str(material, &["risk", "riskLevel"])
            .map(|risk| risk.trim().to_uppercase())
            .unwrap_or_default();
        condition == "POOR" || condition == "DAMAGED" || risk == "HIGH"
    })
}

fn legionella_unsatisfactory(payload: &Value) -> bool {
    if let Some(risk) = payload.get("riskLevel").and_then(Value::as_str) {
        if ["HIGH", "IMMEDIATE"].contains(&risk.trim().to_uppercase().as_str()) {
            return true;
        }
    }
    iter_items(payload, &["recommendations"]).any(|recommendation| {
        item_str(recommendation, &["priority"])
            .map(|priority| ["IMMEDIATE", "HIGH"].contains(&priority.trim().to_uppercase().as_str()))
            .unwrap_or(false)
    })
}

fn lift_unsatisfactory(payload: &Value) -> bool {
    if payload.get("safeToOperate").and_then(Value::as_bool) == Some(false) {
        return true;
    }
    iter_items(payload, &["defects"]).any(|defect| {
        item_str(defect, &["category"])
            .map(|category| category.trim().to_uppercase() == "A")
            .unwrap_or(false)
    })
}

/// Convert a short appliance outcome token to the persisted PASS/FAIL/N-A
/// form. Unknown tokens yield `None` with a warning.
pub fn map_appliance_outcome(token: &str) -> Option<&'static str> {
    let normalised = token.trim().to_uppercase();
    match normalised.as_str() {
        "PASS" | "SATISFACTORY" | "SAFE" => Some("PASS"),
        "ID" | "AR" | "NCS" | "C1" | "C2" | "CONDEMNED" | "FI" => Some("FAIL"),
        "N/A" | "NA" | "SERVICE ONLY" | "NOT TESTED" => Some("N/A"),
        _ => {
            warn!(token, "unknown appliance outcome token");
            None
        }
    }
}

static POSTCODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[A-Z]{1,2}\d{1,2}[A-Z]?\s*\d[A-Z]{2}").expect("postcode regex")
});

const LINE1_KEYS: &[&str] = &[
    "street",
    "streetAddress",
    "addressLine1",
    "address_line_1",
    "name",
    "fullAddress",
    "property",
    "line1",
    "address1",
];

const MAX_LINE1: usize = 255;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NormalisedAddress {
    pub line1: Option<String>,
    pub city: Option<String>,
    pub postcode: Option<String>,
}

/// Accepts both string addresses and the many object shapes the extraction
/// tiers produce. Line 1 is truncated to 255 characters; postcodes are
/// matched with the UK pattern and uppercased.
pub fn normalise_address(value: &Value) -> NormalisedAddress {
    match value {
        Value::String(raw) => {
            let line1 = truncate_chars(raw.trim(), MAX_LINE1);
            NormalisedAddress {
                postcode: find_postcode(raw),
                line1: (!line1.is_empty()).then_some(line1),
                city: None,
            }
        }
        Value::Object(map) => {
            let line1 = LINE1_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(|raw| truncate_chars(raw.trim(), MAX_LINE1))
                .filter(|line1| !line1.is_empty());
            let city = ["city", "town", "postTown", "post_town"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(|raw| raw.trim().to_string())
                .filter(|city| !city.is_empty());
            let postcode = ["postcode", "postCode", "postal_code", "postalCode"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .and_then(find_postcode)
                .or_else(|| {
                    let joined = map
                        .values()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(" ");
                    find_postcode(&joined)
                });
            NormalisedAddress {
                line1,
                city,
                postcode,
            }
        }
        _ => NormalisedAddress::default(),
    }
}

fn find_postcode<S: AsRef<str>>(raw: S) -> Option<String> {
    POSTCODE
        .find(raw.as_ref())
        .map(|found| found.as_str().to_uppercase())
}

fn truncate_chars(raw: &str, limit: usize) -> String {
    raw.chars().take(limit).collect()
}

/// The extraction tiers name their item lists inconsistently; walk every
/// candidate key and yield the elements of whichever arrays are present.
pub fn iter_items<'a>(
    payload: &'a Value,
    keys: &'a [&'a str],
) -> impl Iterator<Item = &'a Value> + 'a {
    keys.iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_array))
        .flatten()
}

pub fn item_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| item.get(*key).and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn certificate_type_mapping_covers_common_synonyms() {
        assert_eq!(map_certificate_type_to_code("Landlord Gas Safety Record"), "GAS_SAFETY");
        assert_eq!(map_certificate_type_to_code("CP12"), "GAS_SAFETY");
        assert_eq!(map_certificate_type_to_code("gas service report"), "GAS_SVC");
        assert_eq!(
            map_certificate_type_to_code("Electrical Installation Condition Report"),
            "EICR"
        );
        assert_eq!(map_certificate_type_to_code("Portable Appliance Testing"), "PAT");
        assert_eq!(map_certificate_type_to_code("Energy Performance Certificate"), "EPC");
        assert_eq!(map_certificate_type_to_code("Fire Risk Assessment"), "FRA");
        assert_eq!(map_certificate_type_to_code("FRAEW"), "FRAEW");
        assert_eq!(map_certificate_type_to_code("Asbestos Management Plan"), "ASB_MGMT");
        assert_eq!(map_certificate_type_to_code("Asbestos Refurbishment Survey"), "ASB_SURVEY");
        assert_eq!(map_certificate_type_to_code("LOLER Thorough Examination"), "LOLER");
        assert_eq!(map_certificate_type_to_code("Stairlift inspection"), "STAIRLIFT");
        assert_eq!(map_certificate_type_to_code("Passenger Lift"), "LIFT");
        assert_eq!(map_certificate_type_to_code("HHSRS Assessment"), "HHSRS");
        assert_eq!(map_certificate_type_to_code("something novel"), "UNKNOWN");
    }

    #[test]
    fn certificate_type_mapping_is_idempotent() {
        for (code, _) in TYPE_RULES {
            assert_eq!(map_certificate_type_to_code(code), *code, "{code}");
        }
        assert_eq!(map_certificate_type_to_code("UNKNOWN"), "UNKNOWN");
    }

    #[test]
    fn document_type_maps_to_selectable_category() {
        assert_eq!(map_document_type_to_category("Gas Safety Record"), Category::GasSafety);
        assert_eq!(map_document_type_to_category("EICR"), Category::Eicr);
        assert_eq!(
            map_document_type_to_category("Legionella risk assessment"),
            Category::LegionellaAssessment
        );
        assert_eq!(map_document_type_to_category("Lift report"), Category::LiftLoler);
        assert_eq!(map_document_type_to_category("Tenancy agreement"), Category::Other);
    }

    #[test]
    fn explicit_overall_outcome_wins() {
        let payload = json!({"overallOutcome": "Unsatisfactory", "appliances": []});
        assert_eq!(determine_outcome("GAS_SAFETY", &payload), Outcome::Unsatisfactory);
    }

    #[test]
    fn gas_unsafe_appliance_fails() {
        let payload = json!({"appliances": [{"type": "Boiler", "applianceSafe": false}]});
        assert_eq!(determine_outcome("GAS_SAFETY", &payload), Outcome::Unsatisfactory);
    }

    #[test]
    fn gas_clean_record_passes() {
        let payload = json!({
            "certificateType": "Landlord Gas Safety Record",
            "appliances": [{"type": "Boiler", "applianceSafe": true, "outcome": "Pass"}]
        });
        assert_eq!(determine_outcome("GAS_SAFETY", &payload), Outcome::Satisfactory);
    }

    #[test]
    fn eicr_c2_count_fails() {
        let payload = json!({"c2Count": 2, "observations": []});
        assert_eq!(determine_outcome("EICR", &payload), Outcome::Unsatisfactory);
    }

    #[test]
    fn eicr_c3_only_passes() {
        let payload = json!({"c3Count": 4, "observations": [{"code": "C3"}]});
        assert_eq!(determine_outcome("EICR", &payload), Outcome::Satisfactory);
    }

    #[test]
    fn fire_high_risk_fails() {
        let payload = json!({"riskLevel": "Substantial"});
        assert_eq!(determine_outcome("FRA", &payload), Outcome::Unsatisfactory);
    }

    #[test]
    fn asbestos_damaged_material_fails() {
        let payload = json!({"materials": [{"material": "AIB", "condition": "Damaged"}]});
        assert_eq!(determine_outcome("ASB_SURVEY", &payload), Outcome::Unsatisfactory);
    }

    #[test]
    fn lift_category_a_defect_fails() {
        let payload = json!({"safeToOperate": true, "defects": [{"category": "A"}]});
        assert_eq!(determine_outcome("LOLER", &payload), Outcome::Unsatisfactory);
    }

    #[test]
    fn generic_sweep_catches_unknown_category_defects() {
        let payload = json!({"defects": [{"classification": "Immediately Dangerous"}]});
        assert_eq!(determine_outcome("UNKNOWN", &payload), Outcome::Unsatisfactory);
    }

    #[test]
    fn empty_payload_is_satisfactory() {
        assert_eq!(determine_outcome("GAS_SAFETY", &json!({})), Outcome::Satisfactory);
    }

    #[test]
    fn appliance_tokens_map_to_three_way_outcome() {
        assert_eq!(map_appliance_outcome("pass"), Some("PASS"));
        assert_eq!(map_appliance_outcome("Satisfactory"), Some("PASS"));
        assert_eq!(map_appliance_outcome("ID"), Some("FAIL"));
        assert_eq!(map_appliance_outcome("c2"), Some("FAIL"));
        assert_eq!(map_appliance_outcome("not tested"), Some("N/A"));
        assert_eq!(map_appliance_outcome("perhaps"), None);
    }

    #[test]
    fn string_address_is_normalised() {
        let address = normalise_address(&json!("12 High Street, Leeds ls1 4ab"));
        assert_eq!(address.line1.as_deref(), Some("12 High Street, Leeds ls1 4ab"));
        assert_eq!(address.postcode.as_deref(), Some("LS1 4AB"));
    }

    #[test]
    fn object_address_prefers_known_keys() {
        let address = normalise_address(&json!({
            "addressLine1": "Flat 3, Riverside Court",
            "city": "Manchester",
            "postcode": "M1 2AB"
        }));
        assert_eq!(address.line1.as_deref(), Some("Flat 3, Riverside Court"));
        assert_eq!(address.city.as_deref(), Some("Manchester"));
        assert_eq!(address.postcode.as_deref(), Some("M1 2AB"));
    }

    #[test]
    fn postcode_is_recovered_from_any_field() {
        let address = normalise_address(&json!({
            "fullAddress": "4 Mill Lane, York yo10 5dd"
        }));
        assert_eq!(address.postcode.as_deref(), Some("YO10 5DD"));
    }

    #[test]
    fn line1_is_truncated_to_255_chars() {
        let long = "x".repeat(400);
        let address = normalise_address(&json!(long));
        assert_eq!(address.line1.map(|line1| line1.chars().count()), Some(255));
    }
}
