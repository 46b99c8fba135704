use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use crate::classify::{item_str, iter_items, Outcome};
use crate::db::classification_codes::{self, ClassificationCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Immediate,
    Urgent,
    Routine,
    Advisory,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Immediate => "IMMEDIATE",
            Severity::Urgent => "URGENT",
            Severity::Routine => "ROUTINE",
            Severity::Advisory => "ADVISORY",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "IMMEDIATE" => Some(Severity::Immediate),
            "URGENT" => Some(Severity::Urgent),
            "ROUTINE" => Some(Severity::Routine),
            "ADVISORY" => Some(Severity::Advisory),
            _ => None,
        }
    }

    /// Due-date horizon: 1, 7, 30 or 90 days from creation.
    pub fn due_in_days(&self) -> i64 {
        match self {
            Severity::Immediate => 1,
            Severity::Urgent => 7,
            Severity::Routine => 30,
            Severity::Advisory => 90,
        }
    }

    pub fn due_date(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + Duration::days(self.due_in_days())
    }
}

/// A remedial action the generator wants persisted. The coordinator stamps
/// the due date from the severity at insert time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub code: String,
    pub description: String,
    pub location: String,
    pub severity: Severity,
    pub cost_estimate: String,
}

/// A defect detected in the extracted payload, already resolved to a
/// classification code.
#[derive(Debug, Clone)]
struct DetectedDefect {
    code: String,
    description: String,
    location: String,
}

/// Generate remedial actions for a certificate. Prefers the
/// `classification_codes` rulebook; falls back to the built-in engine when
/// the table is unreachable so a config outage never fails the job.
pub async fn generate_actions(
    pool: &PgPool,
    category: &str,
    payload: &Value,
    outcome: Outcome,
) -> Vec<PlannedAction> {
    match classification_codes::load_for_type(pool, category).await {
        Ok(rules) => {
            let by_code: HashMap<&str, &ClassificationCode> =
                rules.iter().map(|rule| (rule.code.as_str(), rule)).collect();
            config_driven_actions(category, payload, &by_code)
        }
        Err(err) => {
            warn!(?err, category, "classification_codes unreachable; using fallback engine");
            fallback_actions(category, payload, outcome)
        }
    }
}

fn config_driven_actions(
    category: &str,
    payload: &Value,
    rules: &HashMap<&str, &ClassificationCode>,
) -> Vec<PlannedAction> {
    let mut actions = Vec::new();
    for defect in detect_defects(category, payload) {
        let rule = rules.get(defect.code.as_str());
        if let Some(rule) = rule {
            if !rule.auto_create_action {
                continue;
            }
        }
        let severity = rule
            .and_then(|rule| rule.action_severity.as_deref())
            .and_then(Severity::from_db)
            .unwrap_or_else(|| default_severity(&defect.code));
        let description = rule
            .and_then(|rule| rule.action_required.clone())
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| defect.description.clone());
        let cost_estimate = rule.map(|rule| rule.cost_band()).unwrap_or_else(|| "TBD".into());
        actions.push(PlannedAction {
            code: defect.code,
            description,
            location: defect.location,
            severity,
            cost_estimate,
        });
    }
    actions
}

/// Hardcoded engine used when the rulebook cannot be loaded. Covers the
/// core categories and sweeps any other UNSATISFACTORY certificate into a
/// single review action so nothing silently passes.
fn fallback_actions(category: &str, payload: &Value, outcome: Outcome) -> Vec<PlannedAction> {
    let mut actions: Vec<PlannedAction> = detect_defects(category, payload)
        .into_iter()
        .map(|defect| PlannedAction {
            severity: default_severity(&defect.code),
            code: defect.code,
            description: defect.description,
            location: defect.location,
            cost_estimate: "TBD".into(),
        })
        .collect();

    if actions.is_empty() && outcome == Outcome::Unsatisfactory {
        actions.push(PlannedAction {
            code: format!("REVIEW-{category}"),
            description: "Certificate recorded an unsatisfactory outcome; review and raise works"
                .into(),
            location: "Property".into(),
            severity: Severity::Urgent,
            cost_estimate: "TBD".into(),
        });
    }
    actions
}

fn detect_defects(category: &str, payload: &Value) -> Vec<DetectedDefect> {
    match category {
        "GAS_SAFETY" | "GAS_SVC" | "OIL" | "LPG" => gas_defects(payload),
        "EICR" | "ELEC" => eicr_defects(payload),
        "FRA" | "FRAEW" | "FIRE_RISK_ASSESSMENT" => fire_defects(payload),
        "ASB_SURVEY" | "ASB_MGMT" | "ASBESTOS_SURVEY" => asbestos_defects(payload),
        "LEG_RA" | "LEG_MONITOR" | "LEGIONELLA_ASSESSMENT" => legionella_defects(payload),
        "LOLER" | "LIFT" | "STAIRLIFT" | "HOIST" | "LIFT_LOLER" => lift_defects(payload),
        "PLAY" => graded_defects(payload, &["hazards", "defects"], &[
            ("CRITICAL", "PLAY_CRITICAL"),
            ("HIGH", "PLAY_HIGH"),
            ("MEDIUM", "PLAY_MEDIUM"),
        ], "PLAY_LOW"),
        "TREE" => tree_defects(payload),
        "HHSRS" => hhsrs_defects(payload),
        "DAMP_MOULD" => graded_defects(payload, &["defects", "findings"], &[
            ("CRITICAL", "DAMP_CRITICAL"),
            ("SEVERE", "DAMP_SEVERE"),
            ("HIGH", "DAMP_SEVERE"),
            ("MODERATE", "DAMP_MODERATE"),
            ("MEDIUM", "DAMP_MODERATE"),
        ], "DAMP_MINOR"),
        "EPC" => epc_defects(payload),
        "SPRINKLER" => equipment_defects(payload, "SPRINKLER_DEFECT"),
        "AOV" => equipment_defects(payload, "AOV_DEFECT"),
        "FIRE_DOOR" => equipment_defects(payload, "FIRE_DOOR_DEFECT"),
        "FIRE_ALARM" => equipment_defects(payload, "FIRE_ALARM_DEFECT"),
        "EMLT" => equipment_defects(payload, "EMLT_DEFECT"),
        _ => Vec::new(),
    }
}

fn defect_description(item: &Value, fallback: &str) -> String {
    item_str(item, &["description", "details", "defect", "observation"])
        .unwrap_or(fallback)
        .to_string()
}

fn defect_location(item: &Value) -> String {
    item_str(item, &["location", "area", "room"])
        .unwrap_or("Property")
        .to_string()
}

fn gas_defects(payload: &Value) -> Vec<DetectedDefect> {
    let mut defects = Vec::new();
    for item in iter_items(payload, &["defects"]) {
        let classification = item_str(item, &["classification", "code"])
            .unwrap_or_default()
            .to_uppercase();
        // Exact short codes plus the long-form phrases. Bare substring
        // checks misfire here: "NOT TO CURRENT STANDARD" contains "AR".
        let token = classification.trim();
        let code = if token == "ID"
            || classification.contains("IMMEDIATELY DANGEROUS")
            || classification.contains("CONDEMNED")
        {
            "ID"
        } else if token == "NCS" || classification.contains("NOT TO CURRENT STANDARD") {
            "NCS"
        } else if token == "AR" || classification.contains("AT RISK") {
            "AR"
        } else {
            continue;
        };
        defects.push(DetectedDefect {
            code: code.into(),
            description: defect_description(item, "Gas defect identified"),
            location: defect_location(item),
        });
    }
    for appliance in iter_items(payload, &["appliances"]) {
        if appliance.get("applianceSafe").and_then(Value::as_bool) == Some(false) {
            let name = item_str(appliance, &["type", "appliance", "make"]).unwrap_or("Appliance");
            defects.push(DetectedDefect {
                code: "ID".into(),
                description: format!("{name} recorded as unsafe"),
                location: defect_location(appliance),
            });
        }
    }
    defects
}

fn eicr_defects(payload: &Value) -> Vec<DetectedDefect> {
    iter_items(payload, &["observations", "defects"])
        .filter_map(|item| {
            let code = item_str(item, &["code", "classification"])?
                .trim()
                .to_uppercase();
            if !["C1", "C2", "C3", "FI"].contains(&code.as_str()) {
                return None;
            }
            Some(DetectedDefect {
                code,
                description: defect_description(item, "Electrical observation"),
                location: defect_location(item),
            })
        })
        .collect()
}

fn fire_defects(payload: &Value) -> Vec<DetectedDefect> {
    iter_items(payload, &["findings", "actions"])
        .map(|item| {
            let priority = item_str(item, &["priority", "riskLevel"])
                .unwrap_or_default()
                .to_uppercase();
            let code = match priority.as_str() {
                "INTOLERABLE" | "CRITICAL" => "INTOLERABLE",
                "HIGH" | "IMMEDIATE" | "SUBSTANTIAL" => "SUBSTANTIAL",
                "MEDIUM" | "MODERATE" => "MODERATE",
                "LOW" => "TOLERABLE",
                _ => "TRIVIAL",
            };
            DetectedDefect {
                code: code.into(),
                description: defect_description(item, "Fire risk finding"),
                location: defect_location(item),
            }
        })
        .collect()
}

fn asbestos_defects(payload: &Value) -> Vec<DetectedDefect> {
    iter_items(payload, &["materials", "acms"])
        .filter_map(|item| {
            let condition = item_str(item, &["condition"]).unwrap_or_default().to_uppercase();
            let risk = item_str(item, &["risk", "riskLevel"]).unwrap_or_default().to_uppercase();
            let damaged = condition == "POOR" || condition == "DAMAGED";
            let code = match (risk.as_str(), damaged) {
                ("HIGH", true) => "ACM_CRITICAL",
                ("HIGH", false) => "ACM_HIGH",
                (_, true) => "ACM_HIGH",
                ("MEDIUM", _) => "ACM_MEDIUM",
                ("LOW", _) => "ACM_LOW",
                _ => return None,
            };
            Some(DetectedDefect {
                code: code.into(),
                description: defect_description(item, "Asbestos-containing material"),
                location: defect_location(item),
            })
        })
        .collect()
}

fn legionella_defects(payload: &Value) -> Vec<DetectedDefect> {
    let mut defects: Vec<DetectedDefect> = iter_items(payload, &["recommendations"])
        .filter_map(|item| {
            let priority = item_str(item, &["priority"]).unwrap_or_default().to_uppercase();
            let code = match priority.as_str() {
                "IMMEDIATE" => "LEG_CRITICAL",
                "HIGH" => "LEG_HIGH",
                "MEDIUM" => "LEG_MEDIUM",
                "LOW" => "LEG_LOW",
                _ => return None,
            };
            Some(DetectedDefect {
                code: code.into(),
                description: defect_description(item, "Legionella control recommendation"),
                location: defect_location(item),
            })
        })
        .collect();

    if payload
        .get("outbreakSuspected")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        defects.push(DetectedDefect {
            code: "LEG_OUTBREAK".into(),
            description: "Suspected legionella outbreak".into(),
            location: "Property".into(),
        });
    }
    defects
}

fn lift_defects(payload: &Value) -> Vec<DetectedDefect> {
    iter_items(payload, &["defects"])
        .map(|item| {
            let code = match item_str(item, &["category"])
                .unwrap_or_default()
                .trim()
                .to_uppercase()
                .as_str()
            {
                "A" => "LIFT_CAT_A",
                "B" => "LIFT_CAT_B",
                _ => "LIFT_CAT_C",
            };
            DetectedDefect {
                code: code.into(),
                description: defect_description(item, "Lift examination defect"),
                location: defect_location(item),
            }
        })
        .collect()
}

fn tree_defects(payload: &Value) -> Vec<DetectedDefect> {
    iter_items(payload, &["defects", "findings"])
        .map(|item| {
            let risk = item_str(item, &["risk", "priority"]).unwrap_or_default().to_uppercase();
            let code = if risk.contains("DANGER") || risk == "IMMEDIATE" {
                "TREE_DANGEROUS"
            } else if risk == "HIGH" || risk == "URGENT" {
                "TREE_URGENT"
            } else {
                "TREE_ROUTINE"
            };
            DetectedDefect {
                code: code.into(),
                description: defect_description(item, "Tree survey finding"),
                location: defect_location(item),
            }
        })
        .collect()
}

fn hhsrs_defects(payload: &Value) -> Vec<DetectedDefect> {
    iter_items(payload, &["hazards", "defects"])
        .map(|item| {
            let band = item_str(item, &["category", "band"]).unwrap_or_default().to_uppercase();
            let severity = item_str(item, &["severity", "priority"])
                .unwrap_or_default()
                .to_uppercase();
            let code = if band.contains('1') {
                "HHSRS_CAT1"
            } else if severity == "HIGH" {
                "HHSRS_CAT2_HIGH"
            } else if severity == "MEDIUM" {
                "HHSRS_CAT2_MED"
            } else {
                "HHSRS_CAT2_LOW"
            };
            DetectedDefect {
                code: code.into(),
                description: defect_description(item, "HHSRS hazard"),
                location: defect_location(item),
            }
        })
        .collect()
}

fn epc_defects(payload: &Value) -> Vec<DetectedDefect> {
    let rating = payload
        .get("currentRating")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_uppercase();
    match rating.as_str() {
        "E" | "F" | "G" => vec![DetectedDefect {
            code: format!("EPC_{rating}"),
            description: format!("Energy rating {rating}; improvement works required"),
            location: "Property".into(),
        }],
        _ => Vec::new(),
    }
}

fn equipment_defects(payload: &Value, code: &str) -> Vec<DetectedDefect> {
    iter_items(payload, &["defects", "findings", "observations"])
        .map(|item| DetectedDefect {
            code: code.into(),
            description: defect_description(item, "Defect identified"),
            location: defect_location(item),
        })
        .collect()
}

fn graded_defects(
    payload: &Value,
    keys: &'static [&'static str],
    grades: &[(&str, &str)],
    default_code: &str,
) -> Vec<DetectedDefect> {
    iter_items(payload, keys)
        .map(|item| {
            let risk = item_str(item, &["risk", "severity", "priority"])
                .unwrap_or_default()
                .to_uppercase();
            let code = grades
                .iter()
                .find_map(|(token, code)| (risk == *token).then_some(*code))
                .unwrap_or(default_code);
            DetectedDefect {
                code: code.into(),
                description: defect_description(item, "Inspection finding"),
                location: defect_location(item),
            }
        })
        .collect()
}

/// Built-in severity for each code family, used when no config row
/// overrides it.
fn default_severity(code: &str) -> Severity {
    match code {
        "ID" | "C1" | "INTOLERABLE" | "ACM_CRITICAL" | "LEG_CRITICAL" | "LEG_OUTBREAK"
        | "LIFT_CAT_A" | "HHSRS_CAT1" | "DAMP_CRITICAL" | "PLAY_CRITICAL" | "TREE_DANGEROUS" => {
            Severity::Immediate
        }
        "AR" | "C2" | "FI" | "SUBSTANTIAL" | "ACM_HIGH" | "LEG_HIGH" | "LIFT_CAT_B"
        | "HHSRS_CAT2_HIGH" | "DAMP_SEVERE" | "PLAY_HIGH" | "TREE_URGENT" | "SPRINKLER_DEFECT"
        | "AOV_DEFECT" | "FIRE_DOOR_DEFECT" | "FIRE_ALARM_DEFECT" | "EMLT_DEFECT" => {
            Severity::Urgent
        }
        "NCS" | "MODERATE" | "ACM_MEDIUM" | "LEG_MEDIUM" | "HHSRS_CAT2_MED" | "DAMP_MODERATE"
        | "PLAY_MEDIUM" | "EPC_G" | "EPC_F" => Severity::Routine,
        _ => Severity::Advisory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(code: &str) -> ClassificationCode {
        ClassificationCode {
            certificate_type: "EICR".into(),
            code: code.into(),
            severity: None,
            description: String::new(),
            action_required: Some("Rectify per config".into()),
            auto_create_action: true,
            cost_estimate_low_pence: Some(15_000),
            cost_estimate_high_pence: Some(40_000),
            action_severity: Some("URGENT".into()),
        }
    }

    #[test]
    fn due_dates_follow_the_severity_horizon() {
        let now = Utc::now();
        assert_eq!(Severity::Immediate.due_date(now), now + Duration::days(1));
        assert_eq!(Severity::Urgent.due_date(now), now + Duration::days(7));
        assert_eq!(Severity::Routine.due_date(now), now + Duration::days(30));
        assert_eq!(Severity::Advisory.due_date(now), now + Duration::days(90));
    }

    #[test]
    fn config_rule_supplies_description_severity_and_cost() {
        let rule = rule("C2");
        let rules = HashMap::from([("C2", &rule)]);
        let payload = json!({"observations": [{"code": "C2", "description": "Loose earth", "location": "Kitchen"}]});
        let actions = config_driven_actions("EICR", &payload, &rules);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].code, "C2");
        assert_eq!(actions[0].description, "Rectify per config");
        assert_eq!(actions[0].severity, Severity::Urgent);
        assert_eq!(actions[0].cost_estimate, "£150-400");
        assert_eq!(actions[0].location, "Kitchen");
    }

    #[test]
    fn auto_create_false_suppresses_the_action() {
        let mut suppressed = rule("C3");
        suppressed.auto_create_action = false;
        let rules = HashMap::from([("C3", &suppressed)]);
        let payload = json!({"observations": [{"code": "C3", "description": "Improvement recommended"}]});
        assert!(config_driven_actions("EICR", &payload, &rules).is_empty());
    }

    #[test]
    fn missing_rule_falls_back_to_defect_text_and_default_severity() {
        let rules = HashMap::new();
        let payload = json!({"observations": [{"code": "C1", "description": "Exposed live part", "location": "Hallway"}]});
        let actions = config_driven_actions("EICR", &payload, &rules);
        assert_eq!(actions[0].severity, Severity::Immediate);
        assert_eq!(actions[0].description, "Exposed live part");
        assert_eq!(actions[0].cost_estimate, "TBD");
    }

    #[test]
    fn gas_unsafe_appliance_raises_an_immediate_action() {
        let payload = json!({"appliances": [{"type": "Gas Boiler", "applianceSafe": false, "location": "Airing cupboard"}]});
        let actions = fallback_actions("GAS_SAFETY", &payload, Outcome::Unsatisfactory);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].code, "ID");
        assert_eq!(actions[0].severity, Severity::Immediate);
    }

    #[test]
    fn gas_classifications_resolve_to_their_own_codes() {
        let payload = json!({"defects": [
            {"classification": "Not to Current Standard", "description": "Flue termination below standard"},
            {"classification": "AR", "description": "Gas escape at union"},
            {"classification": "Immediately Dangerous", "description": "Open-flued boiler spilling"}
        ]});
        let actions = fallback_actions("GAS_SAFETY", &payload, Outcome::Unsatisfactory);
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].code, "NCS");
        assert_eq!(actions[0].severity, Severity::Routine);
        assert_eq!(actions[1].code, "AR");
        assert_eq!(actions[1].severity, Severity::Urgent);
        assert_eq!(actions[2].code, "ID");
        assert_eq!(actions[2].severity, Severity::Immediate);
    }

    #[test]
    fn fallback_sweeper_covers_unsatisfactory_with_no_defects() {
        let actions = fallback_actions("EPC", &json!({}), Outcome::Unsatisfactory);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].code, "REVIEW-EPC");
        assert_eq!(actions[0].severity, Severity::Urgent);
    }

    #[test]
    fn satisfactory_certificates_get_no_sweeper_action() {
        assert!(fallback_actions("EPC", &json!({}), Outcome::Satisfactory).is_empty());
    }

    #[test]
    fn fra_findings_map_onto_the_risk_ladder() {
        let payload = json!({"findings": [
            {"priority": "Intolerable", "description": "Blocked escape route"},
            {"priority": "Low", "description": "Signage faded"}
        ]});
        let actions = fallback_actions("FRA", &payload, Outcome::Unsatisfactory);
        assert_eq!(actions[0].code, "INTOLERABLE");
        assert_eq!(actions[0].severity, Severity::Immediate);
        assert_eq!(actions[1].code, "TOLERABLE");
        assert_eq!(actions[1].severity, Severity::Advisory);
    }

    #[test]
    fn epc_low_rating_raises_an_action() {
        let payload = json!({"currentRating": "F"});
        let actions = fallback_actions("EPC", &payload, Outcome::Satisfactory);
        assert_eq!(actions[0].code, "EPC_F");
        assert_eq!(actions[0].severity, Severity::Routine);
    }
}
