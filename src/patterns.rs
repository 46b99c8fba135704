use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::classify::Category;

/// Filename and header heuristics for the metadata tier. Returns only a
/// category guess; the caller records it and escalates.
pub fn guess_category_from_filename(filename: &str) -> Category {
    let upper = filename.to_uppercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| upper.contains(needle));
    if has(&["GAS", "CP12", "LGSR"]) {
        Category::GasSafety
    } else if has(&["EICR", "ELECTRIC"]) {
        Category::Eicr
    } else if has(&["EPC", "ENERGY"]) {
        Category::Epc
    } else if has(&["FRA", "FIRE"]) {
        Category::FireRiskAssessment
    } else if has(&["LEGIONELLA", "LEG_", "WATER"]) {
        Category::LegionellaAssessment
    } else if has(&["ASBESTOS", "ASB"]) {
        Category::AsbestosSurvey
    } else if has(&["LOLER", "LIFT", "HOIST"]) {
        Category::LiftLoler
    } else {
        Category::Other
    }
}

static CATEGORY_MARKERS: Lazy<Vec<(Category, Regex)>> = Lazy::new(|| {
    let marker = |pattern: &str| Regex::new(pattern).expect("category marker regex");
    vec![
        (
            Category::GasSafety,
            marker(r"(?i)landlord\s+gas\s+safety|gas\s+safety\s+record|CP12|LGSR"),
        ),
        (
            Category::Eicr,
            marker(r"(?i)electrical\s+installation\s+condition|EICR"),
        ),
        (Category::Epc, marker(r"(?i)energy\s+performance\s+certificate")),
        (
            Category::FireRiskAssessment,
            marker(r"(?i)fire\s+risk\s+assessment"),
        ),
        (
            Category::LegionellaAssessment,
            marker(r"(?i)legionella\s+risk|water\s+hygiene"),
        ),
        (Category::AsbestosSurvey, marker(r"(?i)asbestos\s+(survey|report)")),
        (
            Category::LiftLoler,
            marker(r"(?i)thorough\s+examination|LOLER"),
        ),
    ]
});

static CERTIFICATE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:certificate|report|record|job)\s*(?:no|number|ref(?:erence)?)[.:#]?\s*([A-Z0-9][A-Z0-9/-]{3,19})")
        .expect("certificate number regex")
});

static ISSUE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:date\s+of\s+(?:issue|inspection|assessment)|issue\s+date|issued(?:\s+on)?|inspection\s+date)[.:]?\s*(\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4}|\d{1,2}\s+\w+\s+\d{4})")
        .expect("issue date regex")
});

static EXPIRY_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:expiry\s+date|expires(?:\s+on)?|next\s+(?:inspection|examination|review)\s+(?:date|due)|due\s+date|valid\s+until)[.:]?\s*(\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4}|\d{1,2}\s+\w+\s+\d{4})")
        .expect("expiry date regex")
});

#[derive(Debug, Clone)]
pub struct PatternExtraction {
    pub payload: Value,
    pub confidence: f64,
    pub field_count: i32,
}

/// Regex-library extraction over plain text. Confidence scales with the
/// number of core fields recovered; three or more matches clear the
/// default escalation threshold.
pub fn extract_with_patterns(hint: Category, text: &str) -> Option<PatternExtraction> {
    if text.trim().is_empty() {
        return None;
    }

    let marker_category = CATEGORY_MARKERS
        .iter()
        .find(|(_, marker)| marker.is_match(text))
        .map(|(category, _)| *category);
    let category = match (hint, marker_category) {
        (Category::Other, Some(found)) => Some(found),
        (Category::Other, None) => None,
        (selected, _) => Some(selected),
    };

    let certificate_number = CERTIFICATE_NUMBER
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string());
    let issue_date = ISSUE_DATE
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|found| parse_date(found.as_str()));
    let expiry_date = EXPIRY_DATE
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|found| parse_date(found.as_str()));

    let mut field_count = 0;
    let mut payload = serde_json::Map::new();
    if let Some(category) = category {
        if marker_category.is_some() || hint != Category::Other {
            field_count += 1;
        }
        payload.insert("certificateType".into(), json!(category.as_str()));
    }
    if let Some(number) = certificate_number {
        field_count += 1;
        payload.insert("certificateNumber".into(), json!(number));
    }
    if let Some(date) = issue_date {
        field_count += 1;
        payload.insert("issueDate".into(), json!(date.to_string()));
    }
    if let Some(date) = expiry_date {
        field_count += 1;
        payload.insert("expiryDate".into(), json!(date.to_string()));
    }

    if payload.is_empty() {
        return None;
    }

    Some(PatternExtraction {
        payload: Value::Object(payload),
        confidence: 0.25 + 0.17 * field_count as f64,
        field_count,
    })
}

/// UK-first date parsing: day-month-year forms, long-form dates, and ISO.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%d",
        "%d/%m/%Y",
        "%d-%m-%Y",
        "%d.%m.%Y",
        "%d/%m/%y",
        "%d %B %Y",
    ];
    FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw.trim(), format).ok())
}
