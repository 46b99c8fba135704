use sqlx::PgPool;

/// One row of the remediation rulebook. `code` is unique within a
/// certificate type.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClassificationCode {
    pub certificate_type: String,
    pub code: String,
    pub severity: Option<String>,
    pub description: String,
    pub action_required: Option<String>,
    pub auto_create_action: bool,
    pub cost_estimate_low_pence: Option<i64>,
    pub cost_estimate_high_pence: Option<i64>,
    pub action_severity: Option<String>,
}

impl ClassificationCode {
    /// Human cost band in pounds, e.g. `£150-400`, or `TBD` when either
    /// bound is missing.
    pub fn cost_band(&self) -> String {
        match (self.cost_estimate_low_pence, self.cost_estimate_high_pence) {
            (Some(low), Some(high)) => format!("£{}-{}", low / 100, high / 100),
            _ => "TBD".to_string(),
        }
    }
}

/// Load the rulebook, filtered by certificate type when one is known.
/// `UNKNOWN`/`OTHER` load the whole table so cross-category codes still
/// resolve.
pub async fn load_for_type(
    pool: &PgPool,
    certificate_type: &str,
) -> Result<Vec<ClassificationCode>, sqlx::Error> {
    const COLUMNS: &str = "certificate_type, code, severity, description, action_required, \
                           auto_create_action, cost_estimate_low_pence, \
                           cost_estimate_high_pence, action_severity";
    if certificate_type == "UNKNOWN" || certificate_type == "OTHER" {
        sqlx::query_as::<_, ClassificationCode>(&format!(
            "SELECT {COLUMNS} FROM classification_codes"
        ))
        .fetch_all(pool)
        .await
    } else {
        sqlx::query_as::<_, ClassificationCode>(&format!(
            "SELECT {COLUMNS} FROM classification_codes WHERE certificate_type = $1"
        ))
        .bind(certificate_type)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_band_formats_pence_as_pounds() {
        let mut code = ClassificationCode {
            certificate_type: "EICR".into(),
            code: "C2".into(),
            severity: None,
            description: String::new(),
            action_required: None,
            auto_create_action: true,
            cost_estimate_low_pence: Some(15_000),
            cost_estimate_high_pence: Some(40_000),
            action_severity: None,
        };
        assert_eq!(code.cost_band(), "£150-400");

        code.cost_estimate_high_pence = None;
        assert_eq!(code.cost_band(), "TBD");
    }
}
