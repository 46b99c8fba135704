use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config;

/// Version tag recorded against extractions so reviewed output can be tied
/// back to the prompt that produced it.
pub const PROMPT_VERSION: &str = "2024-05";

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm response contained no JSON object: {0}")]
    InvalidJson(String),
    #[error("llm not configured")]
    NotConfigured,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Transport(_))
    }
}

pub struct LlmRequest<'a> {
    pub prompt: &'a str,
    pub image: Option<(&'a [u8], &'a str)>,
    pub document_text: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct LlmExtraction {
    pub payload: Value,
    pub model: String,
    pub processing_time_ms: u64,
}

pub struct LlmClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

impl LlmClient {
    pub fn from_env() -> Self {
        Self::new(
            config::LLM_API_URL.clone(),
            config::LLM_API_KEY.clone(),
            config::LLM_MODEL.clone(),
        )
    }

    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_url,
            api_key,
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn extract(&self, request: LlmRequest<'_>) -> Result<LlmExtraction, LlmError> {
        let api_key = self.api_key.as_ref().ok_or(LlmError::NotConfigured)?;
        let started = Instant::now();

        let mut content = Vec::new();
        if let Some((bytes, mime_type)) = request.image {
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": mime_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                }
            }));
        }
        let text = match request.document_text {
            Some(document_text) => format!("{}\n\nDocument text:\n{document_text}", request.prompt),
            None => request.prompt.to_string(),
        };
        content.push(json!({"type": "text", "text": text}));

        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": content}],
        });

        let response = self
            .http
            .post(&self.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Transport(format!(
                "llm returned {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        let completion = body
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find_map(|block| block.get("text").and_then(Value::as_str))
            })
            .unwrap_or_default();

        let payload = extract_json_block(completion)
            .ok_or_else(|| LlmError::InvalidJson(completion.chars().take(200).collect()))?;
        debug!(model = %self.model, "llm extraction parsed");

        Ok(LlmExtraction {
            payload,
            model: self.model.clone(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Locate and parse the first JSON object in a completion, accepting both
/// fenced ```json blocks and a bare object embedded in prose.
pub fn extract_json_block(completion: &str) -> Option<Value> {
    if let Some(start) = completion.find("```json") {
        let rest = &completion[start + 7..];
        if let Some(end) = rest.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(rest[..end].trim()) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
    }

    let start = completion.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in completion[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &completion[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

static CATEGORY_PROMPTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (
            "GAS_SAFETY",
            "Extract the Landlord Gas Safety Record as JSON: certificateType, \
             certificateNumber, issueDate, expiryDate, address, engineer (name, \
             registrationNumber, company), appliances (type, location, make, model, \
             applianceSafe, outcome), defects (classification, description, location), \
             overallOutcome.",
        ),
        (
            "EICR",
            "Extract the Electrical Installation Condition Report as JSON: \
             certificateType, certificateNumber, issueDate, nextInspectionDate, address, \
             inspector (name, registrationNumber, company), overallAssessment, c1Count, \
             c2Count, c3Count, fiCount, observations (code, description, location).",
        ),
        (
            "EPC",
            "Extract the Energy Performance Certificate as JSON: certificateType, \
             certificateNumber, issueDate, expiryDate, address, assessor (name, \
             registrationNumber), currentRating, potentialRating, currentScore, \
             potentialScore, recommendations (description, indicativeCost).",
        ),
        (
            "FIRE_RISK_ASSESSMENT",
            "Extract the Fire Risk Assessment as JSON: certificateType, issueDate, \
             reviewDate, address, assessor (name, company), riskLevel, findings \
             (description, priority, location), overallOutcome.",
        ),
        (
            "LEGIONELLA_ASSESSMENT",
            "Extract the Legionella Risk Assessment as JSON: certificateType, issueDate, \
             reviewDate, address, assessor (name, company), riskLevel, recommendations \
             (description, priority, location), overallOutcome.",
        ),
        (
            "ASBESTOS_SURVEY",
            "Extract the Asbestos Survey as JSON: certificateType, issueDate, address, \
             surveyor (name, company), surveyType, materials (location, material, \
             condition, risk, recommendation), overallOutcome.",
        ),
        (
            "LIFT_LOLER",
            "Extract the LOLER Thorough Examination Report as JSON: certificateType, \
             certificateNumber, issueDate, nextExaminationDate, address, \
             examiner (name, company), equipment (type, identifier, location), \
             safeToOperate, defects (category, description, timescale).",
        ),
    ])
});

const GENERIC_PROMPT: &str =
    "Identify this UK social-housing compliance document and extract it as JSON: \
     documentType, certificateType, certificateNumber, issueDate, expiryDate, address, \
     issuer (name, registrationNumber, company), outcome or riskLevel, defects or \
     observations (code or classification, description, location), overallOutcome. Use \
     null for fields that are not present.";

/// Resolve the extraction prompt for a certificate category: a
/// `factory_settings` override (`PROMPT_<CATEGORY>`) wins, then the built-in
/// prompt, then the generic self-identify prompt.
pub async fn prompt_for_category(pool: &PgPool, category: &str) -> String {
    let key = format!("PROMPT_{category}");
    match crate::db::factory_settings::get(pool, &key).await {
        Ok(Some(prompt)) => return prompt,
        Ok(None) => {}
        Err(err) => warn!(?err, category, "prompt override lookup failed"),
    }
    CATEGORY_PROMPTS
        .get(category)
        .copied()
        .unwrap_or(GENERIC_PROMPT)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let completion = "Here is the extraction:\n```json\n{\"certificateType\": \"GAS_SAFETY\"}\n```";
        let value = extract_json_block(completion).unwrap();
        assert_eq!(value["certificateType"], "GAS_SAFETY");
    }

    #[test]
    fn parses_bare_object_in_prose() {
        let completion = "The document is a gas record. {\"outcome\": \"PASS\", \"nested\": {\"a\": 1}} Hope that helps.";
        let value = extract_json_block(completion).unwrap();
        assert_eq!(value["nested"]["a"], 1);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let completion = "{\"note\": \"use {curly} braces\", \"ok\": true}";
        let value = extract_json_block(completion).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn text_without_json_is_rejected() {
        assert!(extract_json_block("Sorry, I cannot read this document.").is_none());
    }

    #[test]
    fn known_categories_have_specific_prompts() {
        assert!(CATEGORY_PROMPTS.contains_key("GAS_SAFETY"));
        assert!(CATEGORY_PROMPTS.contains_key("LIFT_LOLER"));
        assert!(!CATEGORY_PROMPTS.contains_key("OTHER"));
    }
}
