use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::warn;

use crate::config;

/// Result of one Document-Intelligence call. `succeeded=false` outcomes
/// carry the error text and are never usable; the orchestrator falls back
/// to local text extraction.
#[derive(Debug, Clone, Default)]
pub struct OcrOutcome {
    pub succeeded: bool,
    pub raw_text: String,
    pub confidence: f64,
    pub structured_data: Option<Value>,
    pub processing_time_ms: u64,
    pub error: Option<String>,
}

impl OcrOutcome {
    /// Usable iff the service succeeded and returned either a substantial
    /// body of text, or a shorter body it is confident about.
    pub fn is_usable(&self) -> bool {
        self.succeeded
            && (self.raw_text.len() > 100
                || (self.raw_text.len() > 50 && self.confidence >= 0.7))
    }

    fn failure(error: impl Into<String>, started: Instant) -> Self {
        Self {
            succeeded: false,
            error: Some(error.into()),
            processing_time_ms: started.elapsed().as_millis() as u64,
            ..Self::default()
        }
    }
}

pub struct OcrClient {
    http: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl OcrClient {
    pub fn from_env() -> Self {
        Self::new(config::OCR_ENDPOINT.clone(), config::OCR_API_KEY.clone())
    }

    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint,
            api_key,
        }
    }

    pub async fn analyze(&self, bytes: &[u8], mime_type: &str) -> OcrOutcome {
        let started = Instant::now();
        let (Some(endpoint), Some(api_key)) = (self.endpoint.as_ref(), self.api_key.as_ref())
        else {
            return OcrOutcome::failure("OCR service not configured", started);
        };

        let response = self
            .http
            .post(endpoint)
            .header("Ocp-Apim-Subscription-Key", api_key)
            .header(CONTENT_TYPE, mime_type)
            .body(bytes.to_vec())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!(?err, "OCR request failed");
                return OcrOutcome::failure(err.to_string(), started);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "OCR service returned error");
            return OcrOutcome::failure(
                format!("OCR service returned {status}: {}", truncate(&body, 200)),
                started,
            );
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!(?err, "OCR response was not JSON");
                return OcrOutcome::failure(err.to_string(), started);
            }
        };

        let (raw_text, confidence) = parse_analyze_body(&body);
        OcrOutcome {
            succeeded: true,
            raw_text,
            confidence,
            structured_data: Some(body),
            processing_time_ms: started.elapsed().as_millis() as u64,
            error: None,
        }
    }
}

/// Pull the recognised text and an aggregate word confidence out of a
/// Document-Intelligence analyze body. Accepts both the wrapped
/// (`analyzeResult`) and bare response shapes.
fn parse_analyze_body(body: &Value) -> (String, f64) {
    let result = body.get("analyzeResult").unwrap_or(body);
    let text = result
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut confidences = Vec::new();
    if let Some(pages) = result.get("pages").and_then(Value::as_array) {
        for page in pages {
            if let Some(words) = page.get("words").and_then(Value::as_array) {
                confidences.extend(
                    words
                        .iter()
                        .filter_map(|word| word.get("confidence").and_then(Value::as_f64)),
                );
            }
        }
    }

    let confidence = if confidences.is_empty() {
        if text.is_empty() {
            0.0
        } else {
            result
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.8)
        }
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    (text, confidence)
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(succeeded: bool, text: &str, confidence: f64) -> OcrOutcome {
        OcrOutcome {
            succeeded,
            raw_text: text.to_string(),
            confidence,
            ..OcrOutcome::default()
        }
    }

    #[test]
    fn long_text_is_usable_regardless_of_confidence() {
        assert!(outcome(true, &"x".repeat(101), 0.1).is_usable());
    }

    #[test]
    fn short_text_needs_confidence() {
        assert!(outcome(true, &"x".repeat(60), 0.7).is_usable());
        assert!(!outcome(true, &"x".repeat(60), 0.69).is_usable());
        assert!(!outcome(true, &"x".repeat(50), 0.99).is_usable());
    }

    #[test]
    fn failed_outcomes_are_never_usable() {
        assert!(!outcome(false, &"x".repeat(500), 1.0).is_usable());
    }

    #[test]
    fn parse_prefers_word_confidences() {
        let body = json!({
            "analyzeResult": {
                "content": "LANDLORD GAS SAFETY RECORD",
                "pages": [
                    {"words": [{"confidence": 0.9}, {"confidence": 0.7}]}
                ]
            }
        });
        let (text, confidence) = parse_analyze_body(&body);
        assert_eq!(text, "LANDLORD GAS SAFETY RECORD");
        assert!((confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn parse_handles_empty_body() {
        let (text, confidence) = parse_analyze_body(&json!({}));
        assert!(text.is_empty());
        assert_eq!(confidence, 0.0);
    }
}
