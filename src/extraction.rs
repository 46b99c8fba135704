use std::time::Instant;

use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::Category;
use crate::db::extraction_runs::{self, NewTierAudit};
use crate::db::factory_settings;
use crate::llm::{self, LlmClient, LlmError, LlmRequest};
use crate::ocr::OcrClient;
use crate::patterns;
use crate::text_extract::{extract_pdf_text, PdfText};

pub const METHOD_METADATA: &str = "METADATA_EXTRACTION";
pub const METHOD_PATTERN: &str = "PATTERN_MATCHING";
pub const METHOD_OCR_ANALYSIS: &str = "AZURE_OCR_CLAUDE_ANALYSIS";
pub const METHOD_VISION: &str = "CLAUDE_VISION";
pub const METHOD_MANUAL: &str = "MANUAL";

pub const OCR_PROVIDER_AZURE: &str = "AZURE_DOCUMENT_INTELLIGENCE";
pub const OCR_PROVIDER_LOCAL: &str = "PDFJS_LOCAL";

const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.75;
/// Local text shorter than this is not trusted for a text-only LLM pass;
/// the cascade goes through OCR instead.
const TEXT_ANALYSIS_MIN_CHARS: usize = 500;
/// Minimum text the vision tier will attach to a prompt.
const VISION_MIN_TEXT_CHARS: usize = 50;

const COST_OCR_PENCE: i64 = 5;
const COST_LLM_PENCE: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Metadata,
    Pattern,
    Text,
    TextAnalysis,
    Ocr,
    Vision,
    HumanReview,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Metadata => "tier-0",
            Tier::Pattern => "tier-0.5",
            Tier::Text => "tier-1",
            Tier::TextAnalysis => "tier-1.5",
            Tier::Ocr => "tier-2",
            Tier::Vision => "tier-3",
            Tier::HumanReview => "tier-4",
        }
    }

    pub fn ordinal(&self) -> i32 {
        match self {
            Tier::Metadata => 0,
            Tier::Pattern => 1,
            Tier::Text => 2,
            Tier::TextAnalysis => 3,
            Tier::Ocr => 4,
            Tier::Vision => 5,
            Tier::HumanReview => 6,
        }
    }

    pub fn from_name(name: &str) -> Option<Tier> {
        match name {
            "tier-0" => Some(Tier::Metadata),
            "tier-0.5" => Some(Tier::Pattern),
            "tier-1" => Some(Tier::Text),
            "tier-1.5" => Some(Tier::TextAnalysis),
            "tier-2" => Some(Tier::Ocr),
            "tier-3" => Some(Tier::Vision),
            "tier-4" => Some(Tier::HumanReview),
            _ => None,
        }
    }
}

/// Persisted ordinal for a tier name. Unknown names persist as 6 with a
/// warning so malformed audit data still sorts last.
pub fn tier_ordinal_for_name(name: &str) -> i32 {
    match Tier::from_name(name) {
        Some(tier) => tier.ordinal(),
        None => {
            warn!(tier = name, "unknown tier name; persisting ordinal 6");
            6
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub force_ai: bool,
}

/// What one orchestrator pass settled on. The run row is created by the
/// pass and finalised by the coordinator once normalisation is done.
#[derive(Debug, Clone)]
pub struct TieredResult {
    pub run_id: Uuid,
    pub payload: Value,
    pub tier: Tier,
    pub confidence: f64,
    pub requires_review: bool,
    pub validation_passed: bool,
    pub method: &'static str,
    pub model: Option<String>,
    pub document_type: Option<String>,
    pub ocr_provider: Option<&'static str>,
    pub text_quality: &'static str,
    pub page_count: i32,
    pub processing_time_ms: i64,
    pub cost_pence: i64,
}

struct Candidate {
    payload: Value,
    tier: Tier,
    confidence: f64,
    method: &'static str,
    ocr_provider: Option<&'static str>,
}

// key: extraction-orchestrator -> tier-cascade
pub struct TieredExtractor {
    ocr: OcrClient,
    llm: LlmClient,
}

impl TieredExtractor {
    pub fn from_env() -> Self {
        Self {
            ocr: OcrClient::from_env(),
            llm: LlmClient::from_env(),
        }
    }

    pub fn new(ocr: OcrClient, llm: LlmClient) -> Self {
        Self { ocr, llm }
    }

    /// Cascade the document through the extraction tiers, gating each on
    /// validation and a category confidence threshold, recording one audit
    /// row per attempt. Returns the first passing tier, or the
    /// highest-confidence attempt flagged for human review.
    pub async fn extract(
        &self,
        pool: &PgPool,
        certificate_id: Uuid,
        bytes: &[u8],
        mime_type: &str,
        filename: &str,
        category_hint: Category,
        opts: &ExtractOptions,
    ) -> Result<TieredResult, sqlx::Error> {
        let run_id = extraction_runs::create(pool, certificate_id).await?;
        let started = Instant::now();
        let mut cost_pence = 0i64;
        let mut best: Option<Candidate> = None;

        let category = match category_hint {
            Category::Other => patterns::guess_category_from_filename(filename),
            selected => selected,
        };
        let threshold = confidence_threshold(pool, category).await;
        let prompt = llm::prompt_for_category(pool, category.as_str()).await;

        let pdf_text = if mime_type == "application/pdf" || bytes.starts_with(b"%PDF-") {
            extract_pdf_text(bytes)
        } else {
            PdfText::default()
        };
        let text_quality = if pdf_text.text.len() > TEXT_ANALYSIS_MIN_CHARS {
            "good"
        } else if !pdf_text.is_empty() {
            "poor"
        } else {
            "none"
        };
        let page_count = pdf_text.page_count as i32;

        // Tier 0: metadata. Category guess only, so it always escalates.
        if opts.force_ai {
            self.skip(pool, run_id, Tier::Metadata, "force_ai").await?;
        } else {
            let tier_started = Instant::now();
            let payload = json!({ "certificateType": category.as_str() });
            self.audit(
                pool,
                NewTierAudit {
                    run_id,
                    tier_name: Tier::Metadata.as_str(),
                    tier_order: Tier::Metadata.ordinal(),
                    status: "escalated",
                    confidence: Some(0.2),
                    processing_time_ms: tier_started.elapsed().as_millis() as i64,
                    cost_pence: 0,
                    field_count: 1,
                    escalation_reason: Some("metadata_only"),
                    page_count: Some(page_count),
                    raw_output: Some(&payload),
                },
            )
            .await?;
            best = better(best, Candidate {
                payload,
                tier: Tier::Metadata,
                confidence: 0.2,
                method: METHOD_METADATA,
                ocr_provider: None,
            });
        }

        // Tier 0.5: regex library over the locally-extracted text.
        if opts.force_ai {
            self.skip(pool, run_id, Tier::Pattern, "force_ai").await?;
        } else if pdf_text.is_empty() {
            self.fail(pool, run_id, Tier::Pattern, "no_text", None).await?;
        } else {
            let tier_started = Instant::now();
            match patterns::extract_with_patterns(category, &pdf_text.text) {
                Some(extraction) => {
                    let validation = validate_payload(category, &extraction.payload);
                    let passing =
                        validation.is_ok() && extraction.confidence >= threshold;
                    let status = if passing { "success" } else { "escalated" };
                    self.audit(
                        pool,
                        NewTierAudit {
                            run_id,
                            tier_name: Tier::Pattern.as_str(),
                            tier_order: Tier::Pattern.ordinal(),
                            status,
                            confidence: Some(extraction.confidence),
                            processing_time_ms: tier_started.elapsed().as_millis() as i64,
                            cost_pence: 0,
                            field_count: extraction.field_count,
                            escalation_reason: (!passing)
                                .then(|| validation.err().unwrap_or("low_confidence")),
                            page_count: Some(page_count),
                            raw_output: Some(&extraction.payload),
                        },
                    )
                    .await?;
                    let candidate = Candidate {
                        payload: extraction.payload,
                        tier: Tier::Pattern,
                        confidence: extraction.confidence,
                        method: METHOD_PATTERN,
                        ocr_provider: None,
                    };
                    if passing {
                        return Ok(self.finish(
                            run_id, candidate, true, text_quality, page_count, cost_pence, started,
                        ));
                    }
                    best = better(best, candidate);
                }
                None => {
                    self.fail(pool, run_id, Tier::Pattern, "no_matches", None).await?;
                }
            }
        }

        // Tier 1: local PDF text extraction. Audit trail for C2; the text
        // itself feeds the later tiers, so this always escalates.
        if opts.force_ai {
            self.skip(pool, run_id, Tier::Text, "force_ai").await?;
        } else if pdf_text.is_empty() {
            self.fail(pool, run_id, Tier::Text, "no_text", Some(page_count)).await?;
        } else {
            let raw = json!({
                "textLength": pdf_text.text.len(),
                "pageCount": pdf_text.page_count,
                "quality": text_quality,
            });
            self.audit(
                pool,
                NewTierAudit {
                    run_id,
                    tier_name: Tier::Text.as_str(),
                    tier_order: Tier::Text.ordinal(),
                    status: "escalated",
                    confidence: None,
                    processing_time_ms: 0,
                    cost_pence: 0,
                    field_count: 0,
                    escalation_reason: Some("text_extraction_only"),
                    page_count: Some(page_count),
                    raw_output: Some(&raw),
                },
            )
            .await?;
        }

        // Tier 1.5: LLM analysis of good local text, skipping the paid OCR
        // round trip entirely.
        let mut ocr_text: Option<String> = None;
        if opts.force_ai {
            self.skip(pool, run_id, Tier::TextAnalysis, "force_ai").await?;
        } else if pdf_text.text.len() <= TEXT_ANALYSIS_MIN_CHARS {
            self.skip(pool, run_id, Tier::TextAnalysis, "insufficient_text").await?;
        } else {
            cost_pence += COST_LLM_PENCE;
            if let Some(result) = self
                .llm_tier(
                    pool,
                    run_id,
                    Tier::TextAnalysis,
                    METHOD_OCR_ANALYSIS,
                    Some(OCR_PROVIDER_LOCAL),
                    LlmRequest {
                        prompt: &prompt,
                        image: None,
                        document_text: Some(&pdf_text.text),
                    },
                    0.85,
                    category,
                    threshold,
                    page_count,
                    &mut best,
                )
                .await?
            {
                return Ok(self.finish(
                    run_id, result, true, text_quality, page_count, cost_pence, started,
                ));
            }
        }

        // Tier 2: commercial OCR, then LLM analysis of its text.
        if opts.force_ai {
            self.skip(pool, run_id, Tier::Ocr, "force_ai").await?;
        } else {
            let tier_started = Instant::now();
            let outcome = self.ocr.analyze(bytes, mime_type).await;
            cost_pence += COST_OCR_PENCE;
            if outcome.is_usable() {
                cost_pence += COST_LLM_PENCE;
                let text = outcome.raw_text.clone();
                ocr_text = Some(outcome.raw_text);
                if let Some(result) = self
                    .llm_tier(
                        pool,
                        run_id,
                        Tier::Ocr,
                        METHOD_OCR_ANALYSIS,
                        Some(OCR_PROVIDER_AZURE),
                        LlmRequest {
                            prompt: &prompt,
                            image: None,
                            document_text: Some(&text),
                        },
                        0.85,
                        category,
                        threshold,
                        page_count,
                        &mut best,
                    )
                    .await?
                {
                    return Ok(self.finish(
                        run_id, result, true, text_quality, page_count, cost_pence, started,
                    ));
                }
            } else {
                // Keep whatever text OCR produced as a last resort for the
                // vision tier.
                if !outcome.raw_text.is_empty() {
                    ocr_text = Some(outcome.raw_text.clone());
                }
                let reason = outcome.error.as_deref().unwrap_or("ocr_unusable");
                self.audit(
                    pool,
                    NewTierAudit {
                        run_id,
                        tier_name: Tier::Ocr.as_str(),
                        tier_order: Tier::Ocr.ordinal(),
                        status: "failed",
                        confidence: Some(outcome.confidence),
                        processing_time_ms: tier_started.elapsed().as_millis() as i64,
                        cost_pence: COST_OCR_PENCE,
                        field_count: 0,
                        escalation_reason: Some(reason),
                        page_count: Some(page_count),
                        raw_output: None,
                    },
                )
                .await?;
            }
        }

        // Tier 3: vision LLM. Image input when we have one; otherwise the
        // best text seen so far; otherwise prompt-only at low confidence.
        let image = mime_type
            .starts_with("image/")
            .then_some((bytes, mime_type));
        let document_text = match &ocr_text {
            Some(text) if text.len() > VISION_MIN_TEXT_CHARS => Some(text.as_str()),
            _ if pdf_text.text.len() > VISION_MIN_TEXT_CHARS => Some(pdf_text.text.as_str()),
            _ => None,
        };
        let vision_provider = if image.is_some() {
            None
        } else if ocr_text.as_deref().map(str::len).unwrap_or(0) > VISION_MIN_TEXT_CHARS {
            Some(OCR_PROVIDER_AZURE)
        } else if document_text.is_some() {
            Some(OCR_PROVIDER_LOCAL)
        } else {
            None
        };
        let synthesised = if image.is_some() || document_text.is_some() {
            0.85
        } else {
            0.5
        };
        cost_pence += COST_LLM_PENCE;
        if let Some(result) = self
            .llm_tier(
                pool,
                run_id,
                Tier::Vision,
                METHOD_VISION,
                vision_provider,
                LlmRequest {
                    prompt: &prompt,
                    image,
                    document_text,
                },
                synthesised,
                category,
                threshold,
                page_count,
                &mut best,
            )
            .await?
        {
            return Ok(self.finish(
                run_id, result, true, text_quality, page_count, cost_pence, started,
            ));
        }

        // Tier 4: human review. Terminal; the orchestrator does not wait.
        self.audit(
            pool,
            NewTierAudit {
                run_id,
                tier_name: Tier::HumanReview.as_str(),
                tier_order: Tier::HumanReview.ordinal(),
                status: "pending",
                confidence: None,
                processing_time_ms: 0,
                cost_pence: 0,
                field_count: 0,
                escalation_reason: Some("awaiting_review"),
                page_count: Some(page_count),
                raw_output: None,
            },
        )
        .await?;

        let fallback = best.unwrap_or(Candidate {
            payload: json!({}),
            tier: Tier::HumanReview,
            confidence: 0.0,
            method: METHOD_MANUAL,
            ocr_provider: None,
        });
        info!(
            %certificate_id,
            tier = fallback.tier.as_str(),
            confidence = fallback.confidence,
            "no tier passed; flagging for review"
        );
        Ok(self.finish(run_id, fallback, false, text_quality, page_count, cost_pence, started))
    }

    /// Shared body of every LLM-backed tier: call, audit, gate. Returns the
    /// candidate when the tier passes, `None` when the cascade continues.
    #[allow(clippy::too_many_arguments)]
    async fn llm_tier(
        &self,
        pool: &PgPool,
        run_id: Uuid,
        tier: Tier,
        method: &'static str,
        ocr_provider: Option<&'static str>,
        request: LlmRequest<'_>,
        synthesised_confidence: f64,
        category: Category,
        threshold: f64,
        page_count: i32,
        best: &mut Option<Candidate>,
    ) -> Result<Option<Candidate>, sqlx::Error> {
        let tier_started = Instant::now();
        match self.llm.extract(request).await {
            Ok(extraction) => {
                let validation = validate_payload(category, &extraction.payload);
                let passing = validation.is_ok() && synthesised_confidence >= threshold;
                let status = if passing { "success" } else { "escalated" };
                self.audit(
                    pool,
                    NewTierAudit {
                        run_id,
                        tier_name: tier.as_str(),
                        tier_order: tier.ordinal(),
                        status,
                        confidence: Some(synthesised_confidence),
                        processing_time_ms: tier_started.elapsed().as_millis() as i64,
                        cost_pence: COST_LLM_PENCE,
                        field_count: field_count(&extraction.payload),
                        escalation_reason: (!passing)
                            .then(|| validation.err().unwrap_or("low_confidence")),
                        page_count: Some(page_count),
                        raw_output: Some(&extraction.payload),
                    },
                )
                .await?;
                let candidate = Candidate {
                    payload: extraction.payload,
                    tier,
                    confidence: synthesised_confidence,
                    method,
                    ocr_provider,
                };
                if passing {
                    Ok(Some(candidate))
                } else {
                    *best = better(best.take(), candidate);
                    Ok(None)
                }
            }
            Err(err) => {
                let reason = match &err {
                    LlmError::InvalidJson(_) => "invalid_json",
                    LlmError::Transport(_) => "llm_transport_error",
                    LlmError::NotConfigured => "llm_not_configured",
                };
                warn!(?err, tier = tier.as_str(), "llm tier failed");
                self.audit(
                    pool,
                    NewTierAudit {
                        run_id,
                        tier_name: tier.as_str(),
                        tier_order: tier.ordinal(),
                        status: "failed",
                        confidence: None,
                        processing_time_ms: tier_started.elapsed().as_millis() as i64,
                        cost_pence: COST_LLM_PENCE,
                        field_count: 0,
                        escalation_reason: Some(reason),
                        page_count: Some(page_count),
                        raw_output: None,
                    },
                )
                .await?;
                Ok(None)
            }
        }
    }

    fn finish(
        &self,
        run_id: Uuid,
        candidate: Candidate,
        validation_passed: bool,
        text_quality: &'static str,
        page_count: i32,
        cost_pence: i64,
        started: Instant,
    ) -> TieredResult {
        let document_type = candidate
            .payload
            .get("documentType")
            .or_else(|| candidate.payload.get("certificateType"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let model = matches!(candidate.method, METHOD_OCR_ANALYSIS | METHOD_VISION)
            .then(|| self.llm.model().to_string());
        TieredResult {
            run_id,
            confidence: candidate.confidence,
            requires_review: !validation_passed,
            validation_passed,
            method: candidate.method,
            model,
            document_type,
            ocr_provider: candidate.ocr_provider,
            text_quality,
            page_count,
            processing_time_ms: started.elapsed().as_millis() as i64,
            cost_pence,
            tier: candidate.tier,
            payload: candidate.payload,
        }
    }

    async fn audit(&self, pool: &PgPool, audit: NewTierAudit<'_>) -> Result<(), sqlx::Error> {
        extraction_runs::insert_tier_audit(pool, audit).await
    }

    async fn skip(
        &self,
        pool: &PgPool,
        run_id: Uuid,
        tier: Tier,
        reason: &str,
    ) -> Result<(), sqlx::Error> {
        self.audit(
            pool,
            NewTierAudit {
                run_id,
                tier_name: tier.as_str(),
                tier_order: tier.ordinal(),
                status: "skipped",
                confidence: None,
                processing_time_ms: 0,
                cost_pence: 0,
                field_count: 0,
                escalation_reason: Some(reason),
                page_count: None,
                raw_output: None,
            },
        )
        .await
    }

    async fn fail(
        &self,
        pool: &PgPool,
        run_id: Uuid,
        tier: Tier,
        reason: &str,
        page_count: Option<i32>,
    ) -> Result<(), sqlx::Error> {
        self.audit(
            pool,
            NewTierAudit {
                run_id,
                tier_name: tier.as_str(),
                tier_order: tier.ordinal(),
                status: "failed",
                confidence: None,
                processing_time_ms: 0,
                cost_pence: 0,
                field_count: 0,
                escalation_reason: Some(reason),
                page_count,
                raw_output: None,
            },
        )
        .await
    }
}

fn better(current: Option<Candidate>, challenger: Candidate) -> Option<Candidate> {
    match current {
        Some(existing) if existing.confidence >= challenger.confidence => Some(existing),
        _ => Some(challenger),
    }
}

/// Minimum skeletal schema every tier's JSON must satisfy before it can
/// pass: a type, at least one anchor field, and item lists for the
/// categories that require them.
pub fn validate_payload(category: Category, payload: &Value) -> Result<(), &'static str> {
    let has_str = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    };
    if !has_str("certificateType") && !has_str("documentType") {
        return Err("missing_certificate_type");
    }
    if !has_str("issueDate") && !has_str("expiryDate") && !has_str("certificateNumber") {
        return Err("missing_key_fields");
    }
    if matches!(category, Category::GasSafety | Category::Eicr) {
        let has_items = ["appliances", "defects", "observations"].iter().any(|key| {
            payload
                .get(*key)
                .and_then(Value::as_array)
                .map(|items| !items.is_empty())
                .unwrap_or(false)
        });
        if !has_items {
            return Err("missing_item_lists");
        }
    }
    Ok(())
}

fn field_count(payload: &Value) -> i32 {
    payload.as_object().map(|map| map.len() as i32).unwrap_or(0)
}

/// Category threshold for escalation, overridable through
/// `factory_settings` (`CONFIDENCE_THRESHOLD_<CATEGORY>`); 0.75 otherwise.
async fn confidence_threshold(pool: &PgPool, category: Category) -> f64 {
    let key = format!("CONFIDENCE_THRESHOLD_{}", category.as_str());
    match factory_settings::get(pool, &key).await {
        Ok(Some(raw)) => raw.parse().unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
        Ok(None) => DEFAULT_CONFIDENCE_THRESHOLD,
        Err(err) => {
            warn!(?err, "threshold lookup failed; using default");
            DEFAULT_CONFIDENCE_THRESHOLD
        }
    }
}
