use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use super::dedup::UniqueEntity;
use super::normalizer::normalize_entity_key;
use super::types::{Category, EntityResolution, Method, QuarantineReason, ResolutionResult};
use crate::environment::ResolverSettings;
use crate::error::EnrichError;
use crate::llm::{InferenceBackend, InferenceReply, InferenceRequest};
use crate::util::jittered_backoff;
use crate::TARGET_LLM_REQUEST;

/// Confidence given to inferred countries when the response carries none.
pub const INFERENCE_CONFIDENCE: f64 = 0.95;

lazy_static! {
    static ref CODE_FENCE: Regex =
        Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\r?\n?```$").expect("valid regex");
}

/// One element of a parsed inference response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntity {
    pub institution: String,
    pub country: Option<String>,
    pub category: Category,
    pub confidence: Option<f64>,
    /// The category label was outside the fixed set and was coerced to `Unknown`.
    pub category_coerced: bool,
    pub raw: String,
}

/// Everything a resolution pass produced, for run reporting.
#[derive(Debug, Default, Clone)]
pub struct BatchStats {
    pub batches: usize,
    pub api_calls: usize,
    pub failed_attempts: usize,
    pub rate_limit_waits: Vec<Duration>,
    pub backoff_waits: Vec<Duration>,
    pub invalid_categories: usize,
}

impl BatchStats {
    fn absorb(&mut self, other: BatchStats) {
        self.batches += other.batches;
        self.api_calls += other.api_calls;
        self.failed_attempts += other.failed_attempts;
        self.rate_limit_waits.extend(other.rate_limit_waits);
        self.backoff_waits.extend(other.backoff_waits);
        self.invalid_categories += other.invalid_categories;
    }
}

/// Resolves unique entities through the inference API in bounded batches.
///
/// Each batch moves `Pending -> Sent -> {Success, RateLimited -> Sent, Failed}`. A failure
/// that exhausts the retry budget quarantines every entity of that batch; an entity that is
/// only missing from an otherwise valid response is quarantined on its own.
pub struct BatchResolver<'a> {
    backend: &'a dyn InferenceBackend,
    settings: &'a ResolverSettings,
    last_request: Option<Instant>,
    stats: BatchStats,
}

impl<'a> BatchResolver<'a> {
    pub fn new(backend: &'a dyn InferenceBackend, settings: &'a ResolverSettings) -> Self {
        Self {
            backend,
            settings,
            last_request: None,
            stats: BatchStats::default(),
        }
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    pub fn take_stats(&mut self) -> BatchStats {
        std::mem::take(&mut self.stats)
    }

    pub fn batch_size(&self) -> usize {
        self.settings.batch_size.max(1)
    }

    /// Resolves all `entities`, keyed by their normalized key.
    pub async fn resolve_batch(
        &mut self,
        entities: &[&UniqueEntity],
    ) -> HashMap<String, EntityResolution> {
        let mut resolved = HashMap::with_capacity(entities.len());
        for chunk in entities.chunks(self.batch_size()) {
            resolved.extend(self.resolve_chunk(chunk).await);
        }
        resolved
    }

    /// Resolves one request's worth of entities.
    pub async fn resolve_chunk(
        &mut self,
        chunk: &[&UniqueEntity],
    ) -> HashMap<String, EntityResolution> {
        if chunk.is_empty() {
            return HashMap::new();
        }

        let mut stats = BatchStats {
            batches: 1,
            ..BatchStats::default()
        };
        let request = InferenceRequest::for_institutions(
            chunk.iter().map(|e| e.display_name.clone()).collect(),
        );

        let mut attempt: u32 = 0;
        let mut consecutive_rate_limits: u32 = 0;

        let outcome = loop {
            self.pace().await;
            stats.api_calls += 1;

            let failure = match self.backend.complete(&request).await {
                Ok(InferenceReply::RateLimited { retry_after }) => {
                    if consecutive_rate_limits >= self.settings.max_rate_limit_waits {
                        break Err(QuarantineReason::RateLimitExhausted {
                            waits: consecutive_rate_limits,
                        });
                    }
                    consecutive_rate_limits += 1;
                    let wait = retry_after.unwrap_or(self.settings.default_retry_after);
                    warn!(target: TARGET_LLM_REQUEST, "{} on batch of {} entities, waiting {:?}", EnrichError::RateLimited { retry_after }, chunk.len(), wait);
                    stats.rate_limit_waits.push(wait);
                    sleep(wait).await;
                    continue;
                }
                Ok(InferenceReply::Text(text)) => {
                    consecutive_rate_limits = 0;
                    match parse_inference_response(&text) {
                        Ok(parsed) => break Ok(parsed),
                        Err(e) => {
                            warn!(target: TARGET_LLM_REQUEST, "Unparsable response for batch of {} entities (attempt {}): {}", chunk.len(), attempt + 1, e);
                            QuarantineReason::ParseFailure(e.to_string())
                        }
                    }
                }
                Err(EnrichError::Parse(detail)) => {
                    consecutive_rate_limits = 0;
                    warn!(target: TARGET_LLM_REQUEST, "Malformed envelope for batch of {} entities (attempt {}): {}", chunk.len(), attempt + 1, detail);
                    QuarantineReason::ParseFailure(detail)
                }
                Err(e) if e.is_retryable() => {
                    consecutive_rate_limits = 0;
                    warn!(target: TARGET_LLM_REQUEST, "Request failed for batch of {} entities (attempt {}): {}", chunk.len(), attempt + 1, e);
                    QuarantineReason::RetriesExhausted {
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    }
                }
                Err(e) => {
                    error!(target: TARGET_LLM_REQUEST, "Non-retryable failure for batch of {} entities: {}", chunk.len(), e);
                    break Err(QuarantineReason::Unexpected(e.to_string()));
                }
            };

            stats.failed_attempts += 1;
            if attempt >= self.settings.max_retries {
                break Err(failure);
            }

            let delay = jittered_backoff(
                self.settings.backoff_base,
                attempt,
                self.settings.backoff_jitter,
            );
            debug!(target: TARGET_LLM_REQUEST, "Backing off {:?} before retry {}/{}", delay, attempt + 1, self.settings.max_retries);
            stats.backoff_waits.push(delay);
            sleep(delay).await;
            attempt += 1;
        };

        let resolved = match outcome {
            Ok(parsed) => assign_results(chunk, parsed, &mut stats),
            Err(reason) => {
                for entity in chunk {
                    warn!(target: TARGET_LLM_REQUEST, "Quarantined '{}' ({} records): {}", entity.display_name, entity.record_ids.len(), reason);
                }
                chunk
                    .iter()
                    .map(|entity| (entity.key.clone(), Err(reason.clone())))
                    .collect()
            }
        };

        self.stats.absorb(stats);
        resolved
    }

    /// Client-side spacing between successive calls.
    async fn pace(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.settings.min_request_interval {
                sleep(self.settings.min_request_interval - elapsed).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

fn assign_results(
    chunk: &[&UniqueEntity],
    parsed: Vec<ParsedEntity>,
    stats: &mut BatchStats,
) -> HashMap<String, EntityResolution> {
    let mut by_key: HashMap<String, ParsedEntity> = HashMap::with_capacity(parsed.len());
    for entity in parsed {
        if let Some(key) = normalize_entity_key(&entity.institution) {
            by_key.entry(key).or_insert(entity);
        }
    }

    chunk
        .iter()
        .map(|entity| {
            let resolution = match by_key.remove(&entity.key) {
                Some(found) => {
                    if found.category_coerced {
                        stats.invalid_categories += 1;
                    }
                    Ok(to_result(found))
                }
                None => {
                    let missing = EnrichError::MissingEntity(entity.display_name.clone());
                    warn!(target: TARGET_LLM_REQUEST, "{} ({} records)", missing, entity.record_ids.len());
                    Err(QuarantineReason::MissingFromResponse)
                }
            };
            (entity.key.clone(), resolution)
        })
        .collect()
}

fn to_result(entity: ParsedEntity) -> ResolutionResult {
    let confidence = match entity.confidence {
        Some(value) => value,
        None if entity.category == Category::Unknown => 0.0,
        None => INFERENCE_CONFIDENCE,
    };
    ResolutionResult {
        country_name: entity.country,
        category: entity.category,
        confidence,
        method: Method::LlmInference,
        raw_response: Some(entity.raw),
    }
}

/// Removes an optional markdown code fence around the body.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match CODE_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

/// Parses a model reply into entity results.
///
/// Accepts a bare JSON array, one wrapped in a code fence, or an array surrounded by prose.
/// Elements without an institution name are skipped; a category outside the fixed set is
/// coerced to `Unknown`.
pub fn parse_inference_response(text: &str) -> Result<Vec<ParsedEntity>, EnrichError> {
    let body = strip_code_fence(text);
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(first_err) => {
            let start = body.find('[');
            let end = body.rfind(']');
            match (start, end) {
                (Some(start), Some(end)) if start < end => {
                    serde_json::from_str(&body[start..=end]).map_err(|e| {
                        EnrichError::Parse(format!("invalid JSON array: {}", e))
                    })?
                }
                _ => {
                    return Err(EnrichError::Parse(format!(
                        "invalid JSON: {}; body starts with: {}",
                        first_err,
                        body.chars().take(120).collect::<String>()
                    )))
                }
            }
        }
    };

    let elements = match value {
        Value::Array(elements) => elements,
        // Some models wrap the list in an object
        Value::Object(mut map) => match map
            .remove("results")
            .or_else(|| map.remove("institutions"))
        {
            Some(Value::Array(elements)) => elements,
            _ => return Err(EnrichError::Parse("expected a JSON array".to_string())),
        },
        _ => return Err(EnrichError::Parse("expected a JSON array".to_string())),
    };

    let mut parsed = Vec::with_capacity(elements.len());
    for element in elements {
        match parse_element(&element) {
            Some(entity) => parsed.push(entity),
            None => debug!(target: TARGET_LLM_REQUEST, "Skipping response element without institution: {}", element),
        }
    }
    Ok(parsed)
}

fn parse_element(element: &Value) -> Option<ParsedEntity> {
    let institution = element
        .get("institution")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();

    let country = element
        .get("country")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("unknown"))
        .map(str::to_string);

    let label = element.get("uschina").and_then(Value::as_str).unwrap_or("");
    let (category, category_coerced) = match Category::parse_label(label) {
        Ok(category) => (category, false),
        Err(e) => {
            info!(target: TARGET_LLM_REQUEST, "{} for '{}', using Unknown", e, institution);
            (Category::Unknown, true)
        }
    };

    let confidence = element
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c));

    Some(ParsedEntity {
        institution,
        country,
        category,
        confidence,
        category_coerced,
        raw: element.to_string(),
    })
}
