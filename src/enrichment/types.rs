use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

use crate::error::EnrichError;

/// Read-only snapshot of one paper's source metadata.
#[derive(Debug, Clone)]
pub struct TargetRecord {
    pub id: String,
    pub raw_metadata: Value,
}

impl TargetRecord {
    pub fn new(id: impl Into<String>, raw_metadata: Value) -> Self {
        Self {
            id: id.into(),
            raw_metadata,
        }
    }
}

/// Where a record's country signal came from, in descending priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    DirectCountryCode { code: String },
    InstitutionCountryCode { code: String, name: Option<String> },
    InstitutionNameOnly { name: String },
    RawAffiliation { text: String },
    NoData,
}

impl CandidateSource {
    /// Name-based candidates need the inference API; everything else is deterministic.
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            CandidateSource::InstitutionNameOnly { name } => Some(name),
            CandidateSource::RawAffiliation { text } => Some(text),
            _ => None,
        }
    }

    pub fn needs_inference(&self) -> bool {
        self.entity_name().is_some()
    }

    /// Institution label stored on the enrichment row.
    pub fn institution_name(&self) -> Option<&str> {
        match self {
            CandidateSource::InstitutionCountryCode { name, .. } => name.as_deref(),
            CandidateSource::InstitutionNameOnly { name } => Some(name),
            CandidateSource::RawAffiliation { text } => Some(text),
            CandidateSource::DirectCountryCode { .. } | CandidateSource::NoData => None,
        }
    }
}

/// The single candidate picked for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionCandidate {
    pub record_id: String,
    /// Zero-based authorship index that supplied the candidate.
    pub author_position: Option<usize>,
    pub source: CandidateSource,
}

impl ResolutionCandidate {
    pub fn no_data(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            author_position: None,
            source: CandidateSource::NoData,
        }
    }
}

/// Coarse classification derived from a resolved country.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    UnitedStates,
    China,
    RestOfWorld,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::UnitedStates => "United States",
            Category::China => "China",
            Category::RestOfWorld => "Rest of the World",
            Category::Unknown => "Unknown",
        }
    }

    /// Parses a category label, tolerating the spellings models tend to produce.
    pub fn parse_label(label: &str) -> Result<Self, EnrichError> {
        let cleaned = label
            .trim()
            .trim_matches(|c: char| c == '"' || c == '.')
            .to_lowercase();
        match cleaned.as_str() {
            "united states" | "united states of america" | "us" | "usa" | "u.s" | "u.s.a" => {
                Ok(Category::UnitedStates)
            }
            "china" | "prc" | "people's republic of china" | "mainland china" => {
                Ok(Category::China)
            }
            "rest of the world" | "rest of world" | "row" | "other" => Ok(Category::RestOfWorld),
            "unknown" | "" => Ok(Category::Unknown),
            _ => Err(EnrichError::Validation(label.to_string())),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Category::parse_label(s).unwrap_or(Category::Unknown)
    }
}

/// Provenance of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    DirectCountryCode,
    InstitutionCountryCode,
    LlmInference,
    NoData,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::DirectCountryCode => "direct_country_code",
            Method::InstitutionCountryCode => "institution_country_code",
            Method::LlmInference => "llm_inference",
            Method::NoData => "no_data",
        }
    }

    /// Higher ranks are never overwritten by lower ones.
    pub fn rank(&self) -> i64 {
        match self {
            Method::DirectCountryCode => 3,
            Method::InstitutionCountryCode => 2,
            Method::LlmInference => 1,
            Method::NoData => 0,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        match s {
            "direct_country_code" => Method::DirectCountryCode,
            "institution_country_code" => Method::InstitutionCountryCode,
            "llm_inference" => Method::LlmInference,
            _ => Method::NoData,
        }
    }
}

/// A concrete answer for a record or an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionResult {
    pub country_name: Option<String>,
    pub category: Category,
    pub confidence: f64,
    pub method: Method,
    pub raw_response: Option<String>,
}

impl ResolutionResult {
    pub fn no_data() -> Self {
        Self {
            country_name: None,
            category: Category::Unknown,
            confidence: 0.0,
            method: Method::NoData,
            raw_response: None,
        }
    }
}

/// Why an entity could not be resolved in this run. Quarantined entities are retried by
/// a later run; they are never written as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineReason {
    ParseFailure(String),
    RetriesExhausted { attempts: u32, last_error: String },
    RateLimitExhausted { waits: u32 },
    MissingFromResponse,
    Unexpected(String),
}

impl QuarantineReason {
    /// Short label stored in the quarantine log.
    pub fn kind(&self) -> &'static str {
        match self {
            QuarantineReason::ParseFailure(_) => "parse_failure",
            QuarantineReason::RetriesExhausted { .. } => "retries_exhausted",
            QuarantineReason::RateLimitExhausted { .. } => "rate_limit_exhausted",
            QuarantineReason::MissingFromResponse => "missing_from_response",
            QuarantineReason::Unexpected(_) => "unexpected_error",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::ParseFailure(detail) => write!(f, "parse failure: {}", detail),
            QuarantineReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "exhausted retries after {} attempts: {}",
                attempts, last_error
            ),
            QuarantineReason::RateLimitExhausted { waits } => {
                write!(f, "still rate limited after {} waits", waits)
            }
            QuarantineReason::MissingFromResponse => write!(f, "missing from response"),
            QuarantineReason::Unexpected(detail) => write!(f, "unexpected error: {}", detail),
        }
    }
}

/// Outcome for one unique entity.
pub type EntityResolution = Result<ResolutionResult, QuarantineReason>;

/// One row of the enrichment store.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentRow {
    pub record_id: String,
    pub country_name: Option<String>,
    pub category: Category,
    pub institution_name: Option<String>,
    pub confidence: f64,
    pub method: Method,
    pub author_position: Option<i64>,
    pub processed_at: DateTime<Utc>,
}
