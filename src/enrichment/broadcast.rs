use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use super::country::translate_code;
use super::dedup::DedupMap;
use super::types::{
    CandidateSource, EnrichmentRow, EntityResolution, Method, QuarantineReason,
    ResolutionCandidate, ResolutionResult,
};
use crate::TARGET_ENRICH;

/// A record held back because its entity was quarantined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedRecord {
    pub record_id: String,
    pub entity_key: String,
    pub reason: QuarantineReason,
}

/// Rows ready for persistence plus the records that were held back.
#[derive(Debug, Default, Clone)]
pub struct Broadcast {
    pub rows: Vec<EnrichmentRow>,
    pub excluded: Vec<ExcludedRecord>,
    /// Name-based records whose entity has no entry in the resolved map yet.
    pub pending: Vec<String>,
}

/// Joins results back onto records.
///
/// Country-code candidates are translated directly and never consult `resolved`. Name-based
/// candidates take their entity's result; a quarantined entity excludes the record from the
/// output. `NoData` candidates become `Unknown` rows with zero confidence.
pub fn broadcast(
    candidates: &[ResolutionCandidate],
    dedup: &DedupMap,
    resolved: &HashMap<String, EntityResolution>,
    processed_at: DateTime<Utc>,
) -> Broadcast {
    let mut output = Broadcast::default();

    for candidate in candidates {
        let result = match &candidate.source {
            CandidateSource::DirectCountryCode { code } => {
                translate_code(code, Method::DirectCountryCode)
            }
            CandidateSource::InstitutionCountryCode { code, .. } => {
                translate_code(code, Method::InstitutionCountryCode)
            }
            CandidateSource::InstitutionNameOnly { .. } | CandidateSource::RawAffiliation { .. } => {
                let Some(key) = dedup.key_for_record(&candidate.record_id) else {
                    // Name normalized to nothing; there is no entity to ask about
                    output
                        .rows
                        .push(to_row(candidate, ResolutionResult::no_data(), processed_at));
                    continue;
                };
                match resolved.get(key) {
                    Some(Ok(result)) => result.clone(),
                    Some(Err(reason)) => {
                        debug!(target: TARGET_ENRICH, "Record {} excluded: entity '{}' quarantined ({})", candidate.record_id, key, reason);
                        output.excluded.push(ExcludedRecord {
                            record_id: candidate.record_id.clone(),
                            entity_key: key.to_string(),
                            reason: reason.clone(),
                        });
                        continue;
                    }
                    None => {
                        output.pending.push(candidate.record_id.clone());
                        continue;
                    }
                }
            }
            CandidateSource::NoData => ResolutionResult::no_data(),
        };
        output.rows.push(to_row(candidate, result, processed_at));
    }

    output
}

fn to_row(
    candidate: &ResolutionCandidate,
    result: ResolutionResult,
    processed_at: DateTime<Utc>,
) -> EnrichmentRow {
    EnrichmentRow {
        record_id: candidate.record_id.clone(),
        country_name: result.country_name,
        category: result.category,
        institution_name: candidate.source.institution_name().map(str::to_string),
        confidence: result.confidence,
        method: result.method,
        author_position: candidate.author_position.map(|p| p as i64),
        processed_at,
    }
}
