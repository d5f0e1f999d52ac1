use serde_json::Value;
use std::borrow::Cow;
use tracing::debug;

use super::country::canonical_code;
use super::types::{CandidateSource, ResolutionCandidate, TargetRecord};
use crate::TARGET_ENRICH;

/// Signals extracted from one authorship entry.
#[derive(Debug, Default)]
struct AuthorshipSignals {
    country_code: Option<String>,
    institution_code: Option<(String, Option<String>)>,
    institution_name: Option<String>,
    raw_affiliation: Option<String>,
}

/// Picks the single best country candidate for a record.
///
/// Priority is strict across the whole authorship list: any direct country code wins over
/// any institution code, which wins over any bare institution name, which wins over any
/// raw affiliation string. Within one level the earliest authorship wins, and the
/// reported position is the authorship that supplied the winning signal.
pub fn resolve_record(record: &TargetRecord) -> ResolutionCandidate {
    let metadata = unwrap_metadata(&record.raw_metadata);
    let signals: Vec<AuthorshipSignals> = authorships(&metadata)
        .iter()
        .map(extract_signals)
        .collect();

    let candidate = first_match(&signals, |s| {
        s.country_code
            .clone()
            .map(|code| CandidateSource::DirectCountryCode { code })
    })
    .or_else(|| {
        first_match(&signals, |s| {
            s.institution_code
                .clone()
                .map(|(code, name)| CandidateSource::InstitutionCountryCode { code, name })
        })
    })
    .or_else(|| {
        first_match(&signals, |s| {
            s.institution_name
                .clone()
                .map(|name| CandidateSource::InstitutionNameOnly { name })
        })
    })
    .or_else(|| {
        first_match(&signals, |s| {
            s.raw_affiliation
                .clone()
                .map(|text| CandidateSource::RawAffiliation { text })
        })
    });

    match candidate {
        Some((position, source)) => {
            debug!(target: TARGET_ENRICH, "Record {}: {:?} from authorship {}", record.id, source, position);
            ResolutionCandidate {
                record_id: record.id.clone(),
                author_position: Some(position),
                source,
            }
        }
        None => {
            debug!(target: TARGET_ENRICH, "Record {}: no country signal in {} authorships", record.id, signals.len());
            ResolutionCandidate::no_data(record.id.clone())
        }
    }
}

fn first_match<F>(signals: &[AuthorshipSignals], pick: F) -> Option<(usize, CandidateSource)>
where
    F: Fn(&AuthorshipSignals) -> Option<CandidateSource>,
{
    signals
        .iter()
        .enumerate()
        .find_map(|(position, s)| pick(s).map(|source| (position, source)))
}

// Some loaders store the metadata document as a JSON string rather than an object.
fn unwrap_metadata(raw: &Value) -> Cow<'_, Value> {
    match raw {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed) => Cow::Owned(parsed),
            Err(_) => Cow::Borrowed(raw),
        },
        _ => Cow::Borrowed(raw),
    }
}

fn authorships(metadata: &Value) -> &[Value] {
    let list = metadata
        .get("authorships")
        .or_else(|| metadata.get("openalex").and_then(|o| o.get("authorships")));
    match list {
        Some(Value::Array(entries)) => entries.as_slice(),
        _ => &[],
    }
}

fn extract_signals(authorship: &Value) -> AuthorshipSignals {
    let mut signals = AuthorshipSignals {
        country_code: string_list(authorship.get("countries"))
            .iter()
            .find_map(|code| canonical_code(code)),
        ..AuthorshipSignals::default()
    };

    let institutions = match authorship.get("institutions") {
        Some(Value::Array(list)) => list.as_slice(),
        _ => &[],
    };

    if let Some(first) = institutions.first() {
        let code = first
            .get("country_code")
            .and_then(Value::as_str)
            .and_then(canonical_code);
        if let Some(code) = code {
            signals.institution_code = Some((code, non_empty_str(first.get("display_name"))));
        }
    }

    signals.institution_name = institutions.iter().find_map(|institution| {
        let has_code = institution
            .get("country_code")
            .and_then(Value::as_str)
            .and_then(canonical_code)
            .is_some();
        if has_code {
            None
        } else {
            non_empty_str(institution.get("display_name"))
        }
    });

    signals.raw_affiliation = string_list(authorship.get("raw_affiliation_strings"))
        .into_iter()
        .chain(non_empty_str(authorship.get("raw_affiliation_string")))
        .next();

    signals
}

/// Accepts either a list of strings or a single string.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| non_empty_str(Some(item)))
            .collect(),
        Some(single @ Value::String(_)) => non_empty_str(Some(single)).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
