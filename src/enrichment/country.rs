use lazy_static::lazy_static;
use std::collections::HashMap;

use super::types::{Category, Method, ResolutionResult};

const ISO_3166_TABLE: &str = include_str!("../../data/iso3166.tsv");

// Codes seen in source metadata that are not ISO 3166-1 alpha-2.
const CODE_ALIASES: &[(&str, &str)] = &[("UK", "GB"), ("EL", "GR")];

lazy_static! {
    static ref COUNTRY_NAMES: HashMap<&'static str, &'static str> = parse_table(ISO_3166_TABLE);
}

fn parse_table(table: &'static str) -> HashMap<&'static str, &'static str> {
    table
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('\t'))
        .map(|(code, name)| (code.trim(), name.trim()))
        .collect()
}

/// Canonical upper-case alpha-2 code, or `None` if `raw` is not shaped like one.
pub fn canonical_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let code = CODE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == code)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(code);
    Some(code)
}

pub fn country_name(code: &str) -> Option<&'static str> {
    let code = canonical_code(code)?;
    COUNTRY_NAMES.get(code.as_str()).copied()
}

pub fn category_for_code(code: &str) -> Category {
    match canonical_code(code).as_deref() {
        Some("US") => Category::UnitedStates,
        Some("CN") => Category::China,
        Some(other) if COUNTRY_NAMES.contains_key(other) => Category::RestOfWorld,
        _ => Category::Unknown,
    }
}

/// Deterministic translation of a source country code. Unrecognised codes keep the raw
/// code as the country name and fall into [`Category::Unknown`].
pub fn translate_code(code: &str, method: Method) -> ResolutionResult {
    let canonical = canonical_code(code).unwrap_or_else(|| code.trim().to_ascii_uppercase());
    let country_name = country_name(&canonical)
        .map(str::to_string)
        .unwrap_or_else(|| canonical.clone());
    ResolutionResult {
        country_name: Some(country_name),
        category: category_for_code(&canonical),
        confidence: 1.0,
        method,
        raw_response: None,
    }
}
