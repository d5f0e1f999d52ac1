use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::normalizer::{display_name, normalize_entity_key};
use super::types::ResolutionCandidate;

/// One institution name that needs external resolution, with every record that uses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueEntity {
    pub key: String,
    /// First spelling seen, used in the inference request.
    pub display_name: String,
    pub record_ids: BTreeSet<String>,
}

/// Dedup map keyed by normalized entity key. Ordered so batches are stable across runs.
#[derive(Debug, Default, Clone)]
pub struct DedupMap {
    entities: BTreeMap<String, UniqueEntity>,
    record_keys: HashMap<String, String>,
}

impl DedupMap {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&UniqueEntity> {
        self.entities.get(key)
    }

    /// Entity key a record was folded into, if any.
    pub fn key_for_record(&self, record_id: &str) -> Option<&str> {
        self.record_keys.get(record_id).map(String::as_str)
    }

    pub fn entities(&self) -> impl Iterator<Item = &UniqueEntity> {
        self.entities.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Number of records that reference some entity.
    pub fn record_count(&self) -> usize {
        self.record_keys.len()
    }
}

/// Single pass over the candidates. Only name-based candidates contribute keys.
pub fn dedupe(candidates: &[ResolutionCandidate]) -> DedupMap {
    let mut map = DedupMap::default();

    for candidate in candidates {
        let Some(name) = candidate.source.entity_name() else {
            continue;
        };
        let Some(key) = normalize_entity_key(name) else {
            continue;
        };

        map.entities
            .entry(key.clone())
            .or_insert_with(|| UniqueEntity {
                key: key.clone(),
                display_name: display_name(name),
                record_ids: BTreeSet::new(),
            })
            .record_ids
            .insert(candidate.record_id.clone());
        map.record_keys.insert(candidate.record_id.clone(), key);
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::types::CandidateSource;

    fn candidate(record_id: &str, source: CandidateSource) -> ResolutionCandidate {
        ResolutionCandidate {
            record_id: record_id.to_string(),
            author_position: Some(0),
            source,
        }
    }

    fn name_only(record_id: &str, name: &str) -> ResolutionCandidate {
        candidate(
            record_id,
            CandidateSource::InstitutionNameOnly {
                name: name.to_string(),
            },
        )
    }

    #[test]
    fn test_shared_institution_yields_one_key() {
        let candidates: Vec<_> = (0..1000)
            .map(|i| name_only(&format!("W{}", i), "Massachusetts Institute of Technology"))
            .collect();
        let map = dedupe(&candidates);

        assert_eq!(map.len(), 1);
        let entity = map.get("massachusetts institute of technology").unwrap();
        assert_eq!(entity.record_ids.len(), 1000);
        assert_eq!(map.record_count(), 1000);
    }

    #[test]
    fn test_spelling_variants_fold_together() {
        let map = dedupe(&[
            name_only("W1", "MIT"),
            name_only("W2", "  mit "),
            candidate(
                "W3",
                CandidateSource::RawAffiliation {
                    text: "Unknown University".to_string(),
                },
            ),
        ]);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("mit").unwrap().display_name, "MIT");
        assert_eq!(map.key_for_record("W2"), Some("mit"));
        assert_eq!(map.key_for_record("W3"), Some("unknown university"));
    }

    #[test]
    fn test_deterministic_candidates_never_enter_the_map() {
        let map = dedupe(&[
            candidate(
                "W1",
                CandidateSource::DirectCountryCode {
                    code: "US".to_string(),
                },
            ),
            candidate(
                "W2",
                CandidateSource::InstitutionCountryCode {
                    code: "CN".to_string(),
                    name: Some("Tsinghua University".to_string()),
                },
            ),
            ResolutionCandidate::no_data("W3"),
        ]);

        assert!(map.is_empty());
        assert_eq!(map.key_for_record("W1"), None);
        assert_eq!(map.key_for_record("W2"), None);
    }

    #[test]
    fn test_keys_are_ordered() {
        let map = dedupe(&[
            name_only("W1", "Zhejiang University"),
            name_only("W2", "Aalto University"),
        ]);
        let keys: Vec<_> = map.keys().collect();
        assert_eq!(keys, vec!["aalto university", "zhejiang university"]);
    }
}
