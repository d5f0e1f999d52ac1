use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{info, warn};

use super::batch::{BatchResolver, BatchStats};
use super::broadcast::broadcast;
use super::dedup::{dedupe, DedupMap, UniqueEntity};
use super::resolver::resolve_record;
use super::types::{Category, EntityResolution, Method, ResolutionCandidate, TargetRecord};
use crate::db::{Database, QuarantineEntry, SnapshotScope};
use crate::environment::ResolverSettings;
use crate::error::EnrichError;
use crate::llm::InferenceBackend;
use crate::TARGET_ENRICH;

/// What one run did. Entity counts always add up:
/// `entities_resolved + entities_unknown + entities_quarantined + entities_skipped == unique_entities`.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub records: usize,
    pub deterministic_records: usize,
    pub no_data_records: usize,
    pub unique_entities: usize,
    /// Entities the model placed in a known category.
    pub entities_resolved: usize,
    /// Entities the model answered as `Unknown`.
    pub entities_unknown: usize,
    pub entities_quarantined: usize,
    /// Entities left unresolved because the run was cancelled.
    pub entities_skipped: usize,
    /// Records held back because their entity was quarantined.
    pub excluded_records: usize,
    /// Ids of those held-back records.
    pub quarantined_records: Vec<String>,
    pub rows_written: u64,
    pub cancelled: bool,
    pub stats: BatchStats,
}

impl RunReport {
    pub fn entities_accounted(&self) -> usize {
        self.entities_resolved
            + self.entities_unknown
            + self.entities_quarantined
            + self.entities_skipped
    }
}

/// Runs records through resolve, dedupe, batch resolution, broadcast and persistence.
///
/// Deterministic rows are written before any inference call; each entity batch is persisted
/// as soon as it resolves, so cancelling between batches never loses finished work.
pub struct EnrichmentEngine<'a> {
    db: &'a Database,
    backend: &'a dyn InferenceBackend,
    settings: &'a ResolverSettings,
}

impl<'a> EnrichmentEngine<'a> {
    pub fn new(
        db: &'a Database,
        backend: &'a dyn InferenceBackend,
        settings: &'a ResolverSettings,
    ) -> Self {
        Self {
            db,
            backend,
            settings,
        }
    }

    /// One-shot run over a frozen snapshot.
    pub async fn run_snapshot(
        &self,
        scope: SnapshotScope,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<RunReport, EnrichError> {
        let records = self.db.extract_snapshot(scope).await?;
        info!(target: TARGET_ENRICH, "Starting {} run over {} papers using {}", scope, records.len(), self.backend.describe());
        self.enrich_records(&records, cancel).await
    }

    pub async fn enrich_records(
        &self,
        records: &[TargetRecord],
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<RunReport, EnrichError> {
        let candidates: Vec<ResolutionCandidate> = records.iter().map(resolve_record).collect();
        let dedup = dedupe(&candidates);

        let mut report = RunReport {
            records: records.len(),
            unique_entities: dedup.len(),
            ..RunReport::default()
        };

        // Records that never reach the inference API
        let (named, deterministic): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| dedup.key_for_record(&c.record_id).is_some());
        let output = broadcast(&deterministic, &dedup, &HashMap::new(), Utc::now());
        report.no_data_records = output
            .rows
            .iter()
            .filter(|row| row.method == Method::NoData)
            .count();
        report.deterministic_records = output.rows.len() - report.no_data_records;
        report.rows_written += self.db.upsert_enrichment_rows(&output.rows).await?;
        let by_record: HashMap<&str, &ResolutionCandidate> =
            named.iter().map(|c| (c.record_id.as_str(), c)).collect();

        info!(target: TARGET_ENRICH, "{} records: {} deterministic, {} without data, {} unique entities to resolve", report.records, report.deterministic_records, report.no_data_records, report.unique_entities);

        let entities: Vec<&UniqueEntity> = dedup.entities().collect();
        let mut resolver = BatchResolver::new(self.backend, self.settings);
        let batch_size = resolver.batch_size();

        for (index, chunk) in entities.chunks(batch_size).enumerate() {
            if cancel.map_or(false, |rx| *rx.borrow()) {
                let remaining = entities.len() - index * batch_size;
                warn!(target: TARGET_ENRICH, "Run cancelled; {} entities left unresolved", remaining);
                report.entities_skipped = remaining;
                report.cancelled = true;
                break;
            }

            let resolved = resolver.resolve_chunk(chunk).await;
            self.persist_chunk(chunk, &by_record, &dedup, &resolved, &mut report)
                .await?;
        }

        report.stats = resolver.take_stats();
        info!(target: TARGET_ENRICH, "Run finished: {} rows written, {} entities resolved, {} unknown, {} quarantined ({} records held back), {} API calls, {} rate-limit waits", report.rows_written, report.entities_resolved, report.entities_unknown, report.entities_quarantined, report.excluded_records, report.stats.api_calls, report.stats.rate_limit_waits.len());
        Ok(report)
    }

    async fn persist_chunk(
        &self,
        chunk: &[&UniqueEntity],
        by_record: &HashMap<&str, &ResolutionCandidate>,
        dedup: &DedupMap,
        resolved: &HashMap<String, EntityResolution>,
        report: &mut RunReport,
    ) -> Result<(), EnrichError> {
        let chunk_candidates: Vec<ResolutionCandidate> = chunk
            .iter()
            .flat_map(|entity| entity.record_ids.iter())
            .filter_map(|record_id| by_record.get(record_id.as_str()))
            .map(|candidate| (*candidate).clone())
            .collect();

        let output = broadcast(&chunk_candidates, dedup, resolved, Utc::now());
        report.rows_written += self.db.upsert_enrichment_rows(&output.rows).await?;
        report.excluded_records += output.excluded.len();
        report
            .quarantined_records
            .extend(output.excluded.into_iter().map(|excluded| excluded.record_id));

        let mut quarantined = Vec::new();
        let mut cleared = Vec::new();
        for entity in chunk {
            match resolved.get(&entity.key) {
                Some(Ok(result)) => {
                    if result.category == Category::Unknown {
                        report.entities_unknown += 1;
                    } else {
                        report.entities_resolved += 1;
                    }
                    cleared.push(entity.key.clone());
                }
                Some(Err(reason)) => {
                    report.entities_quarantined += 1;
                    quarantined.push(QuarantineEntry {
                        entity_key: entity.key.clone(),
                        entity_name: entity.display_name.clone(),
                        reason: reason.clone(),
                        record_count: entity.record_ids.len(),
                    });
                }
                None => {
                    // The resolver answers for every entity it is given
                    report.entities_skipped += 1;
                }
            }
        }

        self.db.record_quarantine(&quarantined).await?;
        self.db.clear_quarantine(&cleared).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::test_support::{
        country_record, empty_record, institution_record, ScriptedBackend,
    };
    use serde_json::json;
    use std::time::Duration;

    fn settings(batch_size: usize) -> ResolverSettings {
        ResolverSettings {
            batch_size,
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
            backoff_jitter: 0.25,
            min_request_interval: Duration::ZERO,
            default_retry_after: Duration::from_millis(10),
            max_rate_limit_waits: 5,
        }
    }

    async fn store(db: &Database, records: &[TargetRecord]) {
        for record in records {
            db.add_paper(&record.id, &record.raw_metadata).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_mit_and_unknown_university_scenario() {
        let db = Database::in_memory().await.unwrap();
        let records = vec![
            institution_record("W1", "MIT"),
            institution_record("W2", "MIT"),
            institution_record("W3", "Unknown University"),
        ];
        store(&db, &records).await;
        let backend = ScriptedBackend::new().reply_text(
            r#"[{"institution": "MIT", "country": "United States", "uschina": "United States"}]"#,
        );
        let settings = settings(2);
        let engine = EnrichmentEngine::new(&db, &backend, &settings);

        let report = engine.enrich_records(&records, None).await.unwrap();

        assert_eq!(backend.call_count(), 1);
        assert_eq!(
            backend.requests()[0].institutions,
            vec!["MIT".to_string(), "Unknown University".to_string()]
        );

        let rows = db.fetch_all_enrichment().await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.category, Category::UnitedStates);
            assert_eq!(row.confidence, 0.95);
            assert_eq!(row.institution_name.as_deref(), Some("MIT"));
        }
        assert!(db.fetch_enrichment("W3").await.unwrap().is_none());

        let quarantine = db.list_quarantine(10).await.unwrap();
        assert_eq!(quarantine.len(), 1);
        assert_eq!(quarantine[0].entity_name, "Unknown University");
        assert_eq!(quarantine[0].reason_kind, "missing_from_response");

        assert_eq!(report.unique_entities, 2);
        assert_eq!(report.entities_resolved, 1);
        assert_eq!(report.entities_quarantined, 1);
        assert_eq!(report.excluded_records, 1);
        assert_eq!(report.entities_accounted(), report.unique_entities);
    }

    #[tokio::test]
    async fn test_dedup_cardinality_and_short_circuit() {
        let db = Database::in_memory().await.unwrap();
        let mut records: Vec<_> = (0..40)
            .map(|i| institution_record(&format!("W{:02}", i), if i % 2 == 0 { "Peking University" } else { "peking university " }))
            .collect();
        records.push(institution_record("W90", "ETH Zurich"));
        records.push(country_record("W91", "US"));
        records.push(TargetRecord::new(
            "W92",
            json!({"authorships": [{"institutions": [{"display_name": "Tsinghua University", "country_code": "CN"}]}]}),
        ));
        records.push(empty_record("W93"));
        store(&db, &records).await;

        let backend = ScriptedBackend::new().echo_country("China", "China");
        let settings = settings(1);
        let engine = EnrichmentEngine::new(&db, &backend, &settings);

        let report = engine.enrich_records(&records, None).await.unwrap();

        // One call per unique name, none for code-bearing records
        assert_eq!(report.unique_entities, 2);
        assert_eq!(backend.call_count(), 2);
        let asked: Vec<String> = backend
            .requests()
            .into_iter()
            .flat_map(|r| r.institutions)
            .collect();
        assert!(!asked.iter().any(|name| name.contains("Tsinghua")));

        assert_eq!(report.deterministic_records, 2);
        assert_eq!(report.no_data_records, 1);
        assert_eq!(report.rows_written, 44);

        let w91 = db.fetch_enrichment("W91").await.unwrap().unwrap();
        assert_eq!(w91.method, Method::DirectCountryCode);
        assert_eq!(w91.category, Category::UnitedStates);
        let w92 = db.fetch_enrichment("W92").await.unwrap().unwrap();
        assert_eq!(w92.method, Method::InstitutionCountryCode);
        assert_eq!(w92.category, Category::China);
        let w93 = db.fetch_enrichment("W93").await.unwrap().unwrap();
        assert_eq!(w93.method, Method::NoData);
        assert_eq!(w93.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let records = vec![
            institution_record("W1", "University of Tokyo"),
            institution_record("W2", "University of Tokyo"),
            country_record("W3", "fr"),
        ];
        store(&db, &records).await;
        let backend = ScriptedBackend::new().echo_country("Japan", "Rest of the World");
        let settings = settings(10);
        let engine = EnrichmentEngine::new(&db, &backend, &settings);

        engine
            .run_snapshot(SnapshotScope::FullRebuild, None)
            .await
            .unwrap();
        let first = db.fetch_all_enrichment().await.unwrap();
        engine
            .run_snapshot(SnapshotScope::FullRebuild, None)
            .await
            .unwrap();
        let second = db.fetch_all_enrichment().await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.record_id, b.record_id);
            assert_eq!(a.country_name, b.country_name);
            assert_eq!(a.category, b.category);
            assert_eq!(a.confidence, b.confidence);
            assert_eq!(a.method, b.method);
        }

        // Nothing left for an incremental run
        let report = engine
            .run_snapshot(SnapshotScope::Incremental, None)
            .await
            .unwrap();
        assert_eq!(report.records, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_run_quarantines_nothing() {
        let db = Database::in_memory().await.unwrap();
        let records = vec![institution_record("W1", "Seoul National University")];
        store(&db, &records).await;
        let backend = ScriptedBackend::new()
            .rate_limited(Some(Duration::from_millis(20)))
            .rate_limited(Some(Duration::from_millis(10)))
            .reply_text(r#"[{"institution": "Seoul National University", "country": "South Korea", "uschina": "Rest of the World"}]"#);
        let settings = settings(10);
        let engine = EnrichmentEngine::new(&db, &backend, &settings);

        let report = engine.enrich_records(&records, None).await.unwrap();

        assert_eq!(
            report.stats.rate_limit_waits,
            vec![Duration::from_millis(20), Duration::from_millis(10)]
        );
        assert_eq!(report.entities_quarantined, 0);
        assert_eq!(report.entities_resolved, 1);
        let row = db.fetch_enrichment("W1").await.unwrap().unwrap();
        assert_eq!(row.country_name.as_deref(), Some("South Korea"));
        assert_eq!(row.category, Category::RestOfWorld);
    }

    #[tokio::test]
    async fn test_failed_batch_is_isolated_and_cleared_on_success() {
        let db = Database::in_memory().await.unwrap();
        let records = vec![
            institution_record("W1", "Alpha Institute"),
            institution_record("W2", "Beta Institute"),
        ];
        store(&db, &records).await;
        let backend = ScriptedBackend::new()
            .fail(EnrichError::Transport("reset".into()))
            .fail(EnrichError::Transport("reset".into()))
            .reply_text(r#"[{"institution": "Beta Institute", "country": "Unknown", "uschina": "Unknown"}]"#);
        let settings = settings(1);
        let engine = EnrichmentEngine::new(&db, &backend, &settings);

        let report = engine.enrich_records(&records, None).await.unwrap();

        assert_eq!(report.entities_quarantined, 1);
        assert_eq!(report.entities_unknown, 1);
        assert_eq!(report.entities_accounted(), 2);
        assert!(db.fetch_enrichment("W1").await.unwrap().is_none());
        let beta = db.fetch_enrichment("W2").await.unwrap().unwrap();
        assert_eq!(beta.category, Category::Unknown);
        assert_eq!(beta.confidence, 0.0);

        let quarantine = db.list_quarantine(10).await.unwrap();
        assert_eq!(quarantine[0].entity_key, "alpha institute");
        assert_eq!(quarantine[0].reason_kind, "retries_exhausted");

        // A later incremental run picks the quarantined record up again
        let backend = ScriptedBackend::new().echo_country("Germany", "Rest of the World");
        let engine = EnrichmentEngine::new(&db, &backend, &settings);
        let report = engine
            .run_snapshot(SnapshotScope::Incremental, None)
            .await
            .unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.entities_resolved, 1);
        assert!(db.list_quarantine(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_deterministic_rows() {
        let db = Database::in_memory().await.unwrap();
        let records = vec![
            country_record("W1", "CN"),
            institution_record("W2", "Gamma Institute"),
        ];
        store(&db, &records).await;
        let backend = ScriptedBackend::new().echo_country("India", "Rest of the World");
        let settings = settings(10);
        let engine = EnrichmentEngine::new(&db, &backend, &settings);

        let (tx, rx) = watch::channel(true);
        let report = engine.enrich_records(&records, Some(&rx)).await.unwrap();
        drop(tx);

        assert!(report.cancelled);
        assert_eq!(report.entities_skipped, 1);
        assert_eq!(report.entities_accounted(), report.unique_entities);
        assert_eq!(backend.call_count(), 0);
        assert!(db.fetch_enrichment("W1").await.unwrap().is_some());
        assert!(db.fetch_enrichment("W2").await.unwrap().is_none());
        assert!(db.list_quarantine(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_each_record_written_once_across_chunks() {
        let db = Database::in_memory().await.unwrap();
        let institutions = ["Inst A", "Inst B", "Inst C", "Inst D", "Inst E", "Inst F", "Inst G"];
        let records: Vec<_> = (0..35)
            .map(|i| institution_record(&format!("W{:02}", i), institutions[i % institutions.len()]))
            .collect();
        store(&db, &records).await;
        let backend = ScriptedBackend::new().echo_country("Brazil", "Rest of the World");
        let settings = settings(2);
        let engine = EnrichmentEngine::new(&db, &backend, &settings);

        let report = engine.enrich_records(&records, None).await.unwrap();

        // Seven entities in chunks of two
        assert_eq!(backend.call_count(), 4);
        assert_eq!(report.unique_entities, 7);
        assert_eq!(report.entities_resolved, 7);
        assert_eq!(report.rows_written, 35);

        let rows = db.fetch_all_enrichment().await.unwrap();
        assert_eq!(rows.len(), 35);
        for (i, record) in records.iter().enumerate() {
            let row = rows.iter().find(|r| r.record_id == record.id).unwrap();
            assert_eq!(
                row.institution_name.as_deref(),
                Some(institutions[i % institutions.len()])
            );
        }
    }
}
