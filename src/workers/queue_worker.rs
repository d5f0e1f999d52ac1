use anyhow::{Context, Result};
use std::collections::HashSet;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::db::{Database, DbLockErrorExt};
use crate::enrichment::{EnrichmentEngine, RunReport};
use crate::environment::{EnrichmentConfig, QueueSettings};
use crate::error::EnrichError;
use crate::llm::InferenceBackend;
use crate::util::jittered_sleep;
use crate::{WorkerDetail, TARGET_ENRICH};

/// Claims one batch from the queue and enriches it.
///
/// Returns `None` when the queue is empty. Finished claims are released; a batch interrupted
/// by cancellation goes back on the queue. Records whose entity was quarantined are deferred
/// back onto the queue at a lower priority and retried after `quarantine_retry_delay`.
pub async fn process_next_batch(
    worker_detail: &WorkerDetail,
    db: &Database,
    engine: &EnrichmentEngine<'_>,
    settings: &QueueSettings,
    cancel: &watch::Receiver<bool>,
) -> Result<Option<RunReport>, EnrichError> {
    let claim = db
        .claim_enrichment_batch(&worker_detail.claim_tag(), settings.claim_size)
        .await?;
    if claim.is_empty() {
        return Ok(None);
    }

    debug!(target: TARGET_ENRICH, "[{} {}]: processing {} claimed records", worker_detail.name, worker_detail.id, claim.record_ids.len());

    match engine.enrich_records(&claim.records, Some(cancel)).await {
        Ok(report) => {
            let held_back: HashSet<&str> =
                report.quarantined_records.iter().map(String::as_str).collect();
            if !held_back.is_empty() {
                db.defer_claims(&report.quarantined_records, settings.quarantine_retry_delay)
                    .await?;
            }
            let rest: Vec<String> = claim
                .record_ids
                .iter()
                .filter(|id| !held_back.contains(id.as_str()))
                .cloned()
                .collect();
            if report.cancelled {
                db.return_claims_to_queue(&rest).await?;
            } else {
                db.release_claims(&rest).await?;
            }
            Ok(Some(report))
        }
        Err(e) => {
            // Hand the batch back now rather than waiting for the lease to expire
            if let Err(requeue_err) = db.return_claims_to_queue(&claim.record_ids).await {
                error!(target: TARGET_ENRICH, "[{} {}]: failed to return {} claims to the queue: {}", worker_detail.name, worker_detail.id, claim.record_ids.len(), requeue_err);
            }
            Err(e)
        }
    }
}

/// Continuous-mode worker: claim, enrich, release, and sleep a jittered interval when the
/// queue is empty. Runs until `shutdown` flips to true.
pub async fn queue_worker_loop(
    worker_id: i16,
    db: &Database,
    backend: &dyn InferenceBackend,
    config: &EnrichmentConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let worker_detail = WorkerDetail {
        name: "queue worker".to_string(),
        id: worker_id,
        model: config.inference.model.clone(),
        connection_info: backend.describe(),
    };
    let engine = EnrichmentEngine::new(db, backend, &config.resolver);

    info!(target: TARGET_ENRICH, "[{} {} {}]: starting queue_worker_loop using {}.", worker_detail.name, worker_detail.id, worker_detail.model, worker_detail.connection_info);

    db.requeue_expired_claims(config.queue.lease_timeout)
        .await
        .context("Failed to requeue expired claims at start-up")?;

    let mut batches: usize = 0;
    let mut rows_written: u64 = 0;

    while !*shutdown.borrow() {
        match process_next_batch(&worker_detail, db, &engine, &config.queue, &shutdown).await {
            Ok(Some(report)) => {
                batches += 1;
                rows_written += report.rows_written;
                info!(target: TARGET_ENRICH, "[{} {}]: batch {} done: {} records, {} rows written, {} entities quarantined.", worker_detail.name, worker_detail.id, batches, report.records, report.rows_written, report.entities_quarantined);
            }
            Ok(None) => {
                if let Err(e) = db.requeue_expired_claims(config.queue.lease_timeout).await {
                    warn!(target: TARGET_ENRICH, "[{} {}]: failed to requeue expired claims: {}", worker_detail.name, worker_detail.id, e);
                }
                debug!(target: TARGET_ENRICH, "[{} {}]: queue empty.", worker_detail.name, worker_detail.id);
                tokio::select! {
                    _ = jittered_sleep(config.queue.idle_min, config.queue.idle_max) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(EnrichError::Database(e)) if e.is_database_lock_error() => {
                warn!(target: TARGET_ENRICH, "[{} {}]: database busy, retrying: {}", worker_detail.name, worker_detail.id, e);
                sleep(Duration::from_secs(1)).await;
            }
            Err(e) if e.is_fatal() => {
                error!(target: TARGET_ENRICH, "[{} {}]: stopping after fatal error: {}", worker_detail.name, worker_detail.id, e);
                return Err(e).context(format!("queue worker {} failed", worker_id));
            }
            Err(e) => {
                error!(target: TARGET_ENRICH, "[{} {}]: batch failed: {}", worker_detail.name, worker_detail.id, e);
                sleep(Duration::from_secs(5)).await;
            }
        }
    }

    info!(target: TARGET_ENRICH, "[{} {}]: shutting down after {} batches ({} rows written).", worker_detail.name, worker_detail.id, batches, rows_written);
    Ok(())
}
