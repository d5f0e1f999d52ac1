use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prettytable::{Cell, Row as PrettyRow, Table};
use serde_json::Value;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use paper_enrich::db::{Database, SnapshotScope};
use paper_enrich::enrichment::{EnrichmentEngine, RunReport};
use paper_enrich::environment::EnrichmentConfig;
use paper_enrich::llm::{HttpInferenceClient, InferenceBackend};
use paper_enrich::logging::configure_logging;
use paper_enrich::workers::queue_worker_loop;
use paper_enrich::TARGET_ENRICH;

#[derive(Parser)]
#[command(author, version, about = "Country enrichment for academic papers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show enrichment progress
    Status {
        /// Also list the largest quarantined entities
        #[arg(short, long, default_value = "0")]
        quarantine: i64,
    },

    /// Enrich papers that have no enrichment row yet
    Incremental,

    /// Re-enrich every paper
    FullRebuild,

    /// Run continuous queue workers until Ctrl-C
    Worker {
        /// Number of workers (defaults to QUEUE_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Seed the work queue
    Enqueue {
        /// Queue every paper, not just un-enriched ones
        #[arg(short, long)]
        all: bool,

        #[arg(short, long, default_value = "0")]
        priority: i64,
    },

    /// Return claims held longer than the lease timeout to the queue
    RequeueExpired,

    /// Load papers from a JSON Lines file, one object with an "id" field per line
    Ingest {
        #[arg(required = true)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();

    let cli = Cli::parse();
    let config = EnrichmentConfig::from_env().context("Invalid configuration")?;

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to connect to database")?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!(target: TARGET_ENRICH, "Ctrl-C received, stopping after the current batch");
                let _ = cancel_tx.send(true);
            }
            Err(e) => error!(target: TARGET_ENRICH, "Failed to listen for ctrl-c: {}", e),
        }
        // Keep the sender alive so receivers never see a closed channel
        std::future::pending::<()>().await;
    });

    match cli.command {
        Commands::Status { quarantine } => print_status(&db, quarantine).await?,

        Commands::Incremental => {
            run_snapshot(&db, &config, SnapshotScope::Incremental, &cancel_rx).await?
        }

        Commands::FullRebuild => {
            run_snapshot(&db, &config, SnapshotScope::FullRebuild, &cancel_rx).await?
        }

        Commands::Worker { workers } => {
            let workers = workers.unwrap_or(config.queue.workers).max(1);
            let backend: Arc<dyn InferenceBackend> = Arc::new(
                HttpInferenceClient::new(&config.inference, config.require_api_key()?)
                    .context("Failed to create inference client")?,
            );
            let config = Arc::new(config);

            info!(target: TARGET_ENRICH, "Starting {} queue workers", workers);
            let mut handles = Vec::with_capacity(workers);
            for worker_id in 0..workers {
                let db = db.clone();
                let backend = Arc::clone(&backend);
                let config = Arc::clone(&config);
                let shutdown = cancel_rx.clone();
                handles.push(tokio::spawn(async move {
                    queue_worker_loop(worker_id as i16, &db, backend.as_ref(), &config, shutdown)
                        .await
                }));
            }

            for handle in handles {
                handle.await.context("Queue worker task panicked")??;
            }
        }

        Commands::Enqueue { all, priority } => {
            let added = db
                .enqueue_unenriched(priority, all)
                .await
                .context("Failed to seed the enrichment queue")?;
            println!("Queued {} papers (priority {})", added, priority);
        }

        Commands::RequeueExpired => {
            let requeued = db
                .requeue_expired_claims(config.queue.lease_timeout)
                .await
                .context("Failed to requeue expired claims")?;
            println!(
                "Returned {} expired claims to the queue (lease {:?})",
                requeued, config.queue.lease_timeout
            );
        }

        Commands::Ingest { path } => {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            let (mut added, mut updated, mut skipped) = (0, 0, 0);
            for (line_number, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let metadata: Value = match serde_json::from_str(line) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(target: TARGET_ENRICH, "{}:{}: skipping invalid JSON: {}", path, line_number + 1, e);
                        skipped += 1;
                        continue;
                    }
                };
                let Some(id) = metadata.get("id").and_then(Value::as_str).map(str::to_string)
                else {
                    warn!(target: TARGET_ENRICH, "{}:{}: skipping record without an id", path, line_number + 1);
                    skipped += 1;
                    continue;
                };
                if db.add_paper(&id, &metadata).await? {
                    added += 1;
                } else {
                    updated += 1;
                }
            }
            println!(
                "Ingested {}: {} new, {} updated, {} skipped",
                path, added, updated, skipped
            );
        }
    }

    Ok(())
}

async fn run_snapshot(
    db: &Database,
    config: &EnrichmentConfig,
    scope: SnapshotScope,
    cancel_rx: &watch::Receiver<bool>,
) -> Result<()> {
    let backend = HttpInferenceClient::new(&config.inference, config.require_api_key()?)
        .context("Failed to create inference client")?;
    let engine = EnrichmentEngine::new(db, &backend, &config.resolver);

    let report = engine
        .run_snapshot(scope, Some(cancel_rx))
        .await
        .with_context(|| format!("{} run failed", scope))?;

    print_report(scope, &report);
    Ok(())
}

fn print_report(scope: SnapshotScope, report: &RunReport) {
    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new(&format!("{} run", scope)),
        Cell::new("Count"),
    ]));
    for (label, value) in [
        ("Papers in snapshot", report.records as u64),
        ("Rows written", report.rows_written),
        ("Resolved from country codes", report.deterministic_records as u64),
        ("No country data", report.no_data_records as u64),
        ("Unique institutions", report.unique_entities as u64),
        ("Institutions resolved", report.entities_resolved as u64),
        ("Institutions unknown", report.entities_unknown as u64),
        ("Institutions quarantined", report.entities_quarantined as u64),
        ("Papers held back", report.excluded_records as u64),
        ("Institutions skipped", report.entities_skipped as u64),
        ("API calls", report.stats.api_calls as u64),
        ("Rate-limit waits", report.stats.rate_limit_waits.len() as u64),
        ("Invalid categories", report.stats.invalid_categories as u64),
    ] {
        table.add_row(PrettyRow::new(vec![
            Cell::new(label),
            Cell::new(&value.to_string()),
        ]));
    }
    table.printstd();

    if report.cancelled {
        println!("Run was cancelled; re-run to finish the remaining papers.");
    }
}

async fn print_status(db: &Database, quarantine_limit: i64) -> Result<()> {
    let status = db
        .enrichment_status()
        .await
        .context("Failed to read enrichment status")?;

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![Cell::new("Metric"), Cell::new("Value")]));
    let summary = [
        ("Total papers", status.total.to_string()),
        ("Enriched", status.enriched.to_string()),
        ("Completion", format!("{:.1}%", status.completion_percent())),
        ("Queue depth", status.queue_depth.to_string()),
        ("Claims in flight", status.claims_in_flight.to_string()),
        ("Quarantined institutions", status.quarantined.to_string()),
    ];
    for (label, value) in summary {
        table.add_row(PrettyRow::new(vec![Cell::new(label), Cell::new(&value)]));
    }
    table.printstd();

    let mut categories = Table::new();
    categories.add_row(PrettyRow::new(vec![Cell::new("Category"), Cell::new("Papers")]));
    for (category, count) in &status.by_category {
        categories.add_row(PrettyRow::new(vec![
            Cell::new(category),
            Cell::new(&count.to_string()),
        ]));
    }
    categories.printstd();

    if quarantine_limit > 0 {
        let entities = db.list_quarantine(quarantine_limit).await?;
        let mut quarantined = Table::new();
        quarantined.add_row(PrettyRow::new(vec![
            Cell::new("Institution"),
            Cell::new("Reason"),
            Cell::new("Papers"),
            Cell::new("Attempts"),
            Cell::new("Last seen"),
        ]));
        for entity in entities {
            quarantined.add_row(PrettyRow::new(vec![
                Cell::new(&entity.entity_name),
                Cell::new(&entity.reason),
                Cell::new(&entity.record_count.to_string()),
                Cell::new(&entity.attempts.to_string()),
                Cell::new(&entity.last_seen),
            ]));
        }
        quarantined.printstd();
    }

    Ok(())
}
