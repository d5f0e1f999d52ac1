use chrono::Utc;
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tracing::{debug, error, info, instrument};

use super::core::{db_timestamp, Database};
use crate::enrichment::types::TargetRecord;
use crate::error::EnrichError;
use crate::TARGET_DB;

// Stays well under SQLite's bound-parameter limit.
pub(crate) const ID_CHUNK: usize = 500;

/// Which papers a one-shot run works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotScope {
    /// Papers without an enrichment row.
    Incremental,
    /// Every paper.
    FullRebuild,
}

impl SnapshotScope {
    fn count_sql(&self) -> &'static str {
        match self {
            SnapshotScope::Incremental => {
                "SELECT COUNT(*) FROM papers p LEFT JOIN country_enrichment e ON e.record_id = p.id WHERE e.record_id IS NULL"
            }
            SnapshotScope::FullRebuild => "SELECT COUNT(*) FROM papers",
        }
    }

    fn select_sql(&self) -> &'static str {
        match self {
            SnapshotScope::Incremental => {
                "SELECT p.id, p.raw_metadata FROM papers p LEFT JOIN country_enrichment e ON e.record_id = p.id WHERE e.record_id IS NULL ORDER BY p.id"
            }
            SnapshotScope::FullRebuild => "SELECT id, raw_metadata FROM papers ORDER BY id",
        }
    }
}

impl std::fmt::Display for SnapshotScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotScope::Incremental => write!(f, "incremental"),
            SnapshotScope::FullRebuild => write!(f, "full-rebuild"),
        }
    }
}

/// A snapshot that fetched a different number of rows than it counted was not atomic.
pub fn verify_snapshot(expected: i64, fetched: usize) -> Result<(), EnrichError> {
    if expected < 0 || expected as usize != fetched {
        return Err(EnrichError::SnapshotInconsistency { expected, fetched });
    }
    Ok(())
}

/// Stored metadata is JSON text; anything else is passed through as a string and yields no signal.
fn decode_metadata(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

impl Database {
    /// Inserts or replaces a paper's source metadata. Returns true if the paper is new.
    #[instrument(target = "db", level = "debug", skip(self, raw_metadata))]
    pub async fn add_paper(&self, id: &str, raw_metadata: &Value) -> Result<bool, sqlx::Error> {
        if id.trim().is_empty() {
            error!(target: TARGET_DB, "Attempted to add a paper with an empty id");
            return Err(sqlx::Error::Protocol("Empty paper id provided".into()));
        }

        let exists = sqlx::query("SELECT 1 FROM papers WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .is_some();

        sqlx::query(
            r#"
            INSERT INTO papers (id, raw_metadata, ingested_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET raw_metadata = excluded.raw_metadata
            "#,
        )
        .bind(id)
        .bind(raw_metadata.to_string())
        .bind(db_timestamp(Utc::now()))
        .execute(self.pool())
        .await?;

        debug!(target: TARGET_DB, "Stored paper {} (new: {})", id, !exists);
        Ok(!exists)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn count_papers(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM papers")
            .fetch_one(self.pool())
            .await
    }

    /// Counts and fetches the working set inside one read transaction, so papers ingested
    /// concurrently are left for the next run.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn extract_snapshot(
        &self,
        scope: SnapshotScope,
    ) -> Result<Vec<TargetRecord>, EnrichError> {
        let mut transaction = self.pool().begin().await?;

        let expected: i64 = sqlx::query_scalar(scope.count_sql())
            .fetch_one(&mut *transaction)
            .await?;
        let rows = sqlx::query(scope.select_sql())
            .fetch_all(&mut *transaction)
            .await?;
        transaction.commit().await?;

        let records: Vec<TargetRecord> = rows
            .into_iter()
            .map(|row| TargetRecord::new(row.get::<String, _>("id"), decode_metadata(row.get("raw_metadata"))))
            .collect();

        if let Err(e) = verify_snapshot(expected, records.len()) {
            error!(target: TARGET_DB, "Aborting {} snapshot: {}", scope, e);
            return Err(e);
        }

        info!(target: TARGET_DB, "Extracted {} snapshot of {} papers", scope, records.len());
        Ok(records)
    }

    /// Loads papers by id, in the order given. Ids without a paper row are skipped.
    #[instrument(target = "db", level = "debug", skip(self, ids), fields(count = ids.len()))]
    pub async fn fetch_papers(&self, ids: &[String]) -> Result<Vec<TargetRecord>, sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        fetch_papers_with(&mut conn, ids).await
    }
}

/// Shared by [`Database::fetch_papers`] and the queue claim, which runs it inside its transaction.
pub(crate) async fn fetch_papers_with(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> Result<Vec<TargetRecord>, sqlx::Error> {
    let mut found = std::collections::HashMap::with_capacity(ids.len());

    for chunk in ids.chunks(ID_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, raw_metadata FROM papers WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        for row in builder.build().fetch_all(&mut *conn).await? {
            let id: String = row.get("id");
            found.insert(id, decode_metadata(row.get("raw_metadata")));
        }
    }

    Ok(ids
        .iter()
        .filter_map(|id| {
            found
                .remove(id)
                .map(|metadata| TargetRecord::new(id.clone(), metadata))
        })
        .collect())
}
