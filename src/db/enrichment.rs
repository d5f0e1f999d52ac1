use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::core::{db_timestamp, parse_db_timestamp, Database};
use super::paper::ID_CHUNK;
use crate::enrichment::types::{Category, EnrichmentRow, Method, QuarantineReason};
use crate::TARGET_DB;

/// One quarantined entity, as written to `enrichment_quarantine`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantineEntry {
    pub entity_key: String,
    pub entity_name: String,
    pub reason: QuarantineReason,
    pub record_count: usize,
}

/// A row read back from `enrichment_quarantine`.
#[derive(Debug, Clone)]
pub struct QuarantinedEntity {
    pub entity_key: String,
    pub entity_name: String,
    pub reason_kind: String,
    pub reason: String,
    pub record_count: i64,
    pub attempts: i64,
    pub last_seen: String,
}

/// Counts shown by the `status` command.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentStatus {
    pub total: i64,
    pub enriched: i64,
    pub by_category: Vec<(String, i64)>,
    pub queue_depth: i64,
    pub claims_in_flight: i64,
    pub quarantined: i64,
}

impl EnrichmentStatus {
    pub fn completion_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.enriched as f64 * 100.0 / self.total as f64
    }
}

impl Database {
    /// Upserts rows keyed by `record_id`. An existing row is only replaced by one whose method
    /// ranks at least as high, so an inferred country never overwrites a source country code.
    /// Returns the number of rows written.
    #[instrument(target = "db", level = "info", skip(self, rows), fields(count = rows.len()))]
    pub async fn upsert_enrichment_rows(&self, rows: &[EnrichmentRow]) -> Result<u64, sqlx::Error> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut transaction = self.pool().begin().await?;
        let mut written = 0;

        for row in rows {
            written += sqlx::query(
                r#"
                INSERT INTO country_enrichment (
                    record_id, country_name, category, institution_name, confidence,
                    method, method_rank, author_position, processed_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(record_id) DO UPDATE SET
                    country_name = excluded.country_name,
                    category = excluded.category,
                    institution_name = excluded.institution_name,
                    confidence = excluded.confidence,
                    method = excluded.method,
                    method_rank = excluded.method_rank,
                    author_position = excluded.author_position,
                    processed_at = excluded.processed_at
                WHERE excluded.method_rank >= country_enrichment.method_rank
                "#,
            )
            .bind(&row.record_id)
            .bind(&row.country_name)
            .bind(row.category.as_str())
            .bind(&row.institution_name)
            .bind(row.confidence)
            .bind(row.method.as_str())
            .bind(row.method.rank())
            .bind(row.author_position)
            .bind(db_timestamp(row.processed_at))
            .execute(&mut *transaction)
            .await?
            .rows_affected();
        }

        transaction.commit().await?;

        if written < rows.len() as u64 {
            debug!(target: TARGET_DB, "{} rows kept an existing higher-priority result", rows.len() as u64 - written);
        }
        info!(target: TARGET_DB, "Wrote {} enrichment rows", written);
        Ok(written)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn fetch_enrichment(
        &self,
        record_id: &str,
    ) -> Result<Option<EnrichmentRow>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT record_id, country_name, category, institution_name, confidence,
                   method, author_position, processed_at
            FROM country_enrichment
            WHERE record_id = ?1
            "#,
        )
        .bind(record_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| decode_enrichment_row(&row)).transpose()
    }

    /// Every enrichment row, ordered by record id.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn fetch_all_enrichment(&self) -> Result<Vec<EnrichmentRow>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT record_id, country_name, category, institution_name, confidence,
                   method, author_position, processed_at
            FROM country_enrichment
            ORDER BY record_id
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(decode_enrichment_row).collect()
    }

    /// Logs quarantined entities. A repeat quarantine bumps the attempt counter.
    #[instrument(target = "db", level = "info", skip(self, entries), fields(count = entries.len()))]
    pub async fn record_quarantine(&self, entries: &[QuarantineEntry]) -> Result<(), sqlx::Error> {
        if entries.is_empty() {
            return Ok(());
        }

        let now = db_timestamp(Utc::now());
        let mut transaction = self.pool().begin().await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO enrichment_quarantine (
                    entity_key, entity_name, reason_kind, reason, record_count,
                    attempts, first_seen, last_seen
                )
                VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
                ON CONFLICT(entity_key) DO UPDATE SET
                    entity_name = excluded.entity_name,
                    reason_kind = excluded.reason_kind,
                    reason = excluded.reason,
                    record_count = excluded.record_count,
                    attempts = enrichment_quarantine.attempts + 1,
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(&entry.entity_key)
            .bind(&entry.entity_name)
            .bind(entry.reason.kind())
            .bind(entry.reason.to_string())
            .bind(entry.record_count as i64)
            .bind(&now)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;
        warn!(target: TARGET_DB, "Recorded {} quarantined entities", entries.len());
        Ok(())
    }

    /// Removes entities that have since resolved.
    #[instrument(target = "db", level = "debug", skip(self, entity_keys), fields(count = entity_keys.len()))]
    pub async fn clear_quarantine(&self, entity_keys: &[String]) -> Result<u64, sqlx::Error> {
        let mut cleared = 0;
        for chunk in entity_keys.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM enrichment_quarantine WHERE entity_key IN (");
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key);
            }
            separated.push_unseparated(")");
            cleared += builder.build().execute(self.pool()).await?.rows_affected();
        }
        if cleared > 0 {
            info!(target: TARGET_DB, "Cleared {} entities from quarantine", cleared);
        }
        Ok(cleared)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn list_quarantine(&self, limit: i64) -> Result<Vec<QuarantinedEntity>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT entity_key, entity_name, reason_kind, reason, record_count, attempts, last_seen
            FROM enrichment_quarantine
            ORDER BY record_count DESC, entity_key ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| QuarantinedEntity {
                entity_key: row.get("entity_key"),
                entity_name: row.get("entity_name"),
                reason_kind: row.get("reason_kind"),
                reason: row.get("reason"),
                record_count: row.get("record_count"),
                attempts: row.get("attempts"),
                last_seen: row.get("last_seen"),
            })
            .collect())
    }

    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn enrichment_status(&self) -> Result<EnrichmentStatus, sqlx::Error> {
        let total = self.count_papers().await?;
        let enriched: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM country_enrichment e JOIN papers p ON p.id = e.record_id",
        )
        .fetch_one(self.pool())
        .await?;

        let by_category = sqlx::query(
            r#"
            SELECT category, COUNT(*) as count
            FROM country_enrichment
            GROUP BY category
            ORDER BY count DESC, category ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(|row| (row.get::<String, _>("category"), row.get::<i64, _>("count")))
        .collect();

        let quarantined: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_quarantine")
            .fetch_one(self.pool())
            .await?;

        Ok(EnrichmentStatus {
            total,
            enriched,
            by_category,
            queue_depth: self.queue_depth().await?,
            claims_in_flight: self.claims_in_flight().await?,
            quarantined,
        })
    }
}

fn decode_enrichment_row(row: &sqlx::sqlite::SqliteRow) -> Result<EnrichmentRow, sqlx::Error> {
    let category: String = row.try_get("category")?;
    let method: String = row.try_get("method")?;
    let processed_at: String = row.try_get("processed_at")?;
    Ok(EnrichmentRow {
        record_id: row.try_get("record_id")?,
        country_name: row.try_get("country_name")?,
        category: Category::from(category.as_str()),
        institution_name: row.try_get("institution_name")?,
        confidence: row.try_get("confidence")?,
        method: Method::from(method.as_str()),
        author_position: row.try_get("author_position")?,
        processed_at: parse_db_timestamp(&processed_at)?,
    })
}
