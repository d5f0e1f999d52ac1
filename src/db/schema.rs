use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS papers (
                id TEXT PRIMARY KEY,
                raw_metadata TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_papers_ingested_at ON papers (ingested_at);

            -- One row per paper; method_rank keeps authoritative sources from being overwritten
            CREATE TABLE IF NOT EXISTS country_enrichment (
                record_id TEXT PRIMARY KEY,
                country_name TEXT,
                category TEXT NOT NULL, -- United States, China, Rest of the World, Unknown
                institution_name TEXT,
                confidence REAL NOT NULL,
                method TEXT NOT NULL,
                method_rank INTEGER NOT NULL,
                author_position INTEGER,
                processed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_country_enrichment_category ON country_enrichment (category);
            CREATE INDEX IF NOT EXISTS idx_country_enrichment_method ON country_enrichment (method);

            CREATE TABLE IF NOT EXISTS enrichment_queue (
                record_id TEXT PRIMARY KEY,
                priority INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_enrichment_queue_order ON enrichment_queue (priority DESC, enqueued_at ASC);

            -- Rows move here from enrichment_queue when a worker claims them
            CREATE TABLE IF NOT EXISTS enrichment_claims (
                record_id TEXT PRIMARY KEY,
                priority INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                worker TEXT NOT NULL,
                claimed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_enrichment_claims_claimed_at ON enrichment_claims (claimed_at);
            CREATE INDEX IF NOT EXISTS idx_enrichment_claims_worker ON enrichment_claims (worker);

            CREATE TABLE IF NOT EXISTS enrichment_quarantine (
                entity_key TEXT PRIMARY KEY,
                entity_name TEXT NOT NULL,
                reason_kind TEXT NOT NULL, -- parse_failure, retries_exhausted, rate_limit_exhausted, missing_from_response, unexpected_error
                reason TEXT NOT NULL,
                record_count INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_enrichment_quarantine_reason_kind ON enrichment_quarantine (reason_kind);
            "#,
        )
        .execute(&mut *conn)
        .await?;
        info!(target: TARGET_DB, "Tables ensured to exist");

        Ok(())
    }
}
