use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::core::{db_timestamp, Database};
use super::paper::{fetch_papers_with, ID_CHUNK};
use crate::enrichment::types::TargetRecord;
use crate::TARGET_DB;

/// Rows a worker took off the queue. `record_ids` holds every claimed id, including any
/// whose paper row has since disappeared.
#[derive(Debug, Default, Clone)]
pub struct ClaimedBatch {
    pub record_ids: Vec<String>,
    pub records: Vec<TargetRecord>,
}

impl ClaimedBatch {
    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }
}

impl Database {
    /// Queues papers for enrichment. An id already queued keeps the higher of the two priorities.
    #[instrument(target = "db", level = "info", skip(self, record_ids), fields(count = record_ids.len()))]
    pub async fn enqueue_records(
        &self,
        record_ids: &[String],
        priority: i64,
    ) -> Result<u64, sqlx::Error> {
        let enqueued_at = db_timestamp(Utc::now());
        let mut transaction = self.pool().begin().await?;
        let mut affected = 0;

        for record_id in record_ids {
            affected += sqlx::query(
                r#"
                INSERT INTO enrichment_queue (record_id, priority, enqueued_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(record_id) DO UPDATE SET priority = excluded.priority
                WHERE excluded.priority > enrichment_queue.priority
                "#,
            )
            .bind(record_id)
            .bind(priority)
            .bind(&enqueued_at)
            .execute(&mut *transaction)
            .await?
            .rows_affected();
        }

        transaction.commit().await?;
        debug!(target: TARGET_DB, "Enqueued or re-prioritised {} records", affected);
        Ok(affected)
    }

    /// Seeds the queue from papers lacking an enrichment row, or from every paper when `all`
    /// is set. Papers already queued or claimed are left alone.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn enqueue_unenriched(&self, priority: i64, all: bool) -> Result<u64, sqlx::Error> {
        let sql = if all {
            r#"
            INSERT INTO enrichment_queue (record_id, priority, enqueued_at)
            SELECT p.id, ?1, ?2 FROM papers p
            WHERE p.id NOT IN (SELECT record_id FROM enrichment_claims)
            ON CONFLICT(record_id) DO NOTHING
            "#
        } else {
            r#"
            INSERT INTO enrichment_queue (record_id, priority, enqueued_at)
            SELECT p.id, ?1, ?2 FROM papers p
            LEFT JOIN country_enrichment e ON e.record_id = p.id
            WHERE e.record_id IS NULL
              AND p.id NOT IN (SELECT record_id FROM enrichment_claims)
            ON CONFLICT(record_id) DO NOTHING
            "#
        };

        let added = sqlx::query(sql)
            .bind(priority)
            .bind(db_timestamp(Utc::now()))
            .execute(self.pool())
            .await?
            .rows_affected();

        info!(target: TARGET_DB, "Added {} papers to the enrichment queue", added);
        Ok(added)
    }

    /// Atomically moves up to `limit` rows, highest priority then oldest first, from the queue
    /// into `enrichment_claims` and returns their papers. Rows deferred into the future are
    /// skipped until their time comes. The delete is the transaction's first
    /// statement, so the write lock is held from the start and two workers can never claim
    /// the same row. An empty queue yields an empty batch.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn claim_enrichment_batch(
        &self,
        worker: &str,
        limit: i64,
    ) -> Result<ClaimedBatch, sqlx::Error> {
        let mut transaction = self.pool().begin().await?;

        let rows = sqlx::query(
            r#"
            DELETE FROM enrichment_queue
            WHERE record_id IN (
                SELECT record_id FROM enrichment_queue
                WHERE enqueued_at <= ?2
                ORDER BY priority DESC, enqueued_at ASC
                LIMIT ?1
            )
            RETURNING record_id, priority, enqueued_at
            "#,
        )
        .bind(limit.max(0))
        .bind(db_timestamp(Utc::now()))
        .fetch_all(&mut *transaction)
        .await?;

        if rows.is_empty() {
            transaction.rollback().await?;
            debug!(target: TARGET_DB, "No rows waiting in the enrichment queue");
            return Ok(ClaimedBatch::default());
        }

        let mut claimed: Vec<(String, i64, String)> = rows
            .into_iter()
            .map(|row| (row.get("record_id"), row.get("priority"), row.get("enqueued_at")))
            .collect();
        // RETURNING order is unspecified
        claimed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));

        let claimed_at = db_timestamp(Utc::now());
        for chunk in claimed.chunks(ID_CHUNK / 5) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO enrichment_claims (record_id, priority, enqueued_at, worker, claimed_at) ",
            );
            builder.push_values(chunk, |mut b, (record_id, priority, enqueued_at)| {
                b.push_bind(record_id)
                    .push_bind(priority)
                    .push_bind(enqueued_at)
                    .push_bind(worker)
                    .push_bind(&claimed_at);
            });
            builder.build().execute(&mut *transaction).await?;
        }

        let record_ids: Vec<String> = claimed.into_iter().map(|(id, _, _)| id).collect();
        let records = fetch_papers_with(&mut transaction, &record_ids).await?;
        transaction.commit().await?;

        if records.len() < record_ids.len() {
            warn!(target: TARGET_DB, "{} claimed ids have no paper row", record_ids.len() - records.len());
        }
        info!(target: TARGET_DB, "Worker {} claimed {} records", worker, record_ids.len());

        Ok(ClaimedBatch {
            record_ids,
            records,
        })
    }

    /// Drops finished claims.
    #[instrument(target = "db", level = "debug", skip(self, record_ids), fields(count = record_ids.len()))]
    pub async fn release_claims(&self, record_ids: &[String]) -> Result<u64, sqlx::Error> {
        let mut released = 0;
        for chunk in record_ids.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM enrichment_claims WHERE record_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            released += builder.build().execute(self.pool()).await?.rows_affected();
        }
        debug!(target: TARGET_DB, "Released {} claims", released);
        Ok(released)
    }

    /// Puts claimed rows back on the queue with their original priority and enqueue time.
    #[instrument(target = "db", level = "info", skip(self, record_ids), fields(count = record_ids.len()))]
    pub async fn return_claims_to_queue(&self, record_ids: &[String]) -> Result<u64, sqlx::Error> {
        let returned = self.move_claims_to_queue(record_ids, None).await?;
        info!(target: TARGET_DB, "Returned {} claimed records to the queue", returned);
        Ok(returned)
    }

    /// Puts claimed rows back on the queue one priority step lower, not claimable again until
    /// `delay` has passed. Used for records whose entity was quarantined.
    #[instrument(target = "db", level = "info", skip(self, record_ids), fields(count = record_ids.len()))]
    pub async fn defer_claims(
        &self,
        record_ids: &[String],
        delay: Duration,
    ) -> Result<u64, sqlx::Error> {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        let deferred = self
            .move_claims_to_queue(record_ids, Some(Utc::now() + delay))
            .await?;
        info!(target: TARGET_DB, "Deferred {} quarantined records", deferred);
        Ok(deferred)
    }

    async fn move_claims_to_queue(
        &self,
        record_ids: &[String],
        available_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let available_at = available_at.map(db_timestamp);
        let mut transaction = self.pool().begin().await?;
        let mut moved = 0;

        for chunk in record_ids.chunks(ID_CHUNK) {
            let mut insert: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO enrichment_queue (record_id, priority, enqueued_at) ");
            match &available_at {
                Some(at) => {
                    insert.push("SELECT record_id, priority - 1, ");
                    insert.push_bind(at);
                    insert.push(" FROM enrichment_claims WHERE record_id IN (");
                }
                None => {
                    insert.push(
                        "SELECT record_id, priority, enqueued_at FROM enrichment_claims WHERE record_id IN (",
                    );
                }
            }
            let mut separated = insert.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(") ON CONFLICT(record_id) DO NOTHING");
            moved += insert.build().execute(&mut *transaction).await?.rows_affected();

            let mut delete: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM enrichment_claims WHERE record_id IN (");
            let mut separated = delete.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            delete.build().execute(&mut *transaction).await?;
        }

        transaction.commit().await?;
        Ok(moved)
    }

    /// Returns claims older than `lease` to the queue. Covers workers that died mid-batch.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn requeue_expired_claims(&self, lease: Duration) -> Result<u64, sqlx::Error> {
        let lease = chrono::Duration::from_std(lease)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.requeue_claims_older_than(Utc::now() - lease).await
    }

    pub(crate) async fn requeue_claims_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let cutoff = db_timestamp(cutoff);
        let mut transaction = self.pool().begin().await?;

        let requeued = sqlx::query(
            r#"
            INSERT INTO enrichment_queue (record_id, priority, enqueued_at)
            SELECT record_id, priority, enqueued_at FROM enrichment_claims
            WHERE claimed_at < ?1
            ON CONFLICT(record_id) DO NOTHING
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *transaction)
        .await?
        .rows_affected();

        let expired = sqlx::query("DELETE FROM enrichment_claims WHERE claimed_at < ?1")
            .bind(&cutoff)
            .execute(&mut *transaction)
            .await?
            .rows_affected();

        transaction.commit().await?;

        if expired > 0 {
            warn!(target: TARGET_DB, "Requeued {} expired claims ({} already queued again)", expired, expired - requeued);
        }
        Ok(expired)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn queue_depth(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM enrichment_queue")
            .fetch_one(self.pool())
            .await?;

        let count: i64 = row.get("count");
        debug!(target: TARGET_DB, "Counted {} entries in the queue", count);
        Ok(count)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn claims_in_flight(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_claims")
            .fetch_one(self.pool())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded(ids: &[&str]) -> Database {
        let db = Database::in_memory().await.unwrap();
        for id in ids {
            db.add_paper(id, &json!({"authorships": []})).await.unwrap();
        }
        db
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_claim_order_and_removal() {
        let db = seeded(&["W1", "W2", "W3"]).await;
        db.enqueue_records(&ids(&["W2"]), 0).await.unwrap();
        db.enqueue_records(&ids(&["W1"]), 1).await.unwrap();
        db.enqueue_records(&ids(&["W3"]), 5).await.unwrap();

        let first = db.claim_enrichment_batch("worker-1", 2).await.unwrap();
        assert_eq!(first.record_ids, ids(&["W3", "W1"]));
        assert_eq!(first.records.len(), 2);
        assert_eq!(db.queue_depth().await.unwrap(), 1);
        assert_eq!(db.claims_in_flight().await.unwrap(), 2);

        // A second claimer never sees rows already claimed
        let second = db.claim_enrichment_batch("worker-2", 10).await.unwrap();
        assert_eq!(second.record_ids, ids(&["W2"]));

        let empty = db.claim_enrichment_batch("worker-1", 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_keeps_higher_priority() {
        let db = seeded(&["W1"]).await;
        db.enqueue_records(&ids(&["W1"]), 3).await.unwrap();
        db.enqueue_records(&ids(&["W1"]), 1).await.unwrap();
        let priority: i64 =
            sqlx::query_scalar("SELECT priority FROM enrichment_queue WHERE record_id = 'W1'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(priority, 3);
        assert_eq!(db.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_unenriched_skips_claimed_and_enriched() {
        let db = seeded(&["W1", "W2", "W3"]).await;
        sqlx::query(
            "INSERT INTO country_enrichment (record_id, category, confidence, method, method_rank, processed_at) VALUES ('W1', 'China', 1.0, 'direct_country_code', 3, '2024-01-01T00:00:00.000Z')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        db.enqueue_records(&ids(&["W2"]), 0).await.unwrap();
        db.claim_enrichment_batch("worker-1", 1).await.unwrap();

        assert_eq!(db.enqueue_unenriched(0, false).await.unwrap(), 1);
        assert_eq!(db.queue_depth().await.unwrap(), 1);

        // --all also takes enriched papers, still not the claimed one
        assert_eq!(db.enqueue_unenriched(0, true).await.unwrap(), 1);
        assert_eq!(db.queue_depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_release_and_return_claims() {
        let db = seeded(&["W1", "W2"]).await;
        db.enqueue_records(&ids(&["W1", "W2"]), 2).await.unwrap();
        let batch = db.claim_enrichment_batch("worker-1", 10).await.unwrap();

        assert_eq!(db.release_claims(&ids(&["W1"])).await.unwrap(), 1);
        assert_eq!(db.return_claims_to_queue(&ids(&["W2"])).await.unwrap(), 1);
        assert_eq!(db.claims_in_flight().await.unwrap(), 0);
        assert_eq!(batch.record_ids.len(), 2);

        let again = db.claim_enrichment_batch("worker-2", 10).await.unwrap();
        assert_eq!(again.record_ids, ids(&["W2"]));
    }

    #[tokio::test]
    async fn test_expired_claims_are_requeued() {
        let db = seeded(&["W1", "W2"]).await;
        db.enqueue_records(&ids(&["W1", "W2"]), 0).await.unwrap();
        db.claim_enrichment_batch("crashed-worker", 10).await.unwrap();

        // Fresh claims survive a normal lease
        assert_eq!(
            db.requeue_expired_claims(Duration::from_secs(1800))
                .await
                .unwrap(),
            0
        );

        let future = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(db.requeue_claims_older_than(future).await.unwrap(), 2);
        assert_eq!(db.claims_in_flight().await.unwrap(), 0);
        assert_eq!(db.queue_depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_skips_missing_papers() {
        let db = seeded(&["W1"]).await;
        db.enqueue_records(&ids(&["W1", "W404"]), 0).await.unwrap();
        let batch = db.claim_enrichment_batch("worker-1", 10).await.unwrap();
        assert_eq!(batch.record_ids.len(), 2);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id, "W1");
    }

    #[tokio::test]
    async fn test_deferred_claims_wait_and_drop_priority() {
        let db = seeded(&["W1", "W2"]).await;
        db.enqueue_records(&ids(&["W1", "W2"]), 3).await.unwrap();
        db.claim_enrichment_batch("worker-1", 10).await.unwrap();

        assert_eq!(
            db.defer_claims(&ids(&["W1"]), Duration::from_secs(600))
                .await
                .unwrap(),
            1
        );
        db.return_claims_to_queue(&ids(&["W2"])).await.unwrap();
        assert_eq!(db.claims_in_flight().await.unwrap(), 0);
        assert_eq!(db.queue_depth().await.unwrap(), 2);

        let priority: i64 =
            sqlx::query_scalar("SELECT priority FROM enrichment_queue WHERE record_id = 'W1'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(priority, 2);

        // Only the record returned normally is claimable now
        let batch = db.claim_enrichment_batch("worker-2", 10).await.unwrap();
        assert_eq!(batch.record_ids, ids(&["W2"]));
        assert!(db
            .claim_enrichment_batch("worker-2", 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(db.queue_depth().await.unwrap(), 1);

        // Once the delay has passed it comes back
        db.defer_claims(&ids(&["W2"]), Duration::ZERO).await.unwrap();
        sqlx::query("UPDATE enrichment_queue SET enqueued_at = '2000-01-01T00:00:00.000Z' WHERE record_id = 'W1'")
            .execute(db.pool())
            .await
            .unwrap();
        let batch = db.claim_enrichment_batch("worker-2", 10).await.unwrap();
        assert_eq!(batch.record_ids, ids(&["W1", "W2"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claimers_never_share_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.db");
        let db = Database::new(path.to_str().unwrap()).await.unwrap();

        let expected: Vec<String> = (0..400).map(|i| format!("W{:04}", i)).collect();
        for id in &expected {
            db.add_paper(id, &json!({"authorships": []})).await.unwrap();
        }
        db.enqueue_records(&expected, 0).await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let tag = format!("worker-{}", worker);
                let mut claimed = Vec::new();
                loop {
                    let batch = db.claim_enrichment_batch(&tag, 7).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.record_ids);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::BTreeSet<&String> = all.iter().collect();

        assert_eq!(all.len(), expected.len());
        assert_eq!(unique.len(), expected.len());
        assert!(expected.iter().all(|id| unique.contains(id)));
        assert_eq!(db.claims_in_flight().await.unwrap(), 400);
        assert_eq!(db.queue_depth().await.unwrap(), 0);
    }
}
