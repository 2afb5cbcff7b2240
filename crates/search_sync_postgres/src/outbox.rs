use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use search_sync_core::error::SyncError;
use search_sync_core::ports::{OutboxStore, Result};
use search_sync_core::types::OutboxEntry;

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    entity_type: String,
    entity_id: i64,
    operation: String,
    payload: Option<serde_json::Value>,
    processed: bool,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    retry_count: i32,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = SyncError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(OutboxEntry {
            id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            operation: row.operation.parse()?,
            payload: row.payload,
            processed: row.processed,
            created_at: row.created_at,
            processed_at: row.processed_at,
            error_message: row.error_message,
            retry_count: row.retry_count,
        })
    }
}

// ── PgOutboxStore ─────────────────────────────────────────────

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(
        &self,
        claimer: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        // Atomic claim using CTE + FOR UPDATE SKIP LOCKED. A candidate is
        // held back while any earlier unprocessed entry for the same entity
        // is outside this claim: claimed elsewhere, or row-locked by a
        // concurrent claim and so skipped here. Deliveries per entity stay
        // in id order.
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            WITH candidates AS (
                SELECT o.id, o.entity_type, o.entity_id
                FROM search_outbox o
                WHERE NOT o.processed
                  AND (o.claimed_by IS NULL
                       OR o.claimed_by = $1
                       OR o.claim_expires_at < now())
                ORDER BY o.id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ),
            claimable AS (
                SELECT c.id
                FROM candidates c
                WHERE NOT EXISTS (
                    SELECT 1
                    FROM search_outbox earlier
                    WHERE earlier.entity_type = c.entity_type
                      AND earlier.entity_id = c.entity_id
                      AND earlier.id < c.id
                      AND NOT earlier.processed
                      AND earlier.id NOT IN (SELECT id FROM candidates)
                )
            )
            UPDATE search_outbox e
            SET claimed_by = $1,
                claim_expires_at = now() + make_interval(secs => $3)
            FROM claimable c
            WHERE e.id = c.id
            RETURNING e.id, e.entity_type, e.entity_id, e.operation, e.payload,
                      e.processed, e.created_at, e.processed_at, e.error_message,
                      e.retry_count
            "#,
        )
        .bind(claimer)
        .bind(limit as i64)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        let mut entries = rows
            .into_iter()
            .map(OutboxEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE search_outbox
            SET processed = TRUE,
                processed_at = now(),
                error_message = NULL,
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("outbox entry {id}")));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE search_outbox
            SET processed = TRUE,
                processed_at = now(),
                error_message = $2,
                retry_count = retry_count + 1,
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("outbox entry {id}")));
        }
        Ok(())
    }

    async fn requeue_failed(&self, max_retries: i32) -> Result<u64> {
        // A failed entry with a later entry for the same entity is superseded
        // and never comes back.
        let result = sqlx::query(
            r#"
            UPDATE search_outbox o
            SET processed = FALSE,
                processed_at = NULL
            WHERE o.processed
              AND o.error_message IS NOT NULL
              AND o.retry_count < $1
              AND NOT EXISTS (
                  SELECT 1
                  FROM search_outbox later
                  WHERE later.entity_type = o.entity_type
                    AND later.entity_id = o.entity_id
                    AND later.id > o.id
              )
            "#,
        )
        .bind(max_retries)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM search_outbox WHERE NOT processed")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| anyhow!(e))?;
        Ok(count as u64)
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let row = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, entity_type, entity_id, operation, payload, processed,
                   created_at, processed_at, error_message, retry_count
            FROM search_outbox
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.map(OutboxEntry::try_from).transpose()
    }
}
