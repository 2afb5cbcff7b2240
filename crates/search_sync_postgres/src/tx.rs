//! `SyncTransaction` over the caller's open sqlx transaction.

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::PgConnection;

use search_sync_core::ports::{Result, SyncTransaction};
use search_sync_core::schema::{RelationHop, RootEntity};
use search_sync_core::types::NewOutboxEntry;

use crate::sql;

/// LISTEN/NOTIFY channel carrying reindex signals. The payload is unused.
pub const REINDEX_CHANNEL: &str = "search_reindex";

/// Borrow of the caller's connection for the duration of one write.
///
/// ```ignore
/// let mut tx = pool.begin().await?;
/// // ... the service layer's own UPDATE ...
/// sync.record_change(&mut PgSyncTx::new(&mut tx), change).await?;
/// tx.commit().await?;
/// ```
pub struct PgSyncTx<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> PgSyncTx<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SyncTransaction for PgSyncTx<'_> {
    async fn append_outbox(&mut self, entry: &NewOutboxEntry) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO search_outbox (entity_type, entity_id, operation, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&entry.entity_type)
        .bind(entry.entity_id)
        .bind(entry.operation.as_str())
        .bind(&entry.payload)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(id)
    }

    async fn follow_hop(
        &mut self,
        from_table: &str,
        hop: &RelationHop,
        ids: &[i64],
    ) -> Result<Vec<i64>> {
        let query = sql::follow_hop(from_table, hop)?;
        let reached: Vec<i64> = sqlx::query_scalar(&query)
            .bind(ids)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(reached)
    }

    async fn clear_search_content(&mut self, root: &RootEntity, ids: &[i64]) -> Result<u64> {
        let query = format!(
            "UPDATE {} SET search_content = NULL, search_generation = search_generation + 1 \
             WHERE id = ANY($1)",
            sql::quote(root.table_name())?
        );
        let result = sqlx::query(&query)
            .bind(ids)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.exec(format!("SAVEPOINT {}", sql::quote(name)?)).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.exec(format!("RELEASE SAVEPOINT {}", sql::quote(name)?))
            .await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.exec(format!("ROLLBACK TO SAVEPOINT {}", sql::quote(name)?))
            .await
    }

    async fn queue_reindex_signal(&mut self) -> Result<()> {
        // NOTIFY inside a transaction is delivered on commit and dropped on rollback.
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(REINDEX_CHANNEL)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

impl PgSyncTx<'_> {
    async fn exec(&mut self, statement: String) -> Result<()> {
        sqlx::query(&statement)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}
