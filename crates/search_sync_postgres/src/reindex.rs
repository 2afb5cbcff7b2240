use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use search_sync_core::ports::{DocumentSource, ReindexStore, Result};
use search_sync_core::schema::RootEntity;
use search_sync_core::types::{ContentWrite, StaleRow};

use crate::sql;

pub(crate) async fn load_documents(
    pool: &PgPool,
    root: &RootEntity,
    ids: &[i64],
) -> Result<Vec<(i64, Value)>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let query = sql::load_documents(root)?;
    let rows = sqlx::query_as::<_, (i64, Value)>(&query)
        .bind(ids)
        .fetch_all(pool)
        .await
        .map_err(|e| anyhow!(e))?;
    Ok(rows)
}

// ── PgReindexStore ────────────────────────────────────────────

pub struct PgReindexStore {
    pool: PgPool,
}

impl PgReindexStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentSource for PgReindexStore {
    async fn load_documents(&self, root: &RootEntity, ids: &[i64]) -> Result<Vec<(i64, Value)>> {
        load_documents(&self.pool, root, ids).await
    }
}

#[async_trait]
impl ReindexStore for PgReindexStore {
    async fn stale_ids(
        &self,
        root: &RootEntity,
        limit: usize,
        exclude: &[i64],
    ) -> Result<Vec<StaleRow>> {
        let query = format!(
            r#"
            SELECT id::bigint, search_generation
            FROM {}
            WHERE search_content IS NULL
              AND id <> ALL($2)
            ORDER BY id
            LIMIT $1
            "#,
            sql::quote(root.table_name())?
        );
        let rows: Vec<(i64, i64)> = sqlx::query_as(&query)
            .bind(limit as i64)
            .bind(exclude)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(rows
            .into_iter()
            .map(|(id, generation)| StaleRow { id, generation })
            .collect())
    }

    async fn write_search_content(&self, root: &RootEntity, rows: &[ContentWrite]) -> Result<u64> {
        // Rows invalidated since `stale_ids` keep their NULL. An uncommitted
        // invalidation holds the row lock; the WHERE is re-checked once it commits.
        let query = format!(
            r#"
            UPDATE {} AS t
            SET search_content = v.content
            FROM UNNEST($1::bigint[], $2::bigint[], $3::text[]) AS v(id, generation, content)
            WHERE t.id = v.id
              AND t.search_generation = v.generation
            "#,
            sql::quote(root.table_name())?
        );
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let generations: Vec<i64> = rows.iter().map(|r| r.generation).collect();
        let contents: Vec<String> = rows.iter().map(|r| r.content.clone()).collect();

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let result = sqlx::query(&query)
            .bind(&ids)
            .bind(&generations)
            .bind(&contents)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;
        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self, root: &RootEntity) -> Result<u64> {
        let query = format!(
            "UPDATE {} SET search_content = NULL, search_generation = search_generation + 1",
            sql::quote(root.table_name())?
        );
        let result = sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected())
    }
}
