use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};

use search_sync_core::ports::{DocumentSource, RankQuery, RankingStore, Result};
use search_sync_core::schema::{RankingStrategy, RootEntity};
use search_sync_core::types::RankedId;

use crate::reindex::load_documents;
use crate::sql;

/// Rank expression and match predicate; `$1` is the query text.
fn strategy_sql(strategy: RankingStrategy) -> (&'static str, &'static str) {
    match strategy {
        RankingStrategy::Trigram => (
            "word_similarity($1, search_content)::float8",
            "$1 <% search_content",
        ),
        RankingStrategy::FullText => (
            "ts_rank(search_vector, websearch_to_tsquery('simple', $1))::float8",
            "search_vector @@ websearch_to_tsquery('simple', $1)",
        ),
    }
}

/// `<%` reads its cut-off from this setting; `is_local` scopes it to the
/// surrounding transaction.
async fn set_threshold(conn: &mut PgConnection, threshold: f64) -> Result<()> {
    sqlx::query("SELECT set_config('pg_trgm.word_similarity_threshold', $1, true)")
        .bind(threshold.to_string())
        .execute(conn)
        .await
        .map_err(|e| anyhow!(e))?;
    Ok(())
}

// ── PgRankingStore ────────────────────────────────────────────

pub struct PgRankingStore {
    pool: PgPool,
}

impl PgRankingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentSource for PgRankingStore {
    async fn load_documents(&self, root: &RootEntity, ids: &[i64]) -> Result<Vec<(i64, Value)>> {
        load_documents(&self.pool, root, ids).await
    }
}

#[async_trait]
impl RankingStore for PgRankingStore {
    async fn rank(&self, root: &RootEntity, query: &RankQuery<'_>) -> Result<Vec<RankedId>> {
        let (rank, predicate) = strategy_sql(root.strategy);
        let statement = format!(
            r#"
            SELECT id::bigint, {rank} AS rank
            FROM {}
            WHERE {predicate}
            ORDER BY rank DESC, id ASC
            OFFSET $2
            LIMIT $3
            "#,
            sql::quote(root.table_name())?
        );

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        set_threshold(&mut tx, query.threshold).await?;
        let rows = sqlx::query_as::<_, (i64, f64)>(&statement)
            .bind(query.text)
            .bind(query.skip as i64)
            .bind(query.limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;
        tx.commit().await.map_err(|e| anyhow!(e))?;

        Ok(rows
            .into_iter()
            .map(|(id, rank)| RankedId { id, rank })
            .collect())
    }

    async fn count_matches(&self, root: &RootEntity, query: &RankQuery<'_>) -> Result<u64> {
        let (_, predicate) = strategy_sql(root.strategy);
        let statement = format!(
            "SELECT count(*) FROM {} WHERE {predicate}",
            sql::quote(root.table_name())?
        );

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        set_threshold(&mut tx, query.threshold).await?;
        let count: i64 = sqlx::query_scalar(&statement)
            .bind(query.text)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;
        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(count as u64)
    }

    async fn page_all(&self, root: &RootEntity, skip: u64, limit: u64) -> Result<(Vec<i64>, u64)> {
        let table = sql::quote(root.table_name())?;
        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT id::bigint FROM {table} ORDER BY id OFFSET $1 LIMIT $2"
        ))
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        let total: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok((ids, total as u64))
    }
}
