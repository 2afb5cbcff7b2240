//! Postgres implementations of the search sync port traits.
//!
//! Each adapter is a newtype wrapping PgPool, except [`PgSyncTx`] which
//! borrows the caller's open transaction. All SQL is runtime-checked
//! (sqlx::query, not sqlx::query!) because root tables are only known from
//! the registry at startup.

pub mod listener;
pub mod outbox;
pub mod ranking;
pub mod reindex;
mod sql;
pub mod tx;

use anyhow::anyhow;
use sqlx::PgPool;

use search_sync_core::ports::Result;
use search_sync_core::registry::SearchRegistry;

pub use listener::ReindexListener;
pub use outbox::PgOutboxStore;
pub use ranking::PgRankingStore;
pub use reindex::PgReindexStore;
pub use tx::{PgSyncTx, REINDEX_CHANNEL};

/// All pool-backed adapters, built from one pool.
pub struct PgStores {
    pub outbox: PgOutboxStore,
    pub reindex: PgReindexStore,
    pub ranking: PgRankingStore,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: PgOutboxStore::new(pool.clone()),
            reindex: PgReindexStore::new(pool.clone()),
            ranking: PgRankingStore::new(pool),
        }
    }
}

/// Apply the embedded migrations (`pg_trgm`, `search_outbox`).
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| anyhow!(e))?;
    Ok(())
}

/// Add `search_content`, the generated `search_vector`, and their indexes to
/// every registered root table. Idempotent.
pub async fn ensure_search_columns(pool: &PgPool, registry: &SearchRegistry) -> Result<()> {
    for root in registry.roots() {
        for statement in sql::search_columns(root)? {
            sqlx::query(&statement)
                .execute(pool)
                .await
                .map_err(|e| anyhow!(e))?;
        }
        tracing::info!(table = root.table_name(), "Search columns ensured");
    }
    Ok(())
}
