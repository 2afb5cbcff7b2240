//! Port traits — the seams between the sync logic and its adapters.
//!
//! `search_sync_postgres` implements the relational ports with sqlx,
//! `search_sync_meili` implements [`SearchEngine`], and [`crate::memory`]
//! implements all of them in-process for tests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncError;
use crate::schema::{RelationHop, RootEntity};
use crate::types::{
    ContentWrite, EngineSearchResult, NewOutboxEntry, OutboxEntry, RankedId, StaleRow,
};

pub type Result<T> = std::result::Result<T, SyncError>;

/// The caller's open transaction, used for everything that must commit
/// atomically with the triggering mutation.
#[async_trait]
pub trait SyncTransaction: Send {
    /// Append a ledger row and return its id.
    async fn append_outbox(&mut self, entry: &NewOutboxEntry) -> Result<i64>;

    /// Ids of `hop.target` rows reachable from the given `from_table` rows.
    async fn follow_hop(
        &mut self,
        from_table: &str,
        hop: &RelationHop,
        ids: &[i64],
    ) -> Result<Vec<i64>>;

    /// `UPDATE <root> SET search_content = NULL WHERE id IN (..)`, bumping
    /// each row's `search_generation`.
    async fn clear_search_content(&mut self, root: &RootEntity, ids: &[i64]) -> Result<u64>;

    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn release_savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    /// Queue a reindex signal that is delivered only if the transaction commits.
    async fn queue_reindex_signal(&mut self) -> Result<()>;
}

/// Dispatcher-side view of the outbox ledger (own connection, not the writer's).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` unprocessed entries, oldest first. An entry claimed
    /// by one claimer is invisible to others until `lease` expires.
    async fn claim_batch(
        &self,
        claimer: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>>;

    async fn mark_processed(&self, id: i64) -> Result<()>;

    /// Mark processed with an error message and bump the retry count.
    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    /// Return failed entries with `retry_count < max_retries` to the queue.
    async fn requeue_failed(&self, max_retries: i32) -> Result<u64>;

    async fn pending_count(&self) -> Result<u64>;

    async fn get(&self, id: i64) -> Result<Option<OutboxEntry>>;
}

/// The external search engine, consumed as a black box.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Add-or-replace by primary key; re-delivery is safe.
    async fn upsert_documents(&self, index: &str, documents: &[Value]) -> Result<()>;

    async fn delete_document(&self, index: &str, id: i64) -> Result<()>;

    async fn search(
        &self,
        index: &str,
        query: &str,
        offset: u64,
        limit: u64,
    ) -> Result<EngineSearchResult>;

    async fn ensure_index(
        &self,
        index: &str,
        primary_key: &str,
        searchable_attributes: &[String],
    ) -> Result<()>;
}

/// Loads root documents (row plus its declared relations) as JSON.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Missing ids are simply absent from the result.
    async fn load_documents(&self, root: &RootEntity, ids: &[i64]) -> Result<Vec<(i64, Value)>>;
}

#[async_trait]
pub trait ReindexStore: DocumentSource {
    /// Rows with `search_content IS NULL`, lowest id first, skipping `exclude`.
    async fn stale_ids(&self, root: &RootEntity, limit: usize, exclude: &[i64])
        -> Result<Vec<StaleRow>>;

    /// Write recomputed content for a batch and commit it. A row is only
    /// written while its generation still equals the one it was read at;
    /// returns the number of rows written.
    async fn write_search_content(&self, root: &RootEntity, rows: &[ContentWrite])
        -> Result<u64>;

    /// Null every row's content (bumping generations) so the next pass
    /// recomputes the whole table.
    async fn clear_all(&self, root: &RootEntity) -> Result<u64>;
}

/// A ranked-search request as seen by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RankQuery<'a> {
    pub text: &'a str,
    pub threshold: f64,
    pub skip: u64,
    pub limit: u64,
}

#[async_trait]
pub trait RankingStore: DocumentSource {
    /// Matching ids ordered by rank descending, then id ascending.
    async fn rank(&self, root: &RootEntity, query: &RankQuery<'_>) -> Result<Vec<RankedId>>;

    /// Number of rows matching the same predicate as [`RankingStore::rank`].
    async fn count_matches(&self, root: &RootEntity, query: &RankQuery<'_>) -> Result<u64>;

    /// Unranked page ordered by id, with the table's total row count.
    async fn page_all(&self, root: &RootEntity, skip: u64, limit: u64) -> Result<(Vec<i64>, u64)>;
}
