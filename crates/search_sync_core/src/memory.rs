//! In-memory adapters for every port, used by unit tests and local runs.
//!
//! [`MemoryStore`] models the relational side: tables of JSON rows, the
//! outbox ledger, and reindex signals that are only delivered when a
//! [`MemoryTx`] commits. [`MemorySearchEngine`] stands in for the external
//! search engine and can be made unavailable or slow.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::SyncError;
use crate::ports::{
    DocumentSource, OutboxStore, RankQuery, RankingStore, ReindexStore, Result, SearchEngine,
    SyncTransaction,
};
use crate::schema::{Link, RankingStrategy, Relation, RelationHop, RootEntity};
use crate::trigram;
use crate::types::{
    ContentWrite, EngineSearchResult, NewOutboxEntry, OutboxEntry, RankedId, StaleRow,
};

type Row = Map<String, Value>;
type Table = BTreeMap<i64, Row>;

/// Failure points that tests can switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    AppendOutbox,
    FollowHop,
    ClearContent,
    WriteContent,
}

fn injected(fault: Fault) -> SyncError {
    SyncError::Internal(anyhow!("injected fault: {fault:?}"))
}

fn row_id(row: &Value) -> Result<i64> {
    row.get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| SyncError::InvalidInput("row has no integer 'id'".into()))
}

fn column_i64(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

// ── Relational state ─────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: OutboxEntry,
    claim: Option<(String, Instant)>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, Table>,
    outbox: BTreeMap<i64, StoredEntry>,
}

impl MemoryState {
    fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    fn apply(&mut self, op: &TxOp) {
        match op {
            TxOp::PutRow { table, id, row } => {
                self.tables
                    .entry(table.clone())
                    .or_default()
                    .insert(*id, row.clone());
            }
            TxOp::DeleteRow { table, id } => {
                if let Some(rows) = self.tables.get_mut(table) {
                    rows.remove(id);
                }
            }
            TxOp::AppendOutbox(entry) => {
                self.outbox.insert(
                    entry.id,
                    StoredEntry {
                        entry: entry.clone(),
                        claim: None,
                    },
                );
            }
            TxOp::ClearContent { table, ids } => {
                self.clear_content(table, ids);
            }
            TxOp::Signal => {}
        }
    }

    fn clear_content(&mut self, table: &str, ids: &[i64]) -> u64 {
        let Some(rows) = self.tables.get_mut(table) else {
            return 0;
        };
        let mut cleared = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                let generation = column_i64(row, "search_generation").unwrap_or(0) + 1;
                row.insert("search_content".into(), Value::Null);
                row.insert("search_generation".into(), Value::from(generation));
                cleared += 1;
            }
        }
        cleared
    }

    /// Ids of `hop` targets reachable from the given rows of `from_table`.
    fn follow(&self, from_table: &str, hop: &RelationHop, ids: &[i64]) -> Vec<i64> {
        let wanted: HashSet<i64> = ids.iter().copied().collect();
        let mut reached: Vec<i64> = match &hop.link {
            Link::ForeignKey { column } => self
                .table(hop.table_name())
                .map(|rows| {
                    rows.iter()
                        .filter(|(_, row)| {
                            column_i64(row, column).is_some_and(|v| wanted.contains(&v))
                        })
                        .map(|(id, _)| *id)
                        .collect()
                })
                .unwrap_or_default(),
            Link::Reference { column } => self
                .table(from_table)
                .map(|rows| {
                    ids.iter()
                        .filter_map(|id| rows.get(id))
                        .filter_map(|row| column_i64(row, column))
                        .collect()
                })
                .unwrap_or_default(),
            Link::Through {
                table,
                source_column,
                target_column,
            } => self
                .table(table)
                .map(|rows| {
                    rows.values()
                        .filter(|row| {
                            column_i64(row, source_column).is_some_and(|v| wanted.contains(&v))
                        })
                        .filter_map(|row| column_i64(row, target_column))
                        .collect()
                })
                .unwrap_or_default(),
        };
        reached.sort_unstable();
        reached.dedup();
        reached
    }

    /// Row as a document, with `relations` loaded under their names.
    fn document(&self, table: &str, id: i64, relations: &[Relation]) -> Option<Value> {
        let row = self.table(table)?.get(&id)?;
        let mut doc = row.clone();
        doc.remove("search_content");
        doc.remove("search_vector");
        doc.remove("search_generation");
        for relation in relations {
            let hop = RelationHop {
                target: relation.table.clone(),
                table: Some(relation.table.clone()),
                link: relation.link.clone(),
            };
            let related: Vec<Value> = self
                .follow(table, &hop, &[id])
                .into_iter()
                .filter_map(|rid| self.document(&relation.table, rid, &relation.relations))
                .collect();
            let value = if relation.link.is_many() {
                Value::Array(related)
            } else {
                related.into_iter().next().unwrap_or(Value::Null)
            };
            doc.insert(relation.name.clone(), value);
        }
        Some(Value::Object(doc))
    }

    fn content(&self, table: &str) -> impl Iterator<Item = (i64, &str)> {
        self.table(table)
            .into_iter()
            .flat_map(|rows| rows.iter())
            .filter_map(|(id, row)| {
                row.get("search_content")
                    .and_then(Value::as_str)
                    .map(|content| (*id, content))
            })
    }
}

#[derive(Debug, Clone)]
enum TxOp {
    PutRow { table: String, id: i64, row: Row },
    DeleteRow { table: String, id: i64 },
    AppendOutbox(OutboxEntry),
    ClearContent { table: String, ids: Vec<i64> },
    Signal,
}

// ── MemoryStore ──────────────────────────────────────────────

/// In-memory relational store implementing every relational port.
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
    faults: RwLock<HashSet<Fault>>,
    outbox_seq: AtomicI64,
    signals_delivered: AtomicU64,
    signals: broadcast::Sender<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(MemoryState::default()),
            faults: RwLock::new(HashSet::new()),
            outbox_seq: AtomicI64::new(0),
            signals_delivered: AtomicU64::new(0),
            signals,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.inner
            .read()
            .map_err(|e| SyncError::Internal(anyhow!("Lock: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.inner
            .write()
            .map_err(|e| SyncError::Internal(anyhow!("Lock: {}", e)))
    }

    fn check(&self, fault: Fault) -> Result<()> {
        let faults = self
            .faults
            .read()
            .map_err(|e| SyncError::Internal(anyhow!("Lock: {}", e)))?;
        if faults.contains(&fault) {
            Err(injected(fault))
        } else {
            Ok(())
        }
    }

    pub fn inject_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.write() {
            faults.insert(fault);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.write() {
            faults.clear();
        }
    }

    /// Open a transaction over a snapshot of the current state.
    pub fn begin(self: &Arc<Self>) -> Result<MemoryTx> {
        let working = self.read()?.clone();
        Ok(MemoryTx {
            store: Arc::clone(self),
            working,
            ops: Vec::new(),
            savepoints: Vec::new(),
            aborted: false,
        })
    }

    /// Committed write outside any transaction (fixtures).
    pub fn put_row(&self, table: &str, row: Value) -> Result<i64> {
        let id = row_id(&row)?;
        let Value::Object(row) = row else {
            return Err(SyncError::InvalidInput("row must be a JSON object".into()));
        };
        self.write()?.apply(&TxOp::PutRow {
            table: table.to_string(),
            id,
            row,
        });
        Ok(id)
    }

    pub fn row(&self, table: &str, id: i64) -> Option<Value> {
        let state = self.read().ok()?;
        let row = state.table(table)?.get(&id)?;
        Some(Value::Object(row.clone()))
    }

    /// `None` when the row is missing or its content is NULL.
    pub fn search_content(&self, table: &str, id: i64) -> Option<String> {
        self.row(table, id)?
            .get("search_content")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.read()
            .map(|state| state.outbox.values().map(|s| s.entry.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of reindex signals delivered by committed transactions.
    pub fn signals_delivered(&self) -> u64 {
        self.signals_delivered.load(Ordering::SeqCst)
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<()> {
        self.signals.subscribe()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ── MemoryTx ─────────────────────────────────────────────────

/// A buffered transaction: reads see its own writes, nothing is visible to
/// the store until [`MemoryTx::commit`]. Dropping it rolls back.
///
/// Like a Postgres transaction, a failed statement aborts it: every later
/// statement fails until a savepoint is rolled back to, and committing an
/// aborted transaction rolls it back instead.
pub struct MemoryTx {
    store: Arc<MemoryStore>,
    working: MemoryState,
    ops: Vec<TxOp>,
    savepoints: Vec<(String, usize, MemoryState)>,
    aborted: bool,
}

impl MemoryTx {
    fn push(&mut self, op: TxOp) {
        self.working.apply(&op);
        self.ops.push(op);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.aborted {
            return Err(SyncError::Internal(anyhow!(
                "current transaction is aborted, commands ignored until end of transaction block"
            )));
        }
        Ok(())
    }

    /// Run a statement that `fault` can fail; failure aborts the transaction.
    fn statement(&mut self, fault: Fault) -> Result<()> {
        self.ensure_open()?;
        if let Err(e) = self.store.check(fault) {
            self.aborted = true;
            return Err(e);
        }
        Ok(())
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Insert or replace an entity row (the service layer's own write).
    pub fn put_row(&mut self, table: &str, row: Value) -> Result<i64> {
        self.ensure_open()?;
        let id = row_id(&row)?;
        let Value::Object(row) = row else {
            return Err(SyncError::InvalidInput("row must be a JSON object".into()));
        };
        self.push(TxOp::PutRow {
            table: table.to_string(),
            id,
            row,
        });
        Ok(id)
    }

    pub fn delete_row(&mut self, table: &str, id: i64) {
        self.push(TxOp::DeleteRow {
            table: table.to_string(),
            id,
        });
    }

    /// Apply every buffered write and deliver queued signals.
    ///
    /// An aborted transaction is rolled back and reported as an error.
    pub fn commit(self) -> Result<()> {
        if self.aborted {
            return Err(SyncError::Internal(anyhow!(
                "transaction was aborted by an earlier error; rolled back"
            )));
        }
        let mut signals = 0u64;
        {
            let mut state = self.store.write()?;
            for op in &self.ops {
                state.apply(op);
                if matches!(op, TxOp::Signal) {
                    signals += 1;
                }
            }
        }
        if signals > 0 {
            self.store
                .signals_delivered
                .fetch_add(signals, Ordering::SeqCst);
            // No receivers is fine: nobody is listening yet.
            let _ = self.store.signals.send(());
        }
        Ok(())
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl SyncTransaction for MemoryTx {
    async fn append_outbox(&mut self, entry: &NewOutboxEntry) -> Result<i64> {
        self.statement(Fault::AppendOutbox)?;
        let id = self.store.outbox_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.push(TxOp::AppendOutbox(OutboxEntry {
            id,
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id,
            operation: entry.operation,
            payload: entry.payload.clone(),
            processed: false,
            created_at: Utc::now(),
            processed_at: None,
            error_message: None,
            retry_count: 0,
        }));
        Ok(id)
    }

    async fn follow_hop(
        &mut self,
        from_table: &str,
        hop: &RelationHop,
        ids: &[i64],
    ) -> Result<Vec<i64>> {
        self.statement(Fault::FollowHop)?;
        Ok(self.working.follow(from_table, hop, ids))
    }

    async fn clear_search_content(&mut self, root: &RootEntity, ids: &[i64]) -> Result<u64> {
        self.statement(Fault::ClearContent)?;
        let table = root.table_name().to_string();
        let cleared = self
            .working
            .table(&table)
            .map(|rows| ids.iter().filter(|id| rows.contains_key(id)).count() as u64)
            .unwrap_or(0);
        self.push(TxOp::ClearContent {
            table,
            ids: ids.to_vec(),
        });
        Ok(cleared)
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.savepoints
            .push((name.to_string(), self.ops.len(), self.working.clone()));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _, _)| n == name)
            .ok_or_else(|| SyncError::NotFound(format!("savepoint '{name}'")))?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _, _)| n == name)
            .ok_or_else(|| SyncError::NotFound(format!("savepoint '{name}'")))?;
        let (_, len, snapshot) = self.savepoints[pos].clone();
        self.ops.truncate(len);
        self.working = snapshot;
        self.savepoints.truncate(pos + 1);
        self.aborted = false;
        Ok(())
    }

    async fn queue_reindex_signal(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.push(TxOp::Signal);
        Ok(())
    }
}

// ── Dispatcher / reindex / ranking ports ─────────────────────

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_batch(
        &self,
        claimer: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        let now = Instant::now();
        let mut state = self.write()?;
        let mut blocked: HashSet<(String, i64)> = HashSet::new();
        let mut claimed = Vec::new();

        for stored in state.outbox.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if stored.entry.processed {
                continue;
            }
            let key = (stored.entry.entity_type.clone(), stored.entry.entity_id);
            let held_elsewhere = matches!(
                &stored.claim,
                Some((owner, expires)) if owner != claimer && *expires > now
            );
            if held_elsewhere || blocked.contains(&key) {
                blocked.insert(key);
                continue;
            }
            stored.claim = Some((claimer.to_string(), now + lease));
            claimed.push(stored.entry.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let mut state = self.write()?;
        let stored = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("outbox entry {id}")))?;
        stored.entry.processed = true;
        stored.entry.processed_at = Some(Utc::now());
        stored.entry.error_message = None;
        stored.claim = None;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut state = self.write()?;
        let stored = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("outbox entry {id}")))?;
        stored.entry.processed = true;
        stored.entry.processed_at = Some(Utc::now());
        stored.entry.error_message = Some(error.to_string());
        stored.entry.retry_count += 1;
        stored.claim = None;
        Ok(())
    }

    async fn requeue_failed(&self, max_retries: i32) -> Result<u64> {
        let mut state = self.write()?;
        let mut latest: HashMap<(String, i64), i64> = HashMap::new();
        for stored in state.outbox.values() {
            let key = (stored.entry.entity_type.clone(), stored.entry.entity_id);
            latest.insert(key, stored.entry.id);
        }

        let mut requeued = 0;
        for stored in state.outbox.values_mut() {
            let entry = &mut stored.entry;
            // A later entry for the same entity supersedes a failed one.
            let superseded = latest
                .get(&(entry.entity_type.clone(), entry.entity_id))
                .is_some_and(|last| *last > entry.id);
            if entry.processed
                && entry.error_message.is_some()
                && entry.retry_count < max_retries
                && !superseded
            {
                entry.processed = false;
                entry.processed_at = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn pending_count(&self) -> Result<u64> {
        let state = self.read()?;
        Ok(state.outbox.values().filter(|s| !s.entry.processed).count() as u64)
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEntry>> {
        Ok(self.read()?.outbox.get(&id).map(|s| s.entry.clone()))
    }
}

#[async_trait]
impl DocumentSource for MemoryStore {
    async fn load_documents(&self, root: &RootEntity, ids: &[i64]) -> Result<Vec<(i64, Value)>> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .document(root.table_name(), *id, &root.relations)
                    .map(|doc| (*id, doc))
            })
            .collect())
    }
}

#[async_trait]
impl ReindexStore for MemoryStore {
    async fn stale_ids(
        &self,
        root: &RootEntity,
        limit: usize,
        exclude: &[i64],
    ) -> Result<Vec<StaleRow>> {
        let state = self.read()?;
        let Some(rows) = state.table(root.table_name()) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|(id, row)| {
                !exclude.contains(*id)
                    && row.get("search_content").map_or(true, Value::is_null)
            })
            .map(|(id, row)| StaleRow {
                id: *id,
                generation: column_i64(row, "search_generation").unwrap_or(0),
            })
            .take(limit)
            .collect())
    }

    async fn write_search_content(&self, root: &RootEntity, rows: &[ContentWrite]) -> Result<u64> {
        self.check(Fault::WriteContent)?;
        let mut state = self.write()?;
        let Some(table) = state.tables.get_mut(root.table_name()) else {
            return Ok(0);
        };
        let mut written = 0;
        for write in rows {
            let Some(row) = table.get_mut(&write.id) else {
                continue;
            };
            if column_i64(row, "search_generation").unwrap_or(0) != write.generation {
                continue;
            }
            row.insert("search_content".into(), Value::String(write.content.clone()));
            written += 1;
        }
        Ok(written)
    }

    async fn clear_all(&self, root: &RootEntity) -> Result<u64> {
        let mut state = self.write()?;
        let ids: Vec<i64> = state
            .table(root.table_name())
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default();
        Ok(state.clear_content(root.table_name(), &ids))
    }
}

/// Rank of `content` for `query`, or `None` when the row does not match.
fn score(strategy: RankingStrategy, query: &RankQuery<'_>, content: &str) -> Option<f64> {
    match strategy {
        RankingStrategy::Trigram => {
            let rank = trigram::word_similarity(query.text, content);
            (rank >= query.threshold).then_some(rank)
        }
        RankingStrategy::FullText => {
            let lexemes: Vec<String> = content
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .map(str::to_lowercase)
                .collect();
            let terms: Vec<String> = query
                .text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .map(str::to_lowercase)
                .collect();
            if lexemes.is_empty() || terms.is_empty() {
                return None;
            }
            let mut hits = 0usize;
            for term in &terms {
                let n = lexemes.iter().filter(|l| *l == term).count();
                if n == 0 {
                    return None;
                }
                hits += n;
            }
            Some(hits as f64 / lexemes.len() as f64)
        }
    }
}

impl MemoryStore {
    fn matches(&self, root: &RootEntity, query: &RankQuery<'_>) -> Result<Vec<RankedId>> {
        let state = self.read()?;
        let mut ranked: Vec<RankedId> = state
            .content(root.table_name())
            .filter_map(|(id, content)| {
                score(root.strategy, query, content).map(|rank| RankedId { id, rank })
            })
            .collect();
        ranked.sort_by(|a, b| b.rank.total_cmp(&a.rank).then(a.id.cmp(&b.id)));
        Ok(ranked)
    }
}

#[async_trait]
impl RankingStore for MemoryStore {
    async fn rank(&self, root: &RootEntity, query: &RankQuery<'_>) -> Result<Vec<RankedId>> {
        Ok(self
            .matches(root, query)?
            .into_iter()
            .skip(query.skip as usize)
            .take(query.limit as usize)
            .collect())
    }

    async fn count_matches(&self, root: &RootEntity, query: &RankQuery<'_>) -> Result<u64> {
        Ok(self.matches(root, query)?.len() as u64)
    }

    async fn page_all(&self, root: &RootEntity, skip: u64, limit: u64) -> Result<(Vec<i64>, u64)> {
        let state = self.read()?;
        let Some(rows) = state.table(root.table_name()) else {
            return Ok((Vec::new(), 0));
        };
        let ids = rows
            .keys()
            .copied()
            .skip(skip as usize)
            .take(limit as usize)
            .collect();
        Ok((ids, rows.len() as u64))
    }
}

// ── MemorySearchEngine ───────────────────────────────────────

#[derive(Debug, Default)]
struct EngineState {
    indexes: HashMap<String, BTreeMap<i64, Value>>,
    searchable: HashMap<String, Vec<String>>,
}

/// Search-engine double with add-or-replace semantics.
pub struct MemorySearchEngine {
    inner: RwLock<EngineState>,
    unavailable: RwLock<bool>,
    latency: RwLock<Duration>,
    calls: AtomicU64,
}

impl MemorySearchEngine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(EngineState::default()),
            unavailable: RwLock::new(false),
            latency: RwLock::new(Duration::ZERO),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.write() {
            *flag = unavailable;
        }
    }

    /// Delay applied to every call before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut value) = self.latency.write() {
            *value = latency;
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn document(&self, index: &str, id: i64) -> Option<Value> {
        let state = self.inner.read().ok()?;
        state.indexes.get(index)?.get(&id).cloned()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.inner
            .read()
            .map(|s| s.indexes.get(index).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn searchable_attributes(&self, index: &str) -> Option<Vec<String>> {
        self.inner.read().ok()?.searchable.get(index).cloned()
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency.read().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let unavailable = self.unavailable.read().map(|u| *u).unwrap_or(false);
        if unavailable {
            return Err(SyncError::Engine("search engine unavailable".into()));
        }
        Ok(())
    }

    fn state(&self) -> Result<RwLockWriteGuard<'_, EngineState>> {
        self.inner
            .write()
            .map_err(|e| SyncError::Internal(anyhow!("Lock: {}", e)))
    }
}

impl Default for MemorySearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn leaf_text(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => map.values().for_each(|v| leaf_text(v, out)),
        Value::Array(items) => items.iter().for_each(|v| leaf_text(v, out)),
        Value::String(s) => {
            out.push(' ');
            out.push_str(&s.to_lowercase());
        }
        Value::Number(n) => {
            out.push(' ');
            out.push_str(&n.to_string());
        }
        Value::Bool(_) | Value::Null => {}
    }
}

#[async_trait]
impl SearchEngine for MemorySearchEngine {
    async fn upsert_documents(&self, index: &str, documents: &[Value]) -> Result<()> {
        self.enter().await?;
        let mut keyed = Vec::with_capacity(documents.len());
        for doc in documents {
            let id = doc
                .get("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| SyncError::Engine("document has no primary key 'id'".into()))?;
            keyed.push((id, doc.clone()));
        }
        self.state()?
            .indexes
            .entry(index.to_string())
            .or_default()
            .extend(keyed);
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: i64) -> Result<()> {
        self.enter().await?;
        if let Some(docs) = self.state()?.indexes.get_mut(index) {
            docs.remove(&id);
        }
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        query: &str,
        offset: u64,
        limit: u64,
    ) -> Result<EngineSearchResult> {
        self.enter().await?;
        let state = self.state()?;
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let matching: Vec<&Value> = state
            .indexes
            .get(index)
            .map(|docs| {
                docs.values()
                    .filter(|doc| {
                        let mut text = String::new();
                        leaf_text(doc, &mut text);
                        terms.iter().all(|t| text.contains(t.as_str()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(EngineSearchResult {
            estimated_total: matching.len() as u64,
            hits: matching
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect(),
        })
    }

    async fn ensure_index(
        &self,
        index: &str,
        _primary_key: &str,
        searchable_attributes: &[String],
    ) -> Result<()> {
        self.enter().await?;
        let mut state = self.state()?;
        state.indexes.entry(index.to_string()).or_default();
        state
            .searchable
            .insert(index.to_string(), searchable_attributes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_root() -> RootEntity {
        RootEntity::new("item").with_relation(Relation {
            name: "drink".into(),
            table: "drink".into(),
            link: Link::Reference {
                column: "drink_id".into(),
            },
            relations: vec![Relation {
                name: "foods".into(),
                table: "food".into(),
                link: Link::Through {
                    table: "drink_food".into(),
                    source_column: "drink_id".into(),
                    target_column: "food_id".into(),
                },
                relations: vec![],
            }],
        })
    }

    #[tokio::test]
    async fn documents_load_nested_relations() {
        let store = MemoryStore::new();
        store.put_row("drink", json!({"id": 10, "title": "Barolo"})).unwrap();
        store.put_row("food", json!({"id": 1, "name": "Truffle"})).unwrap();
        store.put_row("drink_food", json!({"id": 1, "drink_id": 10, "food_id": 1})).unwrap();
        store
            .put_row("item", json!({"id": 5, "drink_id": 10, "search_content": "old"}))
            .unwrap();

        let docs = store.load_documents(&item_root(), &[5, 6]).await.unwrap();
        assert_eq!(docs.len(), 1);
        let (id, doc) = &docs[0];
        assert_eq!(*id, 5);
        assert_eq!(doc["drink"]["title"], "Barolo");
        assert_eq!(doc["drink"]["foods"][0]["name"], "Truffle");
        assert!(doc.get("search_content").is_none());
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = Arc::new(MemoryStore::new());
        let mut tx = store.begin().unwrap();
        tx.put_row("item", json!({"id": 1})).unwrap();
        tx.append_outbox(&NewOutboxEntry::delete("item", 1)).await.unwrap();
        tx.queue_reindex_signal().await.unwrap();
        tx.rollback();

        assert!(store.row("item", 1).is_none());
        assert!(store.outbox_entries().is_empty());
        assert_eq!(store.signals_delivered(), 0);
    }

    #[tokio::test]
    async fn rollback_to_savepoint_discards_later_writes() {
        let store = Arc::new(MemoryStore::new());
        store.put_row("item", json!({"id": 1, "search_content": "kept"})).unwrap();

        let mut tx = store.begin().unwrap();
        tx.put_row("item", json!({"id": 2})).unwrap();
        tx.savepoint("sp").await.unwrap();
        tx.clear_search_content(&RootEntity::new("item"), &[1]).await.unwrap();
        tx.queue_reindex_signal().await.unwrap();
        tx.rollback_to_savepoint("sp").await.unwrap();
        tx.commit().unwrap();

        assert!(store.row("item", 2).is_some());
        assert_eq!(store.search_content("item", 1).as_deref(), Some("kept"));
        assert_eq!(store.signals_delivered(), 0);
    }

    #[tokio::test]
    async fn failed_statement_aborts_until_savepoint_rollback() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(Fault::FollowHop);
        let hop = RelationHop::new("item", Link::ForeignKey { column: "drink_id".into() });

        let mut tx = store.begin().unwrap();
        tx.put_row("drink", json!({"id": 1})).unwrap();
        tx.savepoint("sp").await.unwrap();
        assert!(tx.follow_hop("drink", &hop, &[1]).await.is_err());
        assert!(tx.is_aborted());
        assert!(tx.queue_reindex_signal().await.is_err());
        assert!(tx.put_row("drink", json!({"id": 2})).is_err());

        tx.rollback_to_savepoint("sp").await.unwrap();
        assert!(!tx.is_aborted());
        tx.commit().unwrap();
        assert!(store.row("drink", 1).is_some());
    }

    #[tokio::test]
    async fn committing_an_aborted_transaction_rolls_it_back() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(Fault::ClearContent);

        let mut tx = store.begin().unwrap();
        tx.put_row("item", json!({"id": 1})).unwrap();
        assert!(tx.clear_search_content(&RootEntity::new("item"), &[1]).await.is_err());
        assert!(tx.commit().is_err());
        assert!(store.row("item", 1).is_none());
    }

    #[tokio::test]
    async fn content_write_is_dropped_once_the_row_is_invalidated_again() {
        let store = Arc::new(MemoryStore::new());
        let root = RootEntity::new("item");
        store.put_row("item", json!({"id": 1})).unwrap();
        store.put_row("item", json!({"id": 2})).unwrap();

        let stale = store.stale_ids(&root, 10, &[]).await.unwrap();
        assert_eq!(stale, vec![StaleRow { id: 1, generation: 0 }, StaleRow { id: 2, generation: 0 }]);

        let mut tx = store.begin().unwrap();
        tx.clear_search_content(&root, &[1]).await.unwrap();
        tx.commit().unwrap();

        let writes: Vec<ContentWrite> = stale
            .iter()
            .map(|row| ContentWrite {
                id: row.id,
                generation: row.generation,
                content: "built earlier".into(),
            })
            .collect();
        assert_eq!(store.write_search_content(&root, &writes).await.unwrap(), 1);
        assert!(store.search_content("item", 1).is_none());
        assert_eq!(store.search_content("item", 2).as_deref(), Some("built earlier"));
        assert_eq!(
            store.stale_ids(&root, 10, &[]).await.unwrap(),
            vec![StaleRow { id: 1, generation: 1 }]
        );
    }

    #[tokio::test]
    async fn claims_respect_other_claimers_and_entity_order() {
        let store = Arc::new(MemoryStore::new());
        let mut tx = store.begin().unwrap();
        tx.append_outbox(&NewOutboxEntry::delete("item", 1)).await.unwrap();
        tx.append_outbox(&NewOutboxEntry::delete("item", 2)).await.unwrap();
        tx.append_outbox(&NewOutboxEntry::delete("item", 1)).await.unwrap();
        tx.commit().unwrap();

        let lease = Duration::from_secs(30);
        let first = store.claim_batch("a", 1, lease).await.unwrap();
        assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1]);

        // Entry 3 is item#1 again, blocked behind a's claim on entry 1.
        let second = store.claim_batch("b", 10, lease).await.unwrap();
        assert_eq!(second.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn failed_entries_requeue_until_retry_limit() {
        let store = Arc::new(MemoryStore::new());
        let mut tx = store.begin().unwrap();
        let id = tx.append_outbox(&NewOutboxEntry::delete("item", 1)).await.unwrap();
        tx.commit().unwrap();

        store.mark_failed(id, "boom").await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(store.requeue_failed(2).await.unwrap(), 1);
        assert_eq!(store.pending_count().await.unwrap(), 1);

        store.mark_failed(id, "boom again").await.unwrap();
        assert_eq!(store.requeue_failed(2).await.unwrap(), 0);
        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.error_message.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn failed_entry_superseded_by_a_later_one_stays_put() {
        let store = Arc::new(MemoryStore::new());
        let mut tx = store.begin().unwrap();
        let insert = tx
            .append_outbox(&NewOutboxEntry::insert("item", 1, json!({"id": 1})))
            .await
            .unwrap();
        let delete = tx.append_outbox(&NewOutboxEntry::delete("item", 1)).await.unwrap();
        let other = tx.append_outbox(&NewOutboxEntry::delete("item", 2)).await.unwrap();
        tx.commit().unwrap();

        store.mark_failed(insert, "engine down").await.unwrap();
        store.mark_processed(delete).await.unwrap();
        store.mark_failed(other, "engine down").await.unwrap();

        assert_eq!(store.requeue_failed(3).await.unwrap(), 1);
        assert!(store.get(insert).await.unwrap().unwrap().processed);
        assert!(!store.get(other).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn engine_upsert_replaces_and_delete_is_idempotent() {
        let engine = MemorySearchEngine::new();
        engine
            .upsert_documents("item", &[json!({"id": 1, "name": "Shiraz"})])
            .await
            .unwrap();
        engine
            .upsert_documents("item", &[json!({"id": 1, "name": "Syrah"})])
            .await
            .unwrap();
        assert_eq!(engine.document_count("item"), 1);
        assert_eq!(engine.document("item", 1).unwrap()["name"], "Syrah");

        let found = engine.search("item", "syrah", 0, 10).await.unwrap();
        assert_eq!(found.estimated_total, 1);

        engine.delete_document("item", 1).await.unwrap();
        engine.delete_document("item", 1).await.unwrap();
        assert!(engine.document("item", 1).is_none());

        engine.set_unavailable(true);
        assert!(matches!(
            engine.delete_document("item", 1).await,
            Err(SyncError::Engine(_))
        ));
    }
}
