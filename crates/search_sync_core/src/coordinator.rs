//! Reindex coordinator — single-flight, debounced recomputation of stale
//! `search_content`.
//!
//! A signal either becomes the pass runner or folds into the pass that is
//! already running. Signals arriving while a pass is debouncing are absorbed
//! by it; any number arriving while it is working cause exactly one more pass.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::content::SearchContentBuilder;
use crate::ports::{ReindexStore, Result};
use crate::registry::SearchRegistry;
use crate::schema::RootEntity;
use crate::types::ContentWrite;

#[derive(Debug, Clone)]
pub struct ReindexConfig {
    /// Quiet period before a pass starts.
    pub debounce: Duration,
    /// Rows recomputed and committed per batch.
    pub batch_size: usize,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootReport {
    pub indexed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub roots: BTreeMap<String, RootReport>,
}

impl PassReport {
    pub fn indexed(&self) -> u64 {
        self.roots.values().map(|r| r.indexed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.roots.values().map(|r| r.failed).sum()
    }

    fn merge(&mut self, other: PassReport) {
        for (root, report) in other.roots {
            let entry = self.roots.entry(root).or_default();
            entry.indexed += report.indexed;
            entry.failed += report.failed;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// This signal ran the pass(es).
    Completed { passes: u32, report: PassReport },
    /// A pass was already in flight and will pick this signal up.
    Coalesced,
}

pub struct ReindexCoordinator {
    store: Arc<dyn ReindexStore>,
    registry: Arc<SearchRegistry>,
    config: ReindexConfig,
    running: Mutex<()>,
    pending: AtomicBool,
    passes: AtomicU64,
}

impl ReindexCoordinator {
    pub fn new(
        store: Arc<dyn ReindexStore>,
        registry: Arc<SearchRegistry>,
        config: ReindexConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            running: Mutex::new(()),
            pending: AtomicBool::new(false),
            passes: AtomicU64::new(0),
        }
    }

    /// Passes run since construction.
    pub fn passes_run(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        if let Ok(guard) = self.running.try_lock() {
            return Some(guard);
        }
        self.pending.store(true, Ordering::SeqCst);
        // The runner checks `pending` only after releasing the lock, so a
        // second failure here means it will see the flag.
        self.running.try_lock().ok()
    }

    /// Request a reindex.
    pub async fn signal(&self) -> SignalOutcome {
        let Some(mut guard) = self.acquire() else {
            tracing::debug!("Reindex already in flight; signal coalesced");
            return SignalOutcome::Coalesced;
        };

        let mut passes = 0u32;
        let mut report = PassReport::default();
        loop {
            tokio::time::sleep(self.config.debounce).await;
            self.pending.store(false, Ordering::SeqCst);

            match self.run_pass().await {
                Ok(pass) => {
                    tracing::info!(
                        indexed = pass.indexed(),
                        failed = pass.failed(),
                        "Reindex pass complete"
                    );
                    report.merge(pass);
                }
                Err(e) => tracing::error!(error = %e, "Reindex pass failed"),
            }
            passes += 1;
            self.passes.fetch_add(1, Ordering::SeqCst);

            drop(guard);
            if !self.pending.load(Ordering::SeqCst) {
                break;
            }
            match self.running.try_lock() {
                Ok(next) => guard = next,
                // Someone else took the lock and owns the follow-up pass.
                Err(_) => break,
            }
        }

        SignalOutcome::Completed { passes, report }
    }

    /// Fire-and-forget [`signal`](Self::signal) for the write path.
    pub fn spawn_signal(self: &Arc<Self>) -> JoinHandle<SignalOutcome> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.signal().await })
    }

    /// Recompute every stale row of every root type, once.
    ///
    /// Rows that fail to load or build are logged, left NULL, and skipped
    /// for the rest of this pass.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        for root in self.registry.roots() {
            let stats = self.reindex_root(root).await?;
            report.roots.insert(root.entity_type.clone(), stats);
        }
        Ok(report)
    }

    async fn reindex_root(&self, root: &RootEntity) -> Result<RootReport> {
        let builder = SearchContentBuilder::for_root(root);
        let batch_size = self.config.batch_size.max(1);
        let mut failed: Vec<i64> = Vec::new();
        let mut stats = RootReport::default();

        loop {
            let stale = self.store.stale_ids(root, batch_size, &failed).await?;
            if stale.is_empty() {
                break;
            }
            let generations: HashMap<i64, i64> =
                stale.iter().map(|row| (row.id, row.generation)).collect();
            let ids: Vec<i64> = stale.iter().map(|row| row.id).collect();
            let documents = self.store.load_documents(root, &ids).await?;
            let loaded: HashSet<i64> = documents.iter().map(|(id, _)| *id).collect();

            let mut rows = Vec::with_capacity(documents.len());
            for (id, document) in documents {
                match builder.build(&document) {
                    Ok(content) => rows.push(ContentWrite {
                        id,
                        generation: generations.get(&id).copied().unwrap_or_default(),
                        content,
                    }),
                    Err(e) => {
                        tracing::warn!(root = %root.entity_type, id, error = %e, "Search content build failed");
                        failed.push(id);
                    }
                }
            }
            for id in ids.iter().filter(|id| !loaded.contains(*id)) {
                tracing::debug!(root = %root.entity_type, id, "Stale row vanished before load");
                failed.push(*id);
            }

            if !rows.is_empty() {
                let written = self.store.write_search_content(root, &rows).await?;
                if written < rows.len() as u64 {
                    // Overtaken rows are still NULL and come back in the next batch.
                    tracing::debug!(
                        root = %root.entity_type,
                        overtaken = rows.len() as u64 - written,
                        "Rows invalidated again while being rebuilt"
                    );
                }
                stats.indexed += written;
            }
        }

        stats.failed = failed.len() as u64;
        Ok(stats)
    }
}
