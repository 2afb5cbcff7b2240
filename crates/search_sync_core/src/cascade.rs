//! SearchSync — what the service layer calls at the end of every write.
//!
//! Root writes append an outbox entry in the caller's transaction (a failed
//! append fails the write). Writes to a registered dependent walk its path to
//! the owning root rows and clear their `search_content`. That part is
//! best-effort: traversal and clearing both run inside a savepoint, so a
//! failing statement never aborts the primary mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::SyncError;
use crate::ports::{Result, SyncTransaction};
use crate::registry::{SearchRegistry, MAX_PATH_DEPTH};
use crate::schema::{DependencyPath, RootEntity};
use crate::types::{ChangeKind, ChangeOutcome, EntityChange, NewOutboxEntry};

const CASCADE_SAVEPOINT: &str = "search_sync_cascade";

pub struct SearchSync {
    registry: Arc<SearchRegistry>,
}

impl SearchSync {
    pub fn new(registry: Arc<SearchRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SearchRegistry> {
        &self.registry
    }

    /// Record one entity write inside the caller's transaction.
    ///
    /// Errors returned here are ledger-append failures; the caller must roll
    /// back. Invalidation failures are logged and swallowed.
    pub async fn record_change<T>(&self, tx: &mut T, change: EntityChange) -> Result<ChangeOutcome>
    where
        T: SyncTransaction + ?Sized,
    {
        let mut outcome = ChangeOutcome::default();

        if let Some(root) = self.registry.root(&change.entity_type) {
            let entry = self.outbox_entry(&change)?;
            let outbox_id = tx.append_outbox(&entry).await?;
            outcome.outbox_id = Some(outbox_id);
            tracing::debug!(
                entity_type = %change.entity_type,
                entity_id = change.entity_id,
                operation = %entry.operation,
                outbox_id,
                "Outbox entry appended"
            );

            if change.kind != ChangeKind::Delete {
                let target = Invalidation::Own {
                    root_type: &root.entity_type,
                    id: change.entity_id,
                };
                self.invalidate_best_effort(tx, target, &mut outcome).await;
            }
            return Ok(outcome);
        }

        // Leaves without a registered path: silent no-op.
        let Some(path) = self.registry.resolve(&change.entity_type) else {
            return Ok(outcome);
        };
        let target = Invalidation::Dependents {
            path,
            entity_id: change.entity_id,
        };
        self.invalidate_best_effort(tx, target, &mut outcome).await;
        Ok(outcome)
    }

    /// Explicitly clear `search_content` for root rows and queue a reindex.
    pub async fn invalidate<T>(&self, tx: &mut T, root_type: &str, ids: &[i64]) -> Result<u64>
    where
        T: SyncTransaction + ?Sized,
    {
        let root = self.registry.require_root(root_type)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let cleared = tx.clear_search_content(root, ids).await?;
        tx.queue_reindex_signal().await?;
        tracing::debug!(root = %root_type, cleared, "Search content invalidated");
        Ok(cleared)
    }

    fn outbox_entry(&self, change: &EntityChange) -> Result<NewOutboxEntry> {
        let entity_type = change.entity_type.as_str();
        match change.kind {
            ChangeKind::Delete => Ok(NewOutboxEntry::delete(entity_type, change.entity_id)),
            kind => {
                let document = change.document.clone().ok_or_else(|| {
                    SyncError::InvalidInput(format!(
                        "{kind:?} of {entity_type}#{} carries no document",
                        change.entity_id
                    ))
                })?;
                self.registry
                    .validate_document(entity_type, change.entity_id, &document)?;
                Ok(match kind {
                    ChangeKind::Insert => {
                        NewOutboxEntry::insert(entity_type, change.entity_id, document)
                    }
                    _ => NewOutboxEntry::update(entity_type, change.entity_id, document),
                })
            }
        }
    }

    /// Traverse, clear and signal inside [`CASCADE_SAVEPOINT`]. Any failure,
    /// traversal included, rolls back to the savepoint and leaves the rest of
    /// the caller's transaction intact.
    async fn invalidate_best_effort<T>(
        &self,
        tx: &mut T,
        target: Invalidation<'_>,
        outcome: &mut ChangeOutcome,
    ) where
        T: SyncTransaction + ?Sized,
    {
        if let Err(e) = tx.savepoint(CASCADE_SAVEPOINT).await {
            tracing::warn!(error = %e, "Could not open invalidation savepoint");
            return;
        }

        match self.invalidate_in_savepoint(tx, &target).await {
            Ok(groups) => {
                if let Err(e) = tx.release_savepoint(CASCADE_SAVEPOINT).await {
                    tracing::warn!(error = %e, "Could not release invalidation savepoint");
                    return;
                }
                if groups.is_empty() {
                    return;
                }
                for (root_type, ids) in &groups {
                    tracing::debug!(root = %root_type, count = ids.len(), "Search content cleared");
                }
                outcome.invalidated.extend(groups);
                outcome.signal_queued = true;
            }
            Err(e) => {
                tracing::warn!(
                    change = %target,
                    error = %e,
                    "Invalidation failed; rolling back to savepoint"
                );
                if let Err(e) = tx.rollback_to_savepoint(CASCADE_SAVEPOINT).await {
                    tracing::error!(error = %e, "Rollback to invalidation savepoint failed");
                }
            }
        }
    }

    async fn invalidate_in_savepoint<T>(
        &self,
        tx: &mut T,
        target: &Invalidation<'_>,
    ) -> Result<BTreeMap<String, Vec<i64>>>
    where
        T: SyncTransaction + ?Sized,
    {
        let mut groups = BTreeMap::new();
        match target {
            Invalidation::Own { root_type, id } => {
                groups.insert(root_type.to_string(), vec![*id]);
            }
            Invalidation::Dependents { path, entity_id } => {
                let owners = collect_owners(tx, path, *entity_id).await?;
                if let (Some(root_type), false) = (path.root_type(), owners.is_empty()) {
                    groups.insert(root_type.to_string(), owners);
                }
            }
        }
        if groups.is_empty() {
            return Ok(groups);
        }

        for (root_type, ids) in &groups {
            let root: &RootEntity = self.registry.require_root(root_type)?;
            tx.clear_search_content(root, ids).await?;
        }
        tx.queue_reindex_signal().await?;
        Ok(groups)
    }
}

/// What a recorded change invalidates.
enum Invalidation<'a> {
    /// A root row's own content.
    Own { root_type: &'a str, id: i64 },
    /// Root rows reachable from a dependent row along its path.
    Dependents {
        path: &'a DependencyPath,
        entity_id: i64,
    },
}

impl fmt::Display for Invalidation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invalidation::Own { root_type, id } => write!(f, "{root_type}#{id}"),
            Invalidation::Dependents { path, entity_id } => {
                write!(f, "{} from #{entity_id}", path.describe())
            }
        }
    }
}

/// Ids of root rows transitively reachable from `entity_id` along `path`.
///
/// Each hop's frontier is de-duplicated, so fan-in through shared rows is
/// followed once; the registry guarantees the path itself is acyclic.
pub async fn collect_owners<T>(tx: &mut T, path: &DependencyPath, entity_id: i64) -> Result<Vec<i64>>
where
    T: SyncTransaction + ?Sized,
{
    if path.hops.len() > MAX_PATH_DEPTH {
        return Err(SyncError::InvalidInput(format!(
            "dependency path {} exceeds {MAX_PATH_DEPTH} hops",
            path.describe()
        )));
    }

    let mut frontier = BTreeSet::from([entity_id]);
    let mut from_table = path.table_name();
    for hop in &path.hops {
        if frontier.is_empty() {
            break;
        }
        let ids: Vec<i64> = frontier.iter().copied().collect();
        frontier = tx.follow_hop(from_table, hop, &ids).await?.into_iter().collect();
        from_table = hop.table_name();
    }
    Ok(frontier.into_iter().collect())
}
