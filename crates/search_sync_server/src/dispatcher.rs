//! OutboxDispatcher — background task that drains the search outbox into the
//! external search engine.
//!
//! Entries are claimed in id order and delivered one at a time, so writes to
//! the same entity reach the engine in commit order. A failed delivery is
//! recorded on the entry (processed, with an error message) and the batch
//! moves on; nothing is retried unless `retry_failed_max` is set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use search_sync_core::error::SyncError;
use search_sync_core::ports::{OutboxStore, Result, SearchEngine};
use search_sync_core::registry::SearchRegistry;
use search_sync_core::types::{OutboxEntry, OutboxOperation};

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 10_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CLAIM_LEASE_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    /// Sleep after a cycle that found nothing to do.
    pub poll_interval: Duration,
    /// Sleep after a cycle that failed against the outbox store.
    pub error_backoff: Duration,
    /// Upper bound for a single engine call.
    pub call_timeout: Duration,
    pub claimer_id: String,
    /// How long claimed entries stay invisible to other dispatchers.
    pub claim_lease: Duration,
    pub retry_failed_max: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            error_backoff: Duration::from_millis(DEFAULT_ERROR_BACKOFF_MS),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            claimer_id: "dispatcher-1".to_string(),
            claim_lease: Duration::from_millis(DEFAULT_CLAIM_LEASE_MS),
            retry_failed_max: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    engine: Arc<dyn SearchEngine>,
    registry: Arc<SearchRegistry>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        engine: Arc<dyn SearchEngine>,
        registry: Arc<SearchRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            outbox,
            engine,
            registry,
            config,
        }
    }

    /// Claim one batch and deliver it.
    ///
    /// Errors are outbox-store failures; the claimed entries that were not
    /// yet marked become claimable again when their lease runs out.
    pub async fn dispatch_batch(&self) -> Result<DispatchReport> {
        let entries = self
            .outbox
            .claim_batch(
                &self.config.claimer_id,
                self.config.batch_size,
                self.config.claim_lease,
            )
            .await?;

        let mut report = DispatchReport {
            claimed: entries.len(),
            ..DispatchReport::default()
        };

        for entry in &entries {
            match self.deliver(entry).await {
                Ok(()) => {
                    self.outbox.mark_processed(entry.id).await?;
                    report.delivered += 1;
                    tracing::debug!(
                        outbox_id = entry.id,
                        entity_type = %entry.entity_type,
                        entity_id = entry.entity_id,
                        operation = %entry.operation,
                        "Outbox entry delivered"
                    );
                }
                Err(e) => {
                    if e.is_delivery_failure() {
                        tracing::warn!(outbox_id = entry.id, error = %e, "Outbox delivery failed");
                    } else {
                        tracing::error!(outbox_id = entry.id, error = %e, "Outbox delivery failed");
                    }
                    self.outbox.mark_failed(entry.id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn deliver(&self, entry: &OutboxEntry) -> Result<()> {
        let root = self.registry.require_root(&entry.entity_type)?;
        let index = root.index_name();

        let call = async {
            match entry.operation {
                OutboxOperation::Insert | OutboxOperation::Update => {
                    let payload = entry.payload.as_ref().ok_or_else(|| {
                        SyncError::InvalidInput(format!(
                            "{} entry {} has no payload",
                            entry.operation, entry.id
                        ))
                    })?;
                    self.engine
                        .upsert_documents(index, std::slice::from_ref(payload))
                        .await
                }
                OutboxOperation::Delete => self.engine.delete_document(index, entry.entity_id).await,
            }
        };

        tokio::time::timeout(self.config.call_timeout, call)
            .await
            .map_err(|_| SyncError::Timeout(self.config.call_timeout))?
    }

    /// Put failed entries back in the queue while they have retries left.
    /// No-op when `retry_failed_max` is 0.
    pub async fn requeue_failed(&self) -> Result<u64> {
        if self.config.retry_failed_max <= 0 {
            return Ok(0);
        }
        let requeued = self
            .outbox
            .requeue_failed(self.config.retry_failed_max)
            .await?;
        if requeued > 0 {
            tracing::info!(requeued, "Failed outbox entries requeued");
        }
        Ok(requeued)
    }

    /// Run the dispatcher loop until the shutdown flag flips.
    /// Spawn it as a background task via `tokio::spawn`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "OutboxDispatcher started (poll interval={:?}, batch_size={}, claimer={})",
            self.config.poll_interval,
            self.config.batch_size,
            self.config.claimer_id
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.dispatch_batch().await {
                Ok(report) if report.claimed > 0 => {
                    tracing::info!(
                        claimed = report.claimed,
                        delivered = report.delivered,
                        failed = report.failed,
                        "Outbox batch dispatched"
                    );
                    // More may be waiting; go again straight away.
                    continue;
                }
                Ok(_) => match self.requeue_failed().await {
                    Ok(_) => self.config.poll_interval,
                    Err(e) => {
                        tracing::error!(error = %e, "Outbox requeue failed");
                        self.config.error_backoff
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "Outbox dispatch failed");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("OutboxDispatcher shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_sync_core::memory::{MemorySearchEngine, MemoryStore};
    use search_sync_core::{EntityChange, SearchSync};
    use serde_json::{json, Value};

    const REGISTRY_YAML: &str = r#"
roots:
  - entity_type: item
  - entity_type: drink
    index_name: drinks
"#;

    struct Harness {
        store: Arc<MemoryStore>,
        engine: Arc<MemorySearchEngine>,
        sync: SearchSync,
        dispatcher: OutboxDispatcher,
    }

    fn harness(config: DispatcherConfig) -> Harness {
        let registry = Arc::new(SearchRegistry::from_yaml_str(REGISTRY_YAML).unwrap());
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(MemorySearchEngine::new());
        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            engine.clone(),
            Arc::clone(&registry),
            config,
        );
        Harness {
            store,
            engine,
            sync: SearchSync::new(registry),
            dispatcher,
        }
    }

    impl Harness {
        async fn write(&self, change: EntityChange) -> i64 {
            let mut tx = self.store.begin().unwrap();
            if let Some(doc) = &change.document {
                tx.put_row(&change.entity_type, doc.clone()).unwrap();
            } else {
                tx.delete_row(&change.entity_type, change.entity_id);
            }
            let outcome = self.sync.record_change(&mut tx, change).await.unwrap();
            tx.commit().unwrap();
            outcome.outbox_id.unwrap()
        }
    }

    fn item(id: i64, title: &str) -> Value {
        json!({"id": id, "title": title})
    }

    #[tokio::test]
    async fn writes_reach_the_engine_in_commit_order() {
        let h = harness(DispatcherConfig::default());
        h.write(EntityChange::inserted("item", 1).with_document(item(1, "Sassicaia")))
            .await;
        h.write(EntityChange::updated("item", 1).with_document(item(1, "Sassicaia 2019")))
            .await;
        h.write(EntityChange::inserted("item", 2).with_document(item(2, "Latour")))
            .await;

        let report = h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(
            report,
            DispatchReport {
                claimed: 3,
                delivered: 3,
                failed: 0
            }
        );
        assert_eq!(h.engine.document("item", 1), Some(item(1, "Sassicaia 2019")));
        assert_eq!(h.engine.document_count("item"), 2);
        assert_eq!(h.store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_then_rerun_changes_nothing() {
        let h = harness(DispatcherConfig::default());
        h.write(EntityChange::inserted("item", 7).with_document(item(7, "Ornellaia")))
            .await;
        h.dispatcher.dispatch_batch().await.unwrap();
        h.write(EntityChange::deleted("item", 7)).await;

        let report = h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(h.engine.document("item", 7).is_none());

        let calls = h.engine.calls();
        let report = h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report, DispatchReport::default());
        assert_eq!(h.engine.calls(), calls);
        assert!(h.engine.document("item", 7).is_none());
    }

    #[tokio::test]
    async fn index_name_overrides_entity_type() {
        let h = harness(DispatcherConfig::default());
        h.write(EntityChange::inserted("drink", 3).with_document(json!({"id": 3, "title": "Barolo"})))
            .await;
        h.dispatcher.dispatch_batch().await.unwrap();
        assert!(h.engine.document("drinks", 3).is_some());
        assert_eq!(h.engine.document_count("drink"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_acknowledgement_is_redelivered_after_the_lease() {
        let h = harness(DispatcherConfig::default());
        let id = h
            .write(EntityChange::inserted("item", 1).with_document(item(1, "Sassicaia")))
            .await;

        // Another worker delivered but died before marking the entry.
        let claimed = h
            .store
            .claim_batch("crashed-worker", 10, Duration::from_secs(30))
            .await
            .unwrap();
        h.engine.upsert_documents("item", &[item(1, "Sassicaia")]).await.unwrap();
        assert_eq!(claimed[0].id, id);

        assert_eq!(h.dispatcher.dispatch_batch().await.unwrap().claimed, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(h.engine.document_count("item"), 1);
        assert_eq!(h.engine.document("item", 1), Some(item(1, "Sassicaia")));
        assert!(h.store.get(id).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn engine_failure_is_recorded_and_not_retried_by_default() {
        let h = harness(DispatcherConfig::default());
        let first = h
            .write(EntityChange::inserted("item", 1).with_document(item(1, "Sassicaia")))
            .await;
        h.write(EntityChange::inserted("item", 2).with_document(item(2, "Latour")))
            .await;
        h.engine.set_unavailable(true);

        let report = h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report.failed, 2);
        let entry = h.store.get(first).await.unwrap().unwrap();
        assert!(entry.processed);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(
            entry.error_message.as_deref(),
            Some("search engine: search engine unavailable")
        );

        h.engine.set_unavailable(false);
        assert_eq!(h.dispatcher.requeue_failed().await.unwrap(), 0);
        assert_eq!(h.dispatcher.dispatch_batch().await.unwrap().claimed, 0);
        assert_eq!(h.engine.document_count("item"), 0);
    }

    #[tokio::test]
    async fn failed_entries_are_requeued_while_retries_remain() {
        let h = harness(DispatcherConfig {
            retry_failed_max: 2,
            ..DispatcherConfig::default()
        });
        let id = h
            .write(EntityChange::inserted("item", 1).with_document(item(1, "Sassicaia")))
            .await;
        h.engine.set_unavailable(true);

        h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(h.dispatcher.requeue_failed().await.unwrap(), 1);
        h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(h.dispatcher.requeue_failed().await.unwrap(), 0);
        assert_eq!(h.store.get(id).await.unwrap().unwrap().retry_count, 2);

        // Out of retries: recovery of the engine does not bring it back.
        h.engine.set_unavailable(false);
        assert_eq!(h.dispatcher.dispatch_batch().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn failed_insert_is_not_replayed_over_a_later_delete() {
        let h = harness(DispatcherConfig {
            retry_failed_max: 3,
            ..DispatcherConfig::default()
        });
        let insert = h
            .write(EntityChange::inserted("item", 1).with_document(item(1, "Sassicaia")))
            .await;
        h.engine.set_unavailable(true);
        assert_eq!(h.dispatcher.dispatch_batch().await.unwrap().failed, 1);

        h.engine.set_unavailable(false);
        h.write(EntityChange::deleted("item", 1)).await;
        assert_eq!(h.dispatcher.dispatch_batch().await.unwrap().delivered, 1);

        assert_eq!(h.dispatcher.requeue_failed().await.unwrap(), 0);
        assert_eq!(h.dispatcher.dispatch_batch().await.unwrap().claimed, 0);
        assert!(h.engine.document("item", 1).is_none());
        assert_eq!(h.store.get(insert).await.unwrap().unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_call_times_out() {
        let h = harness(DispatcherConfig {
            call_timeout: Duration::from_secs(1),
            ..DispatcherConfig::default()
        });
        let id = h
            .write(EntityChange::inserted("item", 1).with_document(item(1, "Sassicaia")))
            .await;
        h.engine.set_latency(Duration::from_secs(10));

        let report = h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report.failed, 1);
        let entry = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.error_message.as_deref(), Some("timed out after 1s"));
        assert_eq!(h.engine.document_count("item"), 0);
    }

    #[tokio::test]
    async fn unregistered_entity_type_is_marked_failed() {
        let h = harness(DispatcherConfig::default());
        let writer = SearchSync::new(Arc::new(
            SearchRegistry::from_yaml_str("roots:\n  - entity_type: item\n  - entity_type: wine\n")
                .unwrap(),
        ));
        let mut tx = h.store.begin().unwrap();
        let outcome = writer
            .record_change(
                &mut tx,
                EntityChange::inserted("wine", 5).with_document(json!({"id": 5})),
            )
            .await
            .unwrap();
        tx.commit().unwrap();

        let report = h.dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report.failed, 1);
        let entry = h.store.get(outcome.outbox_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(
            entry.error_message.as_deref(),
            Some("not found: root type 'wine'")
        );
        assert_eq!(h.engine.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_drains_then_stops_on_shutdown() {
        let h = harness(DispatcherConfig::default());
        h.write(EntityChange::inserted("item", 1).with_document(item(1, "Sassicaia")))
            .await;
        let Harness {
            engine, dispatcher, ..
        } = h;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.document_count("item"), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}
