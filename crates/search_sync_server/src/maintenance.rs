//! One-shot maintenance operations: full reindex and engine index rebuild.

use search_sync_core::coordinator::{PassReport, ReindexCoordinator};
use search_sync_core::ports::{RankingStore, ReindexStore, Result, SearchEngine};
use search_sync_core::registry::SearchRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub uploaded: u64,
    /// Rows whose document failed validation and was left out of the index.
    pub skipped: u64,
}

/// Run one reindex pass now. With `all`, every root's content is cleared
/// first so the pass recomputes every row.
pub async fn reindex(
    store: &dyn ReindexStore,
    coordinator: &ReindexCoordinator,
    registry: &SearchRegistry,
    all: bool,
) -> Result<PassReport> {
    if all {
        for root in registry.roots() {
            let cleared = store.clear_all(root).await?;
            tracing::info!(root = %root.entity_type, cleared, "Search content cleared");
        }
    }
    coordinator.run_pass().await
}

/// Recreate the engine index for one root type from the database.
///
/// Ensures the index exists with the declared searchable attributes, then
/// upserts every row's document page by page.
pub async fn rebuild_index(
    source: &dyn RankingStore,
    engine: &dyn SearchEngine,
    registry: &SearchRegistry,
    root_type: &str,
    page_size: u64,
) -> Result<RebuildReport> {
    let root = registry.require_root(root_type)?;
    let index = root.index_name();
    let page_size = page_size.max(1);
    engine
        .ensure_index(index, "id", &root.searchable_attributes)
        .await?;

    let mut report = RebuildReport::default();
    let mut skip = 0u64;
    loop {
        let (ids, total) = source.page_all(root, skip, page_size).await?;
        if ids.is_empty() {
            break;
        }
        skip += ids.len() as u64;

        let mut documents = Vec::with_capacity(ids.len());
        for (id, document) in source.load_documents(root, &ids).await? {
            match registry.validate_document(root_type, id, &document) {
                Ok(()) => documents.push(document),
                Err(e) => {
                    tracing::warn!(root = root_type, id, error = %e, "Skipping invalid document");
                    report.skipped += 1;
                }
            }
        }
        engine.upsert_documents(index, &documents).await?;
        report.uploaded += documents.len() as u64;
        tracing::debug!(root = root_type, uploaded = report.uploaded, total, "Rebuild page uploaded");

        if skip >= total {
            break;
        }
    }

    tracing::info!(
        root = root_type,
        index,
        uploaded = report.uploaded,
        skipped = report.skipped,
        "Search index rebuilt"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use search_sync_core::memory::{MemorySearchEngine, MemoryStore};
    use search_sync_core::ReindexConfig;
    use serde_json::json;

    const REGISTRY_YAML: &str = r#"
roots:
  - entity_type: item
    searchable_attributes: [title]
    document_schema:
      type: object
      required: [id, title]
"#;

    fn registry() -> Arc<SearchRegistry> {
        Arc::new(SearchRegistry::from_yaml_str(REGISTRY_YAML).unwrap())
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (id, title) in [(1, "Sassicaia"), (2, "Latour"), (3, "Ornellaia")] {
            store
                .put_row("item", json!({"id": id, "title": title}))
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn rebuild_uploads_every_row_across_pages() {
        let store = seeded();
        let engine = MemorySearchEngine::new();

        let report = rebuild_index(store.as_ref(), &engine, &registry(), "item", 2)
            .await
            .unwrap();

        assert_eq!(report, RebuildReport { uploaded: 3, skipped: 0 });
        assert_eq!(engine.document_count("item"), 3);
        assert_eq!(
            engine.searchable_attributes("item"),
            Some(vec!["title".to_string()])
        );
    }

    #[tokio::test]
    async fn rebuild_skips_documents_failing_the_schema() {
        let store = seeded();
        store.put_row("item", json!({"id": 4})).unwrap();
        let engine = MemorySearchEngine::new();

        let report = rebuild_index(store.as_ref(), &engine, &registry(), "item", 10)
            .await
            .unwrap();

        assert_eq!(report, RebuildReport { uploaded: 3, skipped: 1 });
        assert!(engine.document("item", 4).is_none());
    }

    #[tokio::test]
    async fn rebuild_of_unknown_root_is_not_found() {
        let store = seeded();
        let engine = MemorySearchEngine::new();
        let err = rebuild_index(store.as_ref(), &engine, &registry(), "wine", 10)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not found: root type 'wine'");
    }

    #[tokio::test]
    async fn reindex_all_recomputes_fresh_rows() {
        let store = seeded();
        let registry = registry();
        let coordinator = ReindexCoordinator::new(
            store.clone(),
            Arc::clone(&registry),
            ReindexConfig {
                debounce: Duration::ZERO,
                batch_size: 10,
            },
        );

        let report = reindex(store.as_ref(), &coordinator, &registry, false)
            .await
            .unwrap();
        assert_eq!(report.indexed(), 3);

        let report = reindex(store.as_ref(), &coordinator, &registry, false)
            .await
            .unwrap();
        assert_eq!(report.indexed(), 0);

        let report = reindex(store.as_ref(), &coordinator, &registry, true)
            .await
            .unwrap();
        assert_eq!(report.indexed(), 3);
        assert!(store.search_content("item", 2).unwrap().contains("latour"));
    }
}
