//! Ranked search over the denormalized `search_content`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SyncError;
use crate::ports::{RankQuery, RankingStore, Result};
use crate::registry::SearchRegistry;
use crate::schema::RootEntity;
use crate::types::{RankedHit, RankedPage};

/// pg_trgm's own default for `word_similarity_threshold`.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.3;

pub struct RankedSearch {
    store: Arc<dyn RankingStore>,
    registry: Arc<SearchRegistry>,
    default_threshold: f64,
}

impl RankedSearch {
    pub fn new(store: Arc<dyn RankingStore>, registry: Arc<SearchRegistry>) -> Self {
        Self {
            store,
            registry,
            default_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    pub fn with_default_threshold(mut self, threshold: f64) -> Self {
        self.default_threshold = threshold;
        self
    }

    /// One page of `root_type` rows ranked against `query`.
    ///
    /// A blank query lists rows by id without ranking.
    pub async fn ranked_search(
        &self,
        root_type: &str,
        query: &str,
        threshold: Option<f64>,
        skip: u64,
        limit: u64,
    ) -> Result<RankedPage> {
        let root = self.registry.require_root(root_type)?;
        if limit == 0 {
            return Err(SyncError::InvalidInput("limit must be positive".into()));
        }
        let threshold = threshold.unwrap_or(self.default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SyncError::InvalidInput(format!(
                "similarity threshold {threshold} outside [0, 1]"
            )));
        }

        let text = query.trim();
        if text.is_empty() {
            return self.unranked(root, skip, limit).await;
        }

        let rank_query = RankQuery {
            text,
            threshold,
            skip,
            limit,
        };
        let ranked = self.store.rank(root, &rank_query).await?;

        // A short page is the last one unless it is empty past the end.
        let returned = ranked.len() as u64;
        let total = if returned < limit && (skip == 0 || returned > 0) {
            skip + returned
        } else {
            self.store.count_matches(root, &rank_query).await?
        };

        let ids: Vec<i64> = ranked.iter().map(|r| r.id).collect();
        let mut documents: HashMap<i64, _> = self
            .store
            .load_documents(root, &ids)
            .await?
            .into_iter()
            .collect();

        let hits: Vec<RankedHit> = ranked
            .iter()
            .filter_map(|r| {
                documents.remove(&r.id).map(|document| RankedHit {
                    id: r.id,
                    rank: Some(r.rank),
                    document,
                })
            })
            .collect();

        tracing::debug!(
            root = %root_type,
            query = %text,
            threshold,
            strategy = ?root.strategy,
            returned = hits.len(),
            total,
            "Ranked search"
        );

        Ok(RankedPage {
            ids: hits.iter().map(|h| h.id).collect(),
            hits,
            total,
            skip,
            limit,
        })
    }

    async fn unranked(&self, root: &RootEntity, skip: u64, limit: u64) -> Result<RankedPage> {
        let (ids, total) = self.store.page_all(root, skip, limit).await?;
        let mut documents: HashMap<i64, _> = self
            .store
            .load_documents(root, &ids)
            .await?
            .into_iter()
            .collect();
        let hits: Vec<RankedHit> = ids
            .iter()
            .filter_map(|id| {
                documents.remove(id).map(|document| RankedHit {
                    id: *id,
                    rank: None,
                    document,
                })
            })
            .collect();
        Ok(RankedPage {
            ids: hits.iter().map(|h| h.id).collect(),
            hits,
            total,
            skip,
            limit,
        })
    }
}
