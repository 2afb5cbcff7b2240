use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

// ── Outbox ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxOperation {
    Insert,
    Update,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn carries_payload(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl fmt::Display for OutboxOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxOperation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(SyncError::InvalidInput(format!(
                "unknown outbox operation '{other}'"
            ))),
        }
    }
}

/// An outbox row as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub operation: OutboxOperation,
    pub payload: Option<Value>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
}

/// An outbox row about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
    pub entity_type: String,
    pub entity_id: i64,
    pub operation: OutboxOperation,
    pub payload: Option<Value>,
}

impl NewOutboxEntry {
    pub fn insert(entity_type: impl Into<String>, entity_id: i64, payload: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            operation: OutboxOperation::Insert,
            payload: Some(payload),
        }
    }

    pub fn update(entity_type: impl Into<String>, entity_id: i64, payload: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            operation: OutboxOperation::Update,
            payload: Some(payload),
        }
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            operation: OutboxOperation::Delete,
            payload: None,
        }
    }
}

// ── Changes ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn operation(&self) -> OutboxOperation {
        match self {
            Self::Insert => OutboxOperation::Insert,
            Self::Update => OutboxOperation::Update,
            Self::Delete => OutboxOperation::Delete,
        }
    }
}

/// A committed-or-about-to-commit write reported by the service layer.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub entity_type: String,
    pub entity_id: i64,
    pub kind: ChangeKind,
    /// Full read-schema snapshot; required for root inserts and updates.
    pub document: Option<Value>,
}

impl EntityChange {
    pub fn inserted(entity_type: impl Into<String>, entity_id: i64) -> Self {
        Self::new(entity_type, entity_id, ChangeKind::Insert)
    }

    pub fn updated(entity_type: impl Into<String>, entity_id: i64) -> Self {
        Self::new(entity_type, entity_id, ChangeKind::Update)
    }

    pub fn deleted(entity_type: impl Into<String>, entity_id: i64) -> Self {
        Self::new(entity_type, entity_id, ChangeKind::Delete)
    }

    fn new(entity_type: impl Into<String>, entity_id: i64, kind: ChangeKind) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            kind,
            document: None,
        }
    }

    pub fn with_document(mut self, document: Value) -> Self {
        self.document = Some(document);
        self
    }
}

/// What recording a change did inside the caller's transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeOutcome {
    pub outbox_id: Option<i64>,
    /// Root rows whose `search_content` was cleared, grouped by root type.
    pub invalidated: BTreeMap<String, Vec<i64>>,
    pub signal_queued: bool,
}

impl ChangeOutcome {
    pub fn invalidated_count(&self) -> usize {
        self.invalidated.values().map(Vec::len).sum()
    }
}

// ── Reindex ───────────────────────────────────────────────────

/// A root row with NULL `search_content`, read at `generation`.
///
/// Every invalidation bumps the row's generation, so content built from a
/// load that an invalidation has since overtaken is never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleRow {
    pub id: i64,
    pub generation: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentWrite {
    pub id: i64,
    /// Generation the row had when it was found stale.
    pub generation: i64,
    pub content: String,
}

// ── Search results ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedId {
    pub id: i64,
    pub rank: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedHit {
    pub id: i64,
    pub rank: Option<f64>,
    pub document: Value,
}

/// One page of ranked results, in rank order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPage {
    pub ids: Vec<i64>,
    pub hits: Vec<RankedHit>,
    pub total: u64,
    pub skip: u64,
    pub limit: u64,
}

impl RankedPage {
    pub fn has_next(&self) -> bool {
        self.skip + (self.ids.len() as u64) < self.total
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSearchResult {
    pub hits: Vec<Value>,
    pub estimated_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_round_trips_through_text() {
        for op in [
            OutboxOperation::Insert,
            OutboxOperation::Update,
            OutboxOperation::Delete,
        ] {
            assert_eq!(op.as_str().parse::<OutboxOperation>().unwrap(), op);
        }
        assert!("UPSERT".parse::<OutboxOperation>().is_err());
    }

    #[test]
    fn delete_entry_has_no_payload() {
        let entry = NewOutboxEntry::delete("item", 5);
        assert_eq!(entry.operation, OutboxOperation::Delete);
        assert!(entry.payload.is_none());
        assert!(!entry.operation.carries_payload());
        assert!(NewOutboxEntry::insert("item", 5, json!({"id": 5}))
            .operation
            .carries_payload());
    }

    #[test]
    fn page_has_next() {
        let page = RankedPage {
            ids: vec![1, 2],
            hits: vec![],
            total: 5,
            skip: 2,
            limit: 2,
        };
        assert!(page.has_next());
        let last = RankedPage { skip: 3, ..page };
        assert!(!last.has_next());
    }
}
