use thiserror::Error;

use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid document for {entity_type}#{entity_id}: {}", .violations.join("; "))]
    InvalidDocument {
        entity_type: String,
        entity_id: i64,
        violations: Vec<String>,
    },

    #[error("search engine: {0}")]
    Engine(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Failures the dispatcher records against an entry and moves past.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            Self::Engine(_) | Self::Timeout(_) | Self::InvalidDocument { .. } | Self::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn display_not_found() {
        let e = SyncError::NotFound("root type 'wine'".into());
        assert_eq!(e.to_string(), "not found: root type 'wine'");
    }

    #[test]
    fn display_invalid_document_joins_violations() {
        let e = SyncError::InvalidDocument {
            entity_type: "item".into(),
            entity_id: 7,
            violations: vec!["/id: missing".into(), "/vol: not a number".into()],
        };
        assert_eq!(
            e.to_string(),
            "invalid document for item#7: /id: missing; /vol: not a number"
        );
    }

    #[test]
    fn display_timeout() {
        let e = SyncError::Timeout(Duration::from_millis(1500));
        assert_eq!(e.to_string(), "timed out after 1.5s");
    }

    #[test]
    fn display_internal() {
        let e = SyncError::Internal(anyhow::anyhow!("connection reset"));
        assert_eq!(e.to_string(), "internal: connection reset");
    }

    #[test]
    fn delivery_failures_are_engine_side() {
        assert!(SyncError::Engine("503".into()).is_delivery_failure());
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_delivery_failure());
        assert!(!SyncError::Internal(anyhow::anyhow!("db down")).is_delivery_failure());
        assert!(!SyncError::InvalidInput("x".into()).is_delivery_failure());
    }
}
