//! Search index synchronization core.
//!
//! Keeps denormalized search data consistent with the relational source of
//! truth: an outbox ledger written in the caller's transaction, a dependency
//! registry driving the invalidation cascade, a single-flight reindex
//! coordinator, and a ranking query engine. Adapters live in sibling crates;
//! this crate only defines the ports they implement.

pub mod cascade;
pub mod content;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod ports;
pub mod ranking;
pub mod registry;
pub mod schema;
pub mod trigram;
pub mod types;

#[cfg(test)]
pub(crate) mod fixtures;

pub use cascade::SearchSync;
pub use content::SearchContentBuilder;
pub use coordinator::{PassReport, ReindexConfig, ReindexCoordinator, RootReport, SignalOutcome};
pub use error::SyncError;
pub use ranking::{RankedSearch, DEFAULT_SIMILARITY_THRESHOLD};
pub use registry::{RegistryError, SearchRegistry, MAX_PATH_DEPTH};
pub use schema::{DependencyPath, Link, RankingStrategy, Relation, RelationHop, RootEntity};
pub use types::*;
