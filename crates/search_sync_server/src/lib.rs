//! Search sync worker library: configuration, the outbox dispatcher, and the
//! one-shot maintenance operations behind the `search_sync` binary.

pub mod config;
pub mod dispatcher;
pub mod maintenance;
