//! Command line and environment configuration.
//!
//! Every flag falls back to a `SEARCH_SYNC_*` environment variable; `.env` is
//! loaded by the binary before parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use search_sync_core::{ReindexConfig, SearchRegistry, DEFAULT_SIMILARITY_THRESHOLD};
use search_sync_meili::MeiliConfig;

use crate::dispatcher::DispatcherConfig;

#[derive(Parser, Debug)]
#[command(name = "search_sync")]
#[command(about = "Keeps search indexes and ranked search content in step with PostgreSQL")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Postgres connection string
    #[arg(long, env = "SEARCH_SYNC_DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// YAML file declaring root types and dependency paths
    #[arg(
        long,
        env = "SEARCH_SYNC_REGISTRY",
        global = true,
        default_value = "config/search_registry.yaml"
    )]
    pub registry: PathBuf,

    #[arg(long, env = "SEARCH_SYNC_MAX_CONNECTIONS", global = true, default_value_t = 10)]
    pub max_connections: u32,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub tuning: Tuning,
}

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    #[arg(
        long,
        env = "SEARCH_SYNC_MEILI_URL",
        global = true,
        default_value = "http://127.0.0.1:7700"
    )]
    pub meili_url: String,

    #[arg(long, env = "SEARCH_SYNC_MEILI_KEY", global = true, hide_env_values = true)]
    pub meili_key: Option<String>,

    /// Timeout for a single search engine call
    #[arg(long, env = "SEARCH_SYNC_CALL_TIMEOUT_MS", global = true, default_value_t = 10_000)]
    pub call_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct Tuning {
    #[arg(long, env = "SEARCH_SYNC_DISPATCH_INTERVAL_MS", global = true, default_value_t = 5_000)]
    pub dispatch_interval_ms: u64,

    #[arg(long, env = "SEARCH_SYNC_ERROR_BACKOFF_MS", global = true, default_value_t = 10_000)]
    pub error_backoff_ms: u64,

    /// Outbox entries claimed per dispatch cycle
    #[arg(long, env = "SEARCH_SYNC_BATCH_SIZE", global = true, default_value_t = 100)]
    pub batch_size: usize,

    #[arg(long, env = "SEARCH_SYNC_CLAIM_LEASE_MS", global = true, default_value_t = 60_000)]
    pub claim_lease_ms: u64,

    /// Defaults to `search-sync-<pid>`
    #[arg(long, env = "SEARCH_SYNC_CLAIMER_ID", global = true)]
    pub claimer_id: Option<String>,

    /// Requeue failed entries below this retry count; 0 disables retries
    #[arg(long, env = "SEARCH_SYNC_RETRY_FAILED_MAX", global = true, default_value_t = 0)]
    pub retry_failed_max: i32,

    #[arg(long, env = "SEARCH_SYNC_DEBOUNCE_MS", global = true, default_value_t = 200)]
    pub debounce_ms: u64,

    /// Rows recomputed per reindex batch
    #[arg(long, env = "SEARCH_SYNC_REINDEX_BATCH", global = true, default_value_t = 500)]
    pub reindex_batch: usize,

    #[arg(long, env = "SEARCH_SYNC_LISTEN_BACKOFF_MS", global = true, default_value_t = 5_000)]
    pub listen_backoff_ms: u64,

    #[arg(
        long,
        env = "SEARCH_SYNC_SIMILARITY_THRESHOLD",
        global = true,
        default_value_t = DEFAULT_SIMILARITY_THRESHOLD
    )]
    pub similarity_threshold: f64,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the outbox dispatcher and reindex listener until Ctrl-C
    Run,

    /// Apply migrations and add search columns to every root table
    Migrate,

    /// Run one reindex pass now
    Reindex {
        /// Recompute every row, not only stale ones
        #[arg(long)]
        all: bool,
    },

    /// Claim and deliver one outbox batch
    DispatchOnce,

    /// Recreate a search engine index from the database
    RebuildIndex {
        root: String,

        #[arg(long, default_value_t = 500)]
        page_size: u64,
    },

    /// Ranked search against the database
    Search {
        root: String,
        query: String,

        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long, default_value_t = 0)]
        skip: u64,

        #[arg(long, default_value_t = 20)]
        limit: u64,
    },

    /// Query the external search engine directly
    EngineSearch {
        root: String,
        query: String,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
}

impl Cli {
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("SEARCH_SYNC_DATABASE_URL must be set (or pass --database-url)")
    }

    pub fn meili_config(&self) -> MeiliConfig {
        let config = MeiliConfig::new(&self.engine.meili_url)
            .with_timeout(Duration::from_millis(self.engine.call_timeout_ms));
        match &self.engine.meili_key {
            Some(key) => config.with_api_key(key),
            None => config,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let t = &self.tuning;
        DispatcherConfig {
            batch_size: t.batch_size,
            poll_interval: Duration::from_millis(t.dispatch_interval_ms),
            error_backoff: Duration::from_millis(t.error_backoff_ms),
            call_timeout: Duration::from_millis(self.engine.call_timeout_ms),
            claimer_id: t
                .claimer_id
                .clone()
                .unwrap_or_else(|| format!("search-sync-{}", std::process::id())),
            claim_lease: Duration::from_millis(t.claim_lease_ms),
            retry_failed_max: t.retry_failed_max,
        }
    }

    pub fn reindex_config(&self) -> ReindexConfig {
        ReindexConfig {
            debounce: Duration::from_millis(self.tuning.debounce_ms),
            batch_size: self.tuning.reindex_batch,
        }
    }

    pub fn listen_backoff(&self) -> Duration {
        Duration::from_millis(self.tuning.listen_backoff_ms)
    }
}

/// Read and validate the registry YAML.
pub fn load_registry(path: &Path) -> Result<SearchRegistry> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read registry file {}", path.display()))?;
    SearchRegistry::from_yaml_str(&yaml)
        .with_context(|| format!("Invalid registry file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_search_with_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "search_sync",
            "search",
            "item",
            "baro",
            "--threshold",
            "0.5",
            "--limit",
            "5",
            "--database-url",
            "postgresql:///search",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Command::Search {
                root: "item".into(),
                query: "baro".into(),
                threshold: Some(0.5),
                skip: 0,
                limit: 5,
            }
        );
        assert_eq!(cli.database_url().unwrap(), "postgresql:///search");
    }

    #[test]
    fn dispatcher_config_maps_millisecond_flags() {
        let cli = Cli::try_parse_from([
            "search_sync",
            "run",
            "--dispatch-interval-ms",
            "250",
            "--call-timeout-ms",
            "1500",
            "--claimer-id",
            "worker-a",
            "--retry-failed-max",
            "3",
        ])
        .unwrap();

        let config = cli.dispatcher_config();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.call_timeout, Duration::from_millis(1500));
        assert_eq!(config.claimer_id, "worker-a");
        assert_eq!(config.retry_failed_max, 3);
    }

    #[test]
    fn reindex_all_flag() {
        let cli = Cli::try_parse_from(["search_sync", "reindex", "--all"]).unwrap();
        assert_eq!(cli.command, Command::Reindex { all: true });
    }

    #[test]
    fn shipped_registry_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/search_registry.yaml");
        let registry = load_registry(&path).unwrap();

        let item = registry.require_root("item").unwrap();
        assert_eq!(item.table_name(), "items");
        assert_eq!(
            registry.resolve("country").map(|p| p.describe()).as_deref(),
            Some("country→region→subregion→drink→item")
        );
        assert!(registry.resolve("food").is_some());
    }

    #[test]
    fn missing_registry_file_names_the_path() {
        let err = load_registry(Path::new("/nonexistent/search_registry.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/search_registry.yaml"));
    }
}
