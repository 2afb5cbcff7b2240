//! search_sync — worker binary for search index synchronization.
//!
//! Reads config from flags or env vars (see `search_sync --help`):
//!   SEARCH_SYNC_DATABASE_URL — Postgres connection string (required)
//!   SEARCH_SYNC_REGISTRY     — registry YAML (default: config/search_registry.yaml)
//!   SEARCH_SYNC_MEILI_URL    — Meilisearch base URL (default: http://127.0.0.1:7700)
//!   SEARCH_SYNC_MEILI_KEY    — Meilisearch API key (optional)

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;

use search_sync_core::ports::{OutboxStore, SearchEngine};
use search_sync_core::{RankedSearch, ReindexCoordinator, SearchRegistry};
use search_sync_meili::MeiliClient;
use search_sync_postgres::{PgStores, ReindexListener};
use search_sync_server::config::{load_registry, Cli, Command};
use search_sync_server::dispatcher::OutboxDispatcher;
use search_sync_server::maintenance;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,search_sync_server=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(load_registry(&cli.registry)?);
    tracing::info!(
        roots = registry.roots().count(),
        path = %cli.registry.display(),
        "Registry loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(cli.database_url()?)
        .await
        .context("failed to connect to database")?;
    tracing::info!("Connected to database");

    match cli.command.clone() {
        Command::Run => run(&cli, pool, registry).await,
        Command::Migrate => migrate(&pool, &registry).await,
        Command::Reindex { all } => {
            let store = Arc::new(PgStores::new(pool).reindex);
            let coordinator =
                ReindexCoordinator::new(store.clone(), Arc::clone(&registry), cli.reindex_config());
            let report = maintenance::reindex(store.as_ref(), &coordinator, &registry, all).await?;
            for (root, stats) in &report.roots {
                println!("{root}: indexed={} failed={}", stats.indexed, stats.failed);
            }
            Ok(())
        }
        Command::DispatchOnce => {
            let dispatcher = OutboxDispatcher::new(
                Arc::new(PgStores::new(pool).outbox),
                engine(&cli)?,
                registry,
                cli.dispatcher_config(),
            );
            let report = dispatcher.dispatch_batch().await?;
            println!(
                "claimed={} delivered={} failed={}",
                report.claimed, report.delivered, report.failed
            );
            Ok(())
        }
        Command::RebuildIndex { root, page_size } => {
            let ranking = PgStores::new(pool).ranking;
            let engine = engine(&cli)?;
            let report =
                maintenance::rebuild_index(&ranking, engine.as_ref(), &registry, &root, page_size)
                    .await?;
            println!("{root}: uploaded={} skipped={}", report.uploaded, report.skipped);
            Ok(())
        }
        Command::Search {
            root,
            query,
            threshold,
            skip,
            limit,
        } => {
            let search = RankedSearch::new(Arc::new(PgStores::new(pool).ranking), registry)
                .with_default_threshold(cli.tuning.similarity_threshold);
            let page = search
                .ranked_search(&root, &query, threshold, skip, limit)
                .await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        Command::EngineSearch {
            root,
            query,
            offset,
            limit,
        } => {
            let index = registry.require_root(&root)?.index_name().to_string();
            let result = engine(&cli)?.search(&index, &query, offset, limit).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

fn engine(cli: &Cli) -> Result<Arc<dyn SearchEngine>> {
    let client = MeiliClient::new(cli.meili_config())?;
    Ok(Arc::new(client))
}

async fn migrate(pool: &PgPool, registry: &SearchRegistry) -> Result<()> {
    search_sync_postgres::migrate(pool).await?;
    search_sync_postgres::ensure_search_columns(pool, registry).await?;
    tracing::info!("Migrations applied");
    Ok(())
}

/// Dispatcher and listener as background tasks until Ctrl-C.
async fn run(cli: &Cli, pool: PgPool, registry: Arc<SearchRegistry>) -> Result<()> {
    migrate(&pool, &registry).await?;

    let engine = engine(cli)?;
    for root in registry.roots() {
        if let Err(e) = engine
            .ensure_index(root.index_name(), "id", &root.searchable_attributes)
            .await
        {
            tracing::warn!(index = root.index_name(), error = %e, "Search index not ensured");
        }
    }

    let stores = PgStores::new(pool.clone());
    let outbox: Arc<dyn OutboxStore> = Arc::new(stores.outbox);
    let coordinator = Arc::new(ReindexCoordinator::new(
        Arc::new(stores.reindex),
        Arc::clone(&registry),
        cli.reindex_config(),
    ));

    let dispatcher = OutboxDispatcher::new(outbox, engine, registry, cli.dispatcher_config());
    let listener = ReindexListener::new(pool, coordinator).with_backoff(cli.listen_backoff());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_shutdown = shutdown_rx.clone();
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await });
    let listener_task = tokio::spawn(async move { listener.run(shutdown_rx).await });
    tracing::info!("search_sync running (Ctrl-C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    let (dispatcher_done, listener_done) = tokio::join!(dispatcher_task, listener_task);
    dispatcher_done.context("dispatcher task panicked")?;
    listener_done.context("listener task panicked")?;
    Ok(())
}
