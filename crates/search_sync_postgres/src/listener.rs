//! Reindex Listener
//!
//! Holds a dedicated `LISTEN search_reindex` connection and turns every
//! notification into a coordinator signal. Connection failures are logged and
//! retried after a fixed backoff; only the shutdown signal ends the loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info};

use search_sync_core::coordinator::ReindexCoordinator;

use crate::tx::REINDEX_CHANNEL;

/// Delay before reconnecting after a listener error
const RECONNECT_BACKOFF_MS: u64 = 5000;

pub struct ReindexListener {
    pool: PgPool,
    coordinator: Arc<ReindexCoordinator>,
    backoff: Duration,
}

impl ReindexListener {
    pub fn new(pool: PgPool, coordinator: Arc<ReindexCoordinator>) -> Self {
        Self {
            pool,
            coordinator,
            backoff: Duration::from_millis(RECONNECT_BACKOFF_MS),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start the listener loop (blocks until shutdown signal)
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(channel = REINDEX_CHANNEL, "Reindex listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.listen(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "Reindex listener failed; reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Reindex listener shutting down");
    }

    /// One connection's lifetime. `Ok` means shutdown was requested.
    async fn listen(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(REINDEX_CHANNEL).await?;
        debug!(channel = REINDEX_CHANNEL, "Listening for reindex signals");

        // Notifications sent while we were not connected are gone; catch up once.
        self.coordinator.spawn_signal();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                received = listener.try_recv() => {
                    match received? {
                        Some(notification) => {
                            debug!(channel = notification.channel(), "Reindex signal received");
                            self.coordinator.spawn_signal();
                        }
                        None => return Err(anyhow!("listener connection lost")),
                    }
                }
            }
        }
    }
}
