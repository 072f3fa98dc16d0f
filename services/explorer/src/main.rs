use std::sync::Arc;

use anyhow::Context;
use explorer::{Explorer, ExplorerConfig, StoreBackend, demo, transport_axum};
use store::{DatasetStore, SqlStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_ROWS_PER_DATASET: usize = 240;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ExplorerConfig::from_env();
    info!(
        bind = %config.bind_addr,
        backend = config.backend.as_str(),
        http_workers = config.http_workers,
        anti_join = %config.anti_join,
        query_timeout_ms = config.query_timeout.map(|timeout| timeout.as_millis() as u64),
        "explorer starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.http_workers)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let store: Arc<dyn DatasetStore> = match config.backend {
            StoreBackend::MySql => {
                info!(
                    url = %config.redacted_database_url(),
                    metadatabase = %config.metadatabase,
                    "connecting to dataset store"
                );
                let store =
                    SqlStore::connect(&config.database_url, &config.metadatabase, &config.pool)
                        .await
                        .context("connecting to dataset store")?;
                Arc::new(store)
            }
            StoreBackend::Memory => {
                let store = demo::seeded_store(DEMO_ROWS_PER_DATASET)
                    .context("seeding in-memory store")?;
                info!(epoch = demo::DEMO_EPOCH, "serving seeded in-memory datasets");
                Arc::new(store)
            }
        };

        let explorer = Arc::new(Explorer::new(store, config.options()));
        transport_axum::serve(explorer, &config.bind_addr)
            .await
            .with_context(|| format!("serving http on {}", config.bind_addr))
    })
}
