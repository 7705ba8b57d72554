//! Reconciliation orchestration: continuous incremental sync, bulk backfill and range resync on
//! top of a [`TicketStore`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tksync_core::SystemClock;
use tksync_storage::{PgTicketStore, TicketStore};
use tracing::info;

mod backfill;
mod config;
mod engine;
mod resync;
mod scheduler;

pub use backfill::{BackfillLoader, BackfillOptions, BackfillReport};
pub use config::{SyncConfig, CONFIG_PATH_ENV};
pub use engine::{SyncEngine, TickOutcome, TickReport};
pub use resync::{ResyncReport, WindowResync};
pub use scheduler::{
    ticker_from_config, ChannelTicker, CronTicker, IntervalTicker, SchedulerStats, SyncScheduler,
    Ticker,
};

pub const CRATE_NAME: &str = "tksync-sync";

/// Opens the Postgres store described by `config`.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<PgTicketStore>> {
    let store = PgTicketStore::connect(&config.store_options())
        .await
        .context("connecting to ticket store")?;
    info!(max_connections = config.max_connections, "ticket store connected");
    Ok(Arc::new(store))
}

pub fn engine_for(store: Arc<dyn TicketStore>, config: &SyncConfig) -> Result<SyncEngine> {
    SyncEngine::new(store, Arc::new(SystemClock), config)
}

/// One incremental pass against the database configured through the environment.
pub async fn run_sync_once_from_env() -> Result<TickOutcome> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    engine_for(store, &config)?.run_tick().await
}
