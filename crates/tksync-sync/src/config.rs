//! Layered runtime configuration: built-in defaults, then an optional YAML file, then the
//! process environment.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tksync_core::{WatchedField, WindowSelector};
use tksync_storage::PgStoreOptions;

pub const CONFIG_PATH_ENV: &str = "TKSYNC_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub statement_timeout_secs: u64,
    pub lookback_hours: u32,
    pub batch_size: usize,
    pub backfill_delay_ms: u64,
    pub upsert_timeout_secs: u64,
    pub sync_cron: String,
    /// When set, ticks fire on a plain interval instead of `sync_cron`.
    pub sync_interval_secs: Option<u64>,
    pub watched_fields: Vec<WatchedField>,
    pub source_utc_offset_minutes: i32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: PgStoreOptions::default().database_url,
            max_connections: 5,
            statement_timeout_secs: 30,
            lookback_hours: 1,
            batch_size: 5000,
            backfill_delay_ms: 100,
            upsert_timeout_secs: 30,
            sync_cron: "0 * * * * *".to_string(),
            sync_interval_secs: None,
            watched_fields: WatchedField::ALL.to_vec(),
            source_utc_offset_minutes: 0,
        }
    }
}

impl SyncConfig {
    /// Reads the file named by `TKSYNC_CONFIG` (if any) and the process environment.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load(path.as_deref())
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Overrides fields from environment variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("TKSYNC_DB_MAX_CONNECTIONS") {
            self.max_connections = parse_var("TKSYNC_DB_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("TKSYNC_STATEMENT_TIMEOUT_SECS") {
            self.statement_timeout_secs = parse_var("TKSYNC_STATEMENT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TKSYNC_LOOKBACK_HOURS") {
            self.lookback_hours = parse_var("TKSYNC_LOOKBACK_HOURS", &v)?;
        }
        if let Some(v) = lookup("TKSYNC_BATCH_SIZE") {
            self.batch_size = parse_var("TKSYNC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("TKSYNC_BACKFILL_DELAY_MS") {
            self.backfill_delay_ms = parse_var("TKSYNC_BACKFILL_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("TKSYNC_UPSERT_TIMEOUT_SECS") {
            self.upsert_timeout_secs = parse_var("TKSYNC_UPSERT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TKSYNC_SYNC_CRON") {
            self.sync_cron = v;
        }
        if let Some(v) = lookup("TKSYNC_SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = Some(parse_var("TKSYNC_SYNC_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("TKSYNC_WATCHED_FIELDS") {
            self.watched_fields = WatchedField::parse_list(&v).context("parsing TKSYNC_WATCHED_FIELDS")?;
        }
        if let Some(v) = lookup("TKSYNC_SOURCE_UTC_OFFSET_MINUTES") {
            self.source_utc_offset_minutes = parse_var("TKSYNC_SOURCE_UTC_OFFSET_MINUTES", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.lookback_hours == 0 {
            bail!("lookback_hours must be at least 1");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.sync_interval_secs == Some(0) {
            bail!("sync_interval_secs must be at least 1");
        }
        if self.sync_interval_secs.is_none() && self.sync_cron.trim().is_empty() {
            bail!("sync_cron must not be empty");
        }
        self.window_selector()?;
        Ok(())
    }

    pub fn window_selector(&self) -> Result<WindowSelector> {
        WindowSelector::new(self.lookback_hours, self.source_utc_offset_minutes)
            .context("building change window")
    }

    pub fn store_options(&self) -> PgStoreOptions {
        PgStoreOptions {
            database_url: self.database_url.clone(),
            max_connections: self.max_connections,
            statement_timeout: Duration::from_secs(self.statement_timeout_secs),
            ..PgStoreOptions::default()
        }
    }

    pub fn upsert_timeout(&self) -> Duration {
        Duration::from_secs(self.upsert_timeout_secs)
    }

    pub fn backfill_delay(&self) -> Duration {
        Duration::from_millis(self.backfill_delay_ms)
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow!("invalid value {raw:?} for {key}: {err}"))
}
