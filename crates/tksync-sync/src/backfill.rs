//! Bulk population of an empty or lagging target, one bounded batch at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tksync_core::{normalize_ticket, Clock, Ticket};
use tksync_storage::TicketStore;
use tracing::{debug, info};

use crate::config::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillOptions {
    pub batch_size: usize,
    pub delay: Duration,
    /// Stop after this many batches even if rows remain.
    pub max_batches: Option<usize>,
}

impl From<&SyncConfig> for BackfillOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            delay: config.backfill_delay(),
            max_batches: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub batches: usize,
    pub selected: usize,
    pub inserted: usize,
    /// Selected rows that were not inserted: blank after normalization, or already present.
    pub skipped: usize,
}

pub struct BackfillLoader {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    options: BackfillOptions,
}

impl BackfillLoader {
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>, options: BackfillOptions) -> Self {
        Self {
            store,
            clock,
            options: BackfillOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
        }
    }

    /// Inserts missing keys batch by batch until a batch inserts nothing. Existing target rows
    /// are never touched, so an interrupted run can simply be started again.
    pub async fn run(&self) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        loop {
            if self.options.max_batches.is_some_and(|max| report.batches >= max) {
                info!(batches = report.batches, "backfill batch limit reached");
                break;
            }

            let batch_no = report.batches + 1;
            let records = self
                .store
                .next_backfill_batch(self.options.batch_size)
                .await
                .with_context(|| format!("selecting backfill batch {batch_no}"))?;
            if records.is_empty() {
                break;
            }

            let tickets: Vec<Ticket> = records.iter().filter_map(normalize_ticket).collect();
            let inserted = self
                .store
                .insert_new_tickets(&tickets, self.clock.now())
                .await
                .with_context(|| format!("inserting backfill batch {batch_no}"))?;

            report.batches = batch_no;
            report.selected += records.len();
            report.inserted += inserted;
            report.skipped += records.len() - inserted;
            debug!(batch = batch_no, selected = records.len(), inserted, "backfill batch written");

            if inserted == 0 {
                break;
            }
            if !self.options.delay.is_zero() {
                tokio::time::sleep(self.options.delay).await;
            }
        }

        info!(
            batches = report.batches,
            selected = report.selected,
            inserted = report.inserted,
            skipped = report.skipped,
            "backfill complete"
        );
        Ok(report)
    }
}
