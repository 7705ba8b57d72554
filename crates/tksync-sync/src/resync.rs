//! Operator-triggered repair of a date range with a single set-based merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tksync_core::{normalize_ticket, Clock, DateRange, Ticket};
use tksync_storage::TicketStore;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub range: DateRange,
    pub selected: usize,
    pub updated: usize,
    pub inserted: usize,
    pub skipped: usize,
}

pub struct WindowResync {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
}

impl WindowResync {
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn run(&self, range: DateRange) -> Result<ResyncReport> {
        let records = self
            .store
            .select_resync_range(&range)
            .await
            .with_context(|| format!("selecting resync rows in [{}, {})", range.from, range.to))?;

        let selected = records.len();
        let tickets = dedup_latest(records.iter().filter_map(normalize_ticket));
        let skipped = selected - tickets.len();
        if skipped > 0 {
            warn!(skipped, "resync dropped rows with blank or duplicate keys");
        }

        let counts = if tickets.is_empty() {
            Default::default()
        } else {
            self.store
                .merge_tickets(&tickets, self.clock.now())
                .await
                .context("merging resync rows")?
        };

        let report = ResyncReport {
            range,
            selected,
            updated: counts.updated,
            inserted: counts.inserted,
            skipped,
        };
        info!(
            from = %range.from,
            to = %range.to,
            selected = report.selected,
            updated = report.updated,
            inserted = report.inserted,
            "resync complete"
        );
        Ok(report)
    }
}

/// One ticket per key, keeping the newest change timestamp. The merge statement rejects a key
/// that appears twice.
fn dedup_latest(tickets: impl Iterator<Item = Ticket>) -> Vec<Ticket> {
    let mut by_key: BTreeMap<String, Ticket> = BTreeMap::new();
    for ticket in tickets {
        match by_key.get(&ticket.ticket) {
            Some(current) if current.it_modified_at > ticket.it_modified_at => {}
            _ => {
                by_key.insert(ticket.ticket.clone(), ticket);
            }
        }
    }
    by_key.into_values().collect()
}
