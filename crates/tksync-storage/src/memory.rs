use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tksync_core::{normalize_ticket, normalize_timestamp, DateRange, SourceRecord, StoredTicket, Ticket};
use tokio::sync::Mutex;

use crate::{CandidateQuery, MergeCounts, StoreError, TicketStore, UpsertOutcome};

/// In-process store with the same selection and write semantics as [`crate::PgTicketStore`].
///
/// Faults can be injected per key or per bulk statement so engine error paths can be driven
/// deterministically.
#[derive(Debug, Default)]
pub struct MemoryTicketStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    source: Vec<SourceRecord>,
    target: BTreeMap<String, StoredTicket>,
    failing_keys: HashSet<String>,
    offline: bool,
    bulk_insert_budget: Option<usize>,
}

impl MemoryState {
    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn write(&mut self, ticket: &Ticket, synced_at: DateTime<Utc>) -> UpsertOutcome {
        let previous = self.target.get(&ticket.ticket).map(|stored| stored.last_sync);
        let last_sync = next_last_sync(previous, synced_at);
        let outcome = if previous.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };
        self.target.insert(
            ticket.ticket.clone(),
            StoredTicket {
                ticket: ticket.clone(),
                last_sync,
            },
        );
        outcome
    }
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(records: Vec<SourceRecord>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                source: records,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn push_source(&self, record: SourceRecord) {
        self.state.lock().await.source.push(record);
    }

    /// Seeds a target row directly, bypassing the engine.
    pub async fn put_target(&self, stored: StoredTicket) {
        let mut state = self.state.lock().await;
        state.target.insert(stored.ticket.ticket.clone(), stored);
    }

    pub async fn target_snapshot(&self) -> Vec<StoredTicket> {
        self.state.lock().await.target.values().cloned().collect()
    }

    pub async fn target_len(&self) -> usize {
        self.state.lock().await.target.len()
    }

    /// Makes every single-row upsert of `key` fail.
    pub async fn fail_writes_for(&self, key: &str) {
        self.state.lock().await.failing_keys.insert(key.to_string());
    }

    /// Makes every operation fail as if the database connection were lost.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Lets `successes` bulk inserts through, then fails the following ones.
    pub async fn fail_bulk_inserts_after(&self, successes: usize) {
        self.state.lock().await.bulk_insert_budget = Some(successes);
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.lock().await;
        state.failing_keys.clear();
        state.offline = false;
        state.bulk_insert_budget = None;
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn select_candidates(&self, query: &CandidateQuery) -> Result<Vec<SourceRecord>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_online()?;

        let mut candidates: Vec<(Option<NaiveDateTime>, String, &SourceRecord)> =
            latest_revisions(&state.source)
                .into_iter()
                .filter(|(key, record)| {
                    let changed = record
                        .change_timestamp()
                        .is_some_and(|stamp| stamp >= query.window_start);
                    let target = state.target.get(key);
                    let diverged = match (target, normalize_ticket(record)) {
                        (Some(target), Some(source)) => query
                            .watched
                            .iter()
                            .any(|field| field.differs(&source, &target.ticket)),
                        _ => false,
                    };
                    changed || target.is_none() || diverged
                })
                .map(|(key, record)| (record.change_timestamp(), key, record))
                .collect();

        // None sorts first, matching NULLS FIRST on an ascending order.
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(candidates
            .into_iter()
            .take(query.limit)
            .map(|(_, _, record)| record.clone())
            .collect())
    }

    async fn upsert_ticket(
        &self,
        ticket: &Ticket,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_online()?;
        if state.failing_keys.contains(&ticket.ticket) {
            return Err(StoreError::Unavailable(format!(
                "injected write failure for {}",
                ticket.ticket
            )));
        }
        Ok(state.write(ticket, synced_at))
    }

    async fn next_backfill_batch(&self, limit: usize) -> Result<Vec<SourceRecord>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_online()?;
        Ok(latest_revisions(&state.source)
            .into_iter()
            .filter(|(key, _)| !key.is_empty() && !state.target.contains_key(key))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn insert_new_tickets(
        &self,
        tickets: &[Ticket],
        synced_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_online()?;
        if let Some(budget) = state.bulk_insert_budget.as_mut() {
            if *budget == 0 {
                return Err(StoreError::Unavailable("injected bulk insert failure".into()));
            }
            *budget -= 1;
        }

        let mut inserted = 0;
        for ticket in tickets {
            if !state.target.contains_key(&ticket.ticket) {
                state.write(ticket, synced_at);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn select_resync_range(&self, range: &DateRange) -> Result<Vec<SourceRecord>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_online()?;
        Ok(latest_revisions(&state.source)
            .into_iter()
            .filter(|(key, record)| {
                let visit = normalize_timestamp(record.visit_at.as_deref());
                let changed = record.change_timestamp();
                !key.is_empty()
                    && (visit.is_some_and(|t| range.contains(t))
                        || changed.is_some_and(|t| range.contains(t)))
            })
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn merge_tickets(
        &self,
        tickets: &[Ticket],
        synced_at: DateTime<Utc>,
    ) -> Result<MergeCounts, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_online()?;
        let mut counts = MergeCounts::default();
        for ticket in tickets {
            match state.write(ticket, synced_at) {
                UpsertOutcome::Inserted => counts.inserted += 1,
                UpsertOutcome::Updated => counts.updated += 1,
            }
        }
        Ok(counts)
    }

    async fn get_ticket(&self, key: &str) -> Result<Option<StoredTicket>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_online()?;
        Ok(state.target.get(key).cloned())
    }
}

/// Rank-1 revision per business key, keyed and ordered by key.
fn latest_revisions(source: &[SourceRecord]) -> BTreeMap<String, &SourceRecord> {
    let mut latest: BTreeMap<String, (Option<NaiveDateTime>, &SourceRecord)> = BTreeMap::new();
    for record in source {
        let stamp = record.change_timestamp();
        latest
            .entry(record.business_key())
            .and_modify(|current| {
                // `>=` lets the later row win ties; a missing stamp never beats a parsed one.
                if stamp >= current.0 {
                    *current = (stamp, record);
                }
            })
            .or_insert((stamp, record));
    }
    latest
        .into_iter()
        .map(|(key, (_, record))| (key, record))
        .collect()
}

fn next_last_sync(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    }
}
