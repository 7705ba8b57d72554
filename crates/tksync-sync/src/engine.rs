//! Continuous incremental sync: one tick selects candidates inside the change window and upserts
//! them one by one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tksync_core::{normalize_ticket, Clock, Ticket, WatchedField, WindowSelector};
use tksync_storage::{CandidateQuery, TicketStore, UpsertOutcome};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: NaiveDateTime,
    pub candidates_found: usize,
    pub upserted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick was still running.
    Skipped,
}

pub struct SyncEngine {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    window: WindowSelector,
    watched: Vec<WatchedField>,
    batch_size: usize,
    upsert_timeout: Duration,
    running: Mutex<()>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            store,
            clock,
            window: config.window_selector()?,
            watched: config.watched_fields.clone(),
            batch_size: config.batch_size.max(1),
            upsert_timeout: config.upsert_timeout(),
            running: Mutex::new(()),
        })
    }

    /// Runs one pass unless another is in progress. A top-level failure (the candidate read)
    /// aborts the pass and is returned; per-row failures are only counted.
    pub async fn run_tick(&self) -> Result<TickOutcome> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("previous sync tick still running; skipping");
            return Ok(TickOutcome::Skipped);
        };

        let run_id = Uuid::new_v4();
        match self
            .run_pass(run_id)
            .instrument(info_span!("sync_tick", %run_id))
            .await
        {
            Ok(report) => Ok(TickOutcome::Completed(report)),
            Err(err) => {
                error!(%run_id, error = %format!("{err:#}"), "sync tick aborted");
                Err(err)
            }
        }
    }

    async fn run_pass(&self, run_id: Uuid) -> Result<TickReport> {
        let started_at = self.clock.now();
        let window = self.window.window_at(started_at);
        let query = CandidateQuery {
            window_start: window.start,
            watched: self.watched.clone(),
            limit: self.batch_size,
        };
        let candidates = self
            .store
            .select_candidates(&query)
            .await
            .context("selecting sync candidates")?;

        let mut report = TickReport {
            run_id,
            started_at,
            finished_at: started_at,
            window_start: window.start,
            candidates_found: candidates.len(),
            upserted: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            errored: 0,
        };
        if candidates.len() == self.batch_size {
            info!(cap = self.batch_size, "candidate cap reached; remainder deferred to next tick");
        }

        for record in &candidates {
            let Some(ticket) = normalize_ticket(record) else {
                warn!(raw_key = ?record.ticket, "skipping candidate with blank business key");
                report.skipped += 1;
                continue;
            };
            match self.upsert(&ticket).await {
                Ok(outcome) => {
                    report.upserted += 1;
                    match outcome {
                        UpsertOutcome::Inserted => report.inserted += 1,
                        UpsertOutcome::Updated => report.updated += 1,
                    }
                }
                Err(err) => {
                    warn!(ticket = %ticket.ticket, error = %format!("{err:#}"), "ticket upsert failed");
                    report.errored += 1;
                }
            }
        }

        report.finished_at = self.clock.now();
        info!(
            window_start = %report.window_start,
            candidates = report.candidates_found,
            upserted = report.upserted,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            errored = report.errored,
            "sync tick complete"
        );
        Ok(report)
    }

    async fn upsert(&self, ticket: &Ticket) -> Result<UpsertOutcome> {
        let synced_at = self.clock.now();
        match tokio::time::timeout(self.upsert_timeout, self.store.upsert_ticket(ticket, synced_at)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(anyhow!("upsert timed out after {:?}", self.upsert_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tksync_core::{DateRange, ManualClock, SourceRecord, StoredTicket};
    use tksync_storage::{MemoryTicketStore, MergeCounts, StoreError};
    use tokio::sync::Notify;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).single().unwrap()
    }

    fn record(key: &str, it_modified: &str, status: &str) -> SourceRecord {
        SourceRecord {
            ticket: Some(key.into()),
            status: Some(status.into()),
            it_modified_at: Some(it_modified.into()),
            technician_name: Some(" Ana ".into()),
            latitude: Some("12,5".into()),
            ..SourceRecord::default()
        }
    }

    fn engine_for(store: Arc<MemoryTicketStore>, clock: Arc<ManualClock>) -> SyncEngine {
        SyncEngine::new(store, clock, &SyncConfig::default()).unwrap()
    }

    fn completed(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Completed(report) => report,
            TickOutcome::Skipped => panic!("tick unexpectedly skipped"),
        }
    }

    #[tokio::test]
    async fn first_tick_inserts_then_second_is_quiet() {
        let store = Arc::new(MemoryTicketStore::with_source(vec![
            record("T-1", "2024-01-01 09:30", "abierto"),
            record("T-2", "2023-12-01 08:00", "cerrado"),
        ]));
        let clock = Arc::new(ManualClock::new(now()));
        let engine = engine_for(store.clone(), clock.clone());

        let first = completed(engine.run_tick().await.unwrap());
        assert_eq!(first.candidates_found, 2);
        assert_eq!(first.inserted, 2);
        assert_eq!(first.errored, 0);

        clock.advance(ChronoDuration::hours(2));
        let second = completed(engine.run_tick().await.unwrap());
        assert_eq!(second.candidates_found, 0);

        let stored = store.get_ticket("T-1").await.unwrap().unwrap();
        assert_eq!(stored.ticket.technician_name.as_deref(), Some("Ana"));
        assert_eq!(stored.ticket.latitude, Some(12.5));
    }

    #[tokio::test]
    async fn rerunning_unchanged_rows_only_moves_last_sync() {
        let store = Arc::new(MemoryTicketStore::with_source(vec![record(
            "T-1",
            "2024-01-01 09:45",
            "abierto",
        )]));
        let clock = Arc::new(ManualClock::new(now()));
        let engine = engine_for(store.clone(), clock.clone());

        completed(engine.run_tick().await.unwrap());
        let before = store.get_ticket("T-1").await.unwrap().unwrap();

        let again = completed(engine.run_tick().await.unwrap());
        assert_eq!(again.updated, 1);
        let after = store.get_ticket("T-1").await.unwrap().unwrap();

        assert_eq!(before.ticket, after.ticket);
        assert!(after.last_sync > before.last_sync);
    }

    #[tokio::test]
    async fn newest_revision_wins_over_older_one() {
        let store = Arc::new(MemoryTicketStore::with_source(vec![
            record("T-200", "2024-01-01 09:50", "nuevo"),
            record("T-200", "2024-01-01 09:10", "viejo"),
        ]));
        let engine = engine_for(store.clone(), Arc::new(ManualClock::new(now())));

        let report = completed(engine.run_tick().await.unwrap());
        assert_eq!(report.candidates_found, 1);
        let stored = store.get_ticket("T-200").await.unwrap().unwrap();
        assert_eq!(stored.ticket.status.as_deref(), Some("nuevo"));
    }

    #[tokio::test]
    async fn blank_keys_are_skipped_and_failures_are_isolated() {
        let store = Arc::new(MemoryTicketStore::with_source(vec![
            record("  ", "2024-01-01 09:30", "sin clave"),
            record("T-BAD", "2024-01-01 09:31", "x"),
            record("T-OK", "2024-01-01 09:32", "y"),
        ]));
        store.fail_writes_for("T-BAD").await;
        let engine = engine_for(store.clone(), Arc::new(ManualClock::new(now())));

        let report = completed(engine.run_tick().await.unwrap());
        assert_eq!(report.candidates_found, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errored, 1);
        assert_eq!(report.upserted, 1);
        assert!(store.get_ticket("T-OK").await.unwrap().is_some());
        assert!(store.get_ticket("T-BAD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn window_boundary_is_inclusive() {
        let store = Arc::new(MemoryTicketStore::with_source(vec![
            record("AT-START", "2024-01-01 09:00:00", "a"),
            record("BEFORE", "2024-01-01 08:59:59", "a"),
        ]));
        let clock = Arc::new(ManualClock::new(now()));
        let config = SyncConfig {
            watched_fields: vec![],
            ..SyncConfig::default()
        };
        for key in ["AT-START", "BEFORE"] {
            let mut ticket = normalize_ticket(&record(key, "2024-01-01 08:00", "a")).unwrap();
            ticket.it_modified_at = None;
            store
                .put_target(StoredTicket {
                    ticket,
                    last_sync: now() - ChronoDuration::days(1),
                })
                .await;
        }
        let engine = SyncEngine::new(store.clone(), clock, &config).unwrap();

        let report = completed(engine.run_tick().await.unwrap());
        assert_eq!(report.candidates_found, 1);
        let at_start = store.get_ticket("AT-START").await.unwrap().unwrap();
        assert!(at_start.ticket.it_modified_at.is_some());
        let before = store.get_ticket("BEFORE").await.unwrap().unwrap();
        assert!(before.ticket.it_modified_at.is_none());
    }

    #[tokio::test]
    async fn watched_field_divergence_catches_missed_timestamp_bump() {
        let store = Arc::new(MemoryTicketStore::new());
        store.push_source(record("T-7", "2023-06-01 08:00", "abierto")).await;
        let engine = engine_for(store.clone(), Arc::new(ManualClock::new(now())));
        completed(engine.run_tick().await.unwrap());

        // Upstream changed the status without touching the change timestamp.
        store.push_source(record("T-7", "2023-06-01 08:00", "cerrado")).await;
        let report = completed(engine.run_tick().await.unwrap());
        assert_eq!(report.updated, 1);
        let stored = store.get_ticket("T-7").await.unwrap().unwrap();
        assert_eq!(stored.ticket.status.as_deref(), Some("cerrado"));
    }

    #[tokio::test]
    async fn lost_store_aborts_the_tick() {
        let store = Arc::new(MemoryTicketStore::with_source(vec![record(
            "T-1",
            "2024-01-01 09:30",
            "a",
        )]));
        store.set_offline(true).await;
        let engine = engine_for(store.clone(), Arc::new(ManualClock::new(now())));
        let err = engine.run_tick().await.unwrap_err();
        assert!(format!("{err:#}").contains("selecting sync candidates"));

        store.set_offline(false).await;
        let report = completed(engine.run_tick().await.unwrap());
        assert_eq!(report.inserted, 1);
    }

    /// Delegates to a memory store but parks inside candidate selection until released.
    struct GatedStore {
        inner: MemoryTicketStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TicketStore for GatedStore {
        async fn select_candidates(&self, query: &CandidateQuery) -> Result<Vec<SourceRecord>, StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.select_candidates(query).await
        }
        async fn upsert_ticket(&self, ticket: &Ticket, at: DateTime<Utc>) -> Result<UpsertOutcome, StoreError> {
            self.inner.upsert_ticket(ticket, at).await
        }
        async fn next_backfill_batch(&self, limit: usize) -> Result<Vec<SourceRecord>, StoreError> {
            self.inner.next_backfill_batch(limit).await
        }
        async fn insert_new_tickets(&self, tickets: &[Ticket], at: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.insert_new_tickets(tickets, at).await
        }
        async fn select_resync_range(&self, range: &DateRange) -> Result<Vec<SourceRecord>, StoreError> {
            self.inner.select_resync_range(range).await
        }
        async fn merge_tickets(&self, tickets: &[Ticket], at: DateTime<Utc>) -> Result<MergeCounts, StoreError> {
            self.inner.merge_tickets(tickets, at).await
        }
        async fn get_ticket(&self, key: &str) -> Result<Option<StoredTicket>, StoreError> {
            self.inner.get_ticket(key).await
        }
    }

    /// Memory store whose upsert of one key never completes.
    struct StallingStore {
        inner: MemoryTicketStore,
        stuck_key: &'static str,
    }

    #[async_trait]
    impl TicketStore for StallingStore {
        async fn select_candidates(&self, query: &CandidateQuery) -> Result<Vec<SourceRecord>, StoreError> {
            self.inner.select_candidates(query).await
        }
        async fn upsert_ticket(&self, ticket: &Ticket, at: DateTime<Utc>) -> Result<UpsertOutcome, StoreError> {
            if ticket.ticket == self.stuck_key {
                std::future::pending::<()>().await;
            }
            self.inner.upsert_ticket(ticket, at).await
        }
        async fn next_backfill_batch(&self, limit: usize) -> Result<Vec<SourceRecord>, StoreError> {
            self.inner.next_backfill_batch(limit).await
        }
        async fn insert_new_tickets(&self, tickets: &[Ticket], at: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.insert_new_tickets(tickets, at).await
        }
        async fn select_resync_range(&self, range: &DateRange) -> Result<Vec<SourceRecord>, StoreError> {
            self.inner.select_resync_range(range).await
        }
        async fn merge_tickets(&self, tickets: &[Ticket], at: DateTime<Utc>) -> Result<MergeCounts, StoreError> {
            self.inner.merge_tickets(tickets, at).await
        }
        async fn get_ticket(&self, key: &str) -> Result<Option<StoredTicket>, StoreError> {
            self.inner.get_ticket(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_upsert_times_out_and_next_row_still_lands() {
        let store = Arc::new(StallingStore {
            inner: MemoryTicketStore::with_source(vec![
                record("T-STUCK", "2024-01-01 09:10", "a"),
                record("T-NEXT", "2024-01-01 09:20", "b"),
            ]),
            stuck_key: "T-STUCK",
        });
        let config = SyncConfig {
            upsert_timeout_secs: 5,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(store.clone(), Arc::new(ManualClock::new(now())), &config).unwrap();

        let started = tokio::time::Instant::now();
        let report = completed(engine.run_tick().await.unwrap());
        assert_eq!(report.candidates_found, 2);
        assert_eq!(report.errored, 1);
        assert_eq!(report.inserted, 1);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(store.get_ticket("T-STUCK").await.unwrap().is_none());
        assert!(store.get_ticket("T-NEXT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let store = Arc::new(GatedStore {
            inner: MemoryTicketStore::with_source(vec![record("T-1", "2024-01-01 09:30", "a")]),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let engine = Arc::new(
            SyncEngine::new(store.clone(), Arc::new(ManualClock::new(now())), &SyncConfig::default())
                .unwrap(),
        );

        let slow = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_tick().await }
        });
        store.entered.notified().await;

        assert_eq!(engine.run_tick().await.unwrap(), TickOutcome::Skipped);

        store.release.notify_one();
        let report = completed(slow.await.unwrap().unwrap());
        assert_eq!(report.inserted, 1);
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(TickOutcome::Skipped).unwrap();
        assert_eq!(json, serde_json::json!({ "outcome": "skipped" }));
    }
}
