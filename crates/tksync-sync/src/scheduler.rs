//! Drives [`SyncEngine`] ticks from an injectable ticker until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::engine::{SyncEngine, TickOutcome};

/// Source of tick signals. `tick` resolves once per firing and returns `false` when the source
/// is exhausted.
#[async_trait]
pub trait Ticker: Send {
    async fn tick(&mut self) -> bool;

    async fn stop(&mut self) {}
}

pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// First firing one `period` from now; the scheduler runs its own eager tick at startup.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks on demand through a bounded channel. Closing every sender ends the run once pending
/// ticks are consumed.
pub struct ChannelTicker {
    rx: mpsc::Receiver<()>,
}

impl ChannelTicker {
    pub fn new(capacity: usize) -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl Ticker for ChannelTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// Cron-driven ticker. Firings that arrive while one is still pending are coalesced.
pub struct CronTicker {
    scheduler: JobScheduler,
    rx: mpsc::Receiver<()>,
}

impl CronTicker {
    pub async fn start(expr: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<()>(1);
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let job = Job::new_async(expr, move |_uuid, _l| {
            let tx = tx.clone();
            Box::pin(async move {
                forward_firing(&tx);
            })
        })
        .with_context(|| format!("creating scheduler job for cron {expr}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;
        scheduler.start().await.context("starting scheduler")?;
        Ok(Self { scheduler, rx })
    }
}

/// Pushes one firing into the tick channel. A full channel already holds a pending tick, so the
/// firing is coalesced; a closed one means the scheduler loop has gone away.
fn forward_firing(tx: &mpsc::Sender<()>) -> bool {
    match tx.try_send(()) {
        Ok(()) => true,
        Err(TrySendError::Full(())) => {
            debug!("tick already pending; coalescing cron firing");
            true
        }
        Err(TrySendError::Closed(())) => {
            warn!("tick receiver dropped; cron firing lost");
            false
        }
    }
}

#[async_trait]
impl Ticker for CronTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    async fn stop(&mut self) {
        if let Err(err) = self.scheduler.shutdown().await {
            error!(error = %err, "scheduler shutdown failed");
        }
    }
}

/// Plain interval when `sync_interval_secs` is set, the cron expression otherwise.
pub async fn ticker_from_config(config: &SyncConfig) -> Result<Box<dyn Ticker>> {
    match config.sync_interval_secs {
        Some(secs) => Ok(Box::new(IntervalTicker::new(Duration::from_secs(secs)))),
        None => Ok(Box::new(CronTicker::start(&config.sync_cron).await?)),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub ticks_started: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SchedulerStats {
    fn record(&mut self, joined: Result<Result<TickOutcome>, JoinError>) {
        match joined {
            Ok(Ok(TickOutcome::Completed(_))) => self.completed += 1,
            Ok(Ok(TickOutcome::Skipped)) => self.skipped += 1,
            // already logged inside the tick
            Ok(Err(_)) => self.failed += 1,
            Err(err) => {
                error!(error = %err, "sync tick task panicked");
                self.failed += 1;
            }
        }
    }
}

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    /// Runs one tick immediately, then one per ticker firing until `shutdown` resolves or the
    /// ticker is exhausted. In-flight ticks are drained before returning.
    pub async fn run<T, F>(&self, ticker: &mut T, shutdown: F) -> SchedulerStats
    where
        T: Ticker + ?Sized,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = SchedulerStats::default();
        let mut in_flight = JoinSet::new();
        self.spawn_tick(&mut in_flight, &mut stats);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping scheduler");
                    break;
                }
                fired = ticker.tick() => {
                    if !fired {
                        info!("ticker exhausted; stopping scheduler");
                        break;
                    }
                    self.spawn_tick(&mut in_flight, &mut stats);
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    stats.record(joined);
                }
            }
        }

        ticker.stop().await;
        while let Some(joined) = in_flight.join_next().await {
            stats.record(joined);
        }
        info!(
            started = stats.ticks_started,
            completed = stats.completed,
            skipped = stats.skipped,
            failed = stats.failed,
            "scheduler stopped"
        );
        stats
    }

    fn spawn_tick(&self, in_flight: &mut JoinSet<Result<TickOutcome>>, stats: &mut SchedulerStats) {
        let engine = self.engine.clone();
        in_flight.spawn(async move { engine.run_tick().await });
        stats.ticks_started += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tksync_core::{ManualClock, SourceRecord};
    use tksync_storage::{MemoryTicketStore, TicketStore};

    fn engine(store: Arc<MemoryTicketStore>) -> Arc<SyncEngine> {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).single().unwrap());
        Arc::new(SyncEngine::new(store, Arc::new(clock), &SyncConfig::default()).unwrap())
    }

    fn source() -> Arc<MemoryTicketStore> {
        Arc::new(MemoryTicketStore::with_source(vec![SourceRecord {
            ticket: Some("T-1".into()),
            it_modified_at: Some("2024-01-01 09:30".into()),
            ..SourceRecord::default()
        }]))
    }

    #[tokio::test]
    async fn eager_run_plus_one_per_tick() {
        let store = source();
        let scheduler = SyncScheduler::new(engine(store.clone()));
        let (tx, mut ticker) = ChannelTicker::new(4);
        tx.send(()).await.unwrap();
        tx.send(()).await.unwrap();
        drop(tx);

        let stats = scheduler.run(&mut ticker, std::future::pending()).await;
        assert_eq!(stats.ticks_started, 3);
        assert_eq!(stats.completed + stats.skipped, 3);
        assert!(stats.completed >= 1);
        assert_eq!(stats.failed, 0);
        assert!(store.get_ticket("T-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn shutdown_stops_waiting_for_ticks() {
        let scheduler = SyncScheduler::new(engine(source()));
        let (_tx, mut ticker) = ChannelTicker::new(1);
        let stats = scheduler.run(&mut ticker, async {}).await;
        assert_eq!(stats.ticks_started, 1);
        assert_eq!(stats.completed + stats.skipped + stats.failed, 1);
    }

    #[tokio::test]
    async fn failing_ticks_are_counted() {
        let store = source();
        store.set_offline(true).await;
        let scheduler = SyncScheduler::new(engine(store));
        let (tx, mut ticker) = ChannelTicker::new(1);
        drop(tx);
        let stats = scheduler.run(&mut ticker, std::future::pending()).await;
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn cron_firings_coalesce_and_report_closed_receiver() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward_firing(&tx));
        assert!(forward_firing(&tx));
        assert_eq!(rx.recv().await, Some(()));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!forward_firing(&tx));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticker_fires_each_period() {
        let scheduler = SyncScheduler::new(engine(source()));
        let mut ticker = IntervalTicker::new(Duration::from_secs(60));
        let stats = scheduler
            .run(&mut ticker, tokio::time::sleep(Duration::from_secs(150)))
            .await;
        assert_eq!(stats.ticks_started, 3);
        assert_eq!(stats.failed, 0);
    }
}
