//! Source/target store access for the reconciliation engine.
//!
//! [`TicketStore`] is the seam between the engine and the shared relational store. The Postgres
//! implementation pushes selection into set-based SQL; the in-memory implementation mirrors the
//! same semantics row by row and backs the test suites.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tksync_core::{DateRange, SourceRecord, StoredTicket, Ticket, WatchedField};

mod memory;
mod pg;

pub use memory::MemoryTicketStore;
pub use pg::{PgStoreOptions, PgTicketStore, MIGRATOR};

pub const CRATE_NAME: &str = "tksync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Parameters of one incremental selection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    /// Inclusive lower bound on the source change timestamp.
    pub window_start: NaiveDateTime,
    pub watched: Vec<WatchedField>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
}

/// Every read works on the latest revision per business key: the source row with the greatest
/// parsable change timestamp, unparsable timestamps ranking last and later rows winning ties.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Latest revisions that changed inside the window, have no target row, or diverge on a
    /// watched field. Oldest change first, capped at `query.limit`.
    async fn select_candidates(&self, query: &CandidateQuery) -> Result<Vec<SourceRecord>, StoreError>;

    /// Match-or-insert one ticket keyed by its business key.
    async fn upsert_ticket(
        &self,
        ticket: &Ticket,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Up to `limit` latest revisions with a non-blank key that has no target row yet, by key.
    async fn next_backfill_batch(&self, limit: usize) -> Result<Vec<SourceRecord>, StoreError>;

    /// Inserts tickets whose key is absent; existing rows are left untouched. Returns the number
    /// of rows inserted.
    async fn insert_new_tickets(
        &self,
        tickets: &[Ticket],
        synced_at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Latest revisions with a non-blank key whose visit or change timestamp falls in `range`.
    async fn select_resync_range(&self, range: &DateRange) -> Result<Vec<SourceRecord>, StoreError>;

    /// One set-based match-or-insert over `tickets`. Keys must be unique within the slice.
    async fn merge_tickets(
        &self,
        tickets: &[Ticket],
        synced_at: DateTime<Utc>,
    ) -> Result<MergeCounts, StoreError>;

    async fn get_ticket(&self, key: &str) -> Result<Option<StoredTicket>, StoreError>;
}
