//! Core domain model for the ticket reconciliation engine: raw source rows, canonical tickets,
//! the field normalizer and the change window.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod normalize;
pub mod window;

pub use normalize::{
    normalize_boolean, normalize_decimal, normalize_string, normalize_ticket, normalize_timestamp,
    trim_source, SOURCE_WHITESPACE,
};
pub use window::{DateRange, SyncWindow, WindowSelector, MAX_LOOKBACK_HOURS};

pub const CRATE_NAME: &str = "tksync-core";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown watched field `{0}`")]
    UnknownWatchedField(String),
    #[error("utc offset of {0} minutes is out of range")]
    InvalidUtcOffset(i32),
    #[error("lookback of {0} hours is out of range (1..={max})", max = window::MAX_LOOKBACK_HOURS)]
    InvalidLookback(u32),
}

/// One row of the externally owned source table. Every column is free text and the business
/// key may repeat across revisions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceRecord {
    pub ticket: Option<String>,
    pub status: Option<String>,
    pub visit_at: Option<String>,
    pub modified_at: Option<String>,
    pub it_modified_at: Option<String>,
    pub technician_id: Option<String>,
    pub technician_name: Option<String>,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub equipment_serial: Option<String>,
    pub equipment_model: Option<String>,
    pub comments: Option<String>,
    pub visit_executed: Option<String>,
    pub spare_part_required: Option<String>,
    pub client_signed: Option<String>,
}

impl SourceRecord {
    /// Business key as used for grouping revisions: trimmed, with a missing key folded into "".
    pub fn business_key(&self) -> String {
        normalize_string(self.ticket.as_deref()).unwrap_or_default()
    }

    /// Primary change signal of the row.
    pub fn change_timestamp(&self) -> Option<NaiveDateTime> {
        normalize_timestamp(self.it_modified_at.as_deref())
    }
}

/// Canonical, strongly typed ticket as written to the target store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket: String,
    pub status: Option<String>,
    pub visit_at: Option<NaiveDateTime>,
    pub modified_at: Option<NaiveDateTime>,
    pub it_modified_at: Option<NaiveDateTime>,
    pub technician_id: Option<String>,
    pub technician_name: Option<String>,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub equipment_serial: Option<String>,
    pub equipment_model: Option<String>,
    pub comments: Option<String>,
    pub visit_executed: bool,
    pub spare_part_required: bool,
    pub client_signed: bool,
}

/// A target row: the canonical ticket plus the time of its last successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTicket {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub last_sync: DateTime<Utc>,
}

/// High-churn fields compared directly between source and target because upstream does not
/// always bump the change timestamp when they move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchedField {
    Status,
    TechnicianId,
    TechnicianName,
    ModifiedAt,
}

impl WatchedField {
    pub const ALL: [WatchedField; 4] = [
        WatchedField::Status,
        WatchedField::TechnicianId,
        WatchedField::TechnicianName,
        WatchedField::ModifiedAt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchedField::Status => "status",
            WatchedField::TechnicianId => "technician_id",
            WatchedField::TechnicianName => "technician_name",
            WatchedField::ModifiedAt => "modified_at",
        }
    }

    /// Whether the normalized source value disagrees with what the target holds.
    pub fn differs(&self, source: &Ticket, target: &Ticket) -> bool {
        match self {
            WatchedField::Status => source.status != target.status,
            WatchedField::TechnicianId => source.technician_id != target.technician_id,
            WatchedField::TechnicianName => source.technician_name != target.technician_name,
            WatchedField::ModifiedAt => source.modified_at != target.modified_at,
        }
    }

    /// Parses a comma separated list such as `status, technician_id`. Blank input yields an
    /// empty list, which disables the divergence check.
    pub fn parse_list(input: &str) -> Result<Vec<WatchedField>, CoreError> {
        let mut fields = Vec::new();
        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let field = part.parse::<WatchedField>()?;
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        Ok(fields)
    }
}

impl fmt::Display for WatchedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchedField {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        WatchedField::ALL
            .into_iter()
            .find(|field| field.as_str() == needle)
            .ok_or_else(|| CoreError::UnknownWatchedField(s.trim().to_string()))
    }
}

/// Source of "now" for the engine, injectable so ticks can be driven deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, value: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = value;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
