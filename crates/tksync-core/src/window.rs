//! Rolling change window used to bound incremental candidate selection.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;

use crate::CoreError;

/// Horizon for one tick, expressed in the source system's wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub start: NaiveDateTime,
    pub now: NaiveDateTime,
}

impl SyncWindow {
    pub fn contains(&self, stamp: NaiveDateTime) -> bool {
        stamp >= self.start
    }
}

/// Half-open range `[from, to)` of source wall-clock time, used by the repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

impl DateRange {
    pub fn new(from: NaiveDateTime, to: NaiveDateTime) -> Option<Self> {
        (from < to).then_some(Self { from, to })
    }

    /// The whole calendar day `date`, or `None` for the last date chrono can represent.
    pub fn day(date: NaiveDate) -> Option<Self> {
        let from = date.and_time(NaiveTime::MIN);
        let to = from.checked_add_signed(Duration::days(1))?;
        Some(Self { from, to })
    }

    pub fn contains(&self, stamp: NaiveDateTime) -> bool {
        stamp >= self.from && stamp < self.to
    }
}

/// Ten years; far beyond any useful window and safely inside chrono's range.
pub const MAX_LOOKBACK_HOURS: u32 = 24 * 365 * 10;

#[derive(Debug, Clone, Copy)]
pub struct WindowSelector {
    lookback: Duration,
    source_offset: FixedOffset,
}

impl WindowSelector {
    pub fn new(lookback_hours: u32, source_utc_offset_minutes: i32) -> Result<Self, CoreError> {
        let source_offset = source_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(CoreError::InvalidUtcOffset(source_utc_offset_minutes))?;
        if lookback_hours == 0 || lookback_hours > MAX_LOOKBACK_HOURS {
            return Err(CoreError::InvalidLookback(lookback_hours));
        }
        Ok(Self {
            lookback: Duration::hours(i64::from(lookback_hours)),
            source_offset,
        })
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Converts an instant into the wall-clock time the source system writes.
    pub fn source_local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.source_offset).naive_local()
    }

    pub fn source_today(&self, now: DateTime<Utc>) -> NaiveDate {
        self.source_local(now).date()
    }

    pub fn window_at(&self, now: DateTime<Utc>) -> SyncWindow {
        let local = self.source_local(now);
        SyncWindow {
            // Clamps instead of overflowing near chrono's lower bound.
            start: local
                .checked_sub_signed(self.lookback)
                .unwrap_or(NaiveDateTime::MIN),
            now: local,
        }
    }
}
