//! Total conversions from loosely typed source text into canonical values.
//!
//! None of these functions fail: malformed input degrades to `None` (or `false` for flags).
//! Every path that turns a [`SourceRecord`] into a [`Ticket`] goes through [`normalize_ticket`].

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::{SourceRecord, Ticket};

/// Text some upstream exporters write instead of leaving an unparsable date empty.
const INVALID_DATE_SENTINEL: &str = "invalid date";

const TRUE_TOKENS: [&str; 5] = ["true", "1", "si", "sí", "yes"];

/// Characters stripped from both ends of source text. `tksync_trim` in the migrations strips the
/// same set, so keys group identically in Rust and in SQL.
pub const SOURCE_WHITESPACE: [char; 6] = [' ', '\t', '\n', '\r', '\x0B', '\x0C'];

const OFFSET_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%d %H:%M%#z",
    "%Y-%m-%dT%H:%M%#z",
];

const NAIVE_DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];

/// Strips [`SOURCE_WHITESPACE`] from both ends.
pub fn trim_source(value: &str) -> &str {
    value.trim_matches(SOURCE_WHITESPACE)
}

/// Trims text; an empty string stays empty rather than becoming `None`.
pub fn normalize_string(value: Option<&str>) -> Option<String> {
    value.map(|v| trim_source(v).to_string())
}

/// Parses a wall-clock timestamp. Explicit offsets are dropped and the written wall-clock time is
/// kept, matching how the target column stores naive timestamps.
pub fn normalize_timestamp(value: Option<&str>) -> Option<NaiveDateTime> {
    let raw = trim_source(value?);
    if raw.is_empty() || raw.eq_ignore_ascii_case(INVALID_DATE_SENTINEL) {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_local());
    }
    for format in OFFSET_DATETIME_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Some(parsed.naive_local());
        }
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed);
        }
    }
    DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(raw, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })
}

/// Missing values are `false`; only the accepted truthy tokens are `true`.
pub fn normalize_boolean(value: Option<&str>) -> bool {
    value
        .map(|v| trim_source(v).to_lowercase())
        .is_some_and(|token| TRUE_TOKENS.contains(&token.as_str()))
}

/// Accepts both `12.345` and the comma-decimal `12,345`.
pub fn normalize_decimal(value: Option<&str>) -> Option<f64> {
    let raw = trim_source(value?);
    if raw.is_empty() {
        return None;
    }
    raw.replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
}

/// Normalizes a whole source row. Returns `None` when the business key is missing or blank.
pub fn normalize_ticket(record: &SourceRecord) -> Option<Ticket> {
    let ticket = normalize_string(record.ticket.as_deref()).filter(|key| !key.is_empty())?;

    Some(Ticket {
        ticket,
        status: normalize_string(record.status.as_deref()),
        visit_at: normalize_timestamp(record.visit_at.as_deref()),
        modified_at: normalize_timestamp(record.modified_at.as_deref()),
        it_modified_at: normalize_timestamp(record.it_modified_at.as_deref()),
        technician_id: normalize_string(record.technician_id.as_deref()),
        technician_name: normalize_string(record.technician_name.as_deref()),
        client_id: normalize_string(record.client_id.as_deref()),
        client_name: normalize_string(record.client_name.as_deref()),
        contact_name: normalize_string(record.contact_name.as_deref()),
        contact_phone: normalize_string(record.contact_phone.as_deref()),
        contact_email: normalize_string(record.contact_email.as_deref()),
        address: normalize_string(record.address.as_deref()),
        city: normalize_string(record.city.as_deref()),
        region: normalize_string(record.region.as_deref()),
        latitude: normalize_decimal(record.latitude.as_deref()),
        longitude: normalize_decimal(record.longitude.as_deref()),
        equipment_serial: normalize_string(record.equipment_serial.as_deref()),
        equipment_model: normalize_string(record.equipment_model.as_deref()),
        comments: normalize_string(record.comments.as_deref()),
        visit_executed: normalize_boolean(record.visit_executed.as_deref()),
        spare_part_required: normalize_boolean(record.spare_part_required.as_deref()),
        client_signed: normalize_boolean(record.client_signed.as_deref()),
    })
}
