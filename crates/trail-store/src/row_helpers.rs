use chrono::{DateTime, Utc};
use trail_core::clock::{from_millis, to_millis};
use trail_core::fingerprint::Fingerprint;
use trail_core::ids::SessionId;
use trail_core::model::Tracking;

use crate::error::StoreError;

/// Columns shared by `tabs` and `windows`, in the order [`read_tracking`] expects.
pub const TRACKING_COLUMNS: &str = "volatile_id, fingerprint, session_id, created_at, \
     last_active_at, active_duration_ms, closed_at, tags, notes, metadata";

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

pub fn get_time(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    get::<i64>(row, idx, table, column).map(from_millis)
}

pub fn get_time_opt(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(get_opt::<i64>(row, idx, table, column)?.map(from_millis))
}

pub fn millis_opt(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_millis)
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Read the [`TRACKING_COLUMNS`] block starting at column `start`.
pub fn read_tracking(
    row: &rusqlite::Row<'_>,
    start: usize,
    table: &'static str,
) -> Result<Tracking, StoreError> {
    let tags_raw: String = get(row, start + 7, table, "tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_raw).map_err(|e| StoreError::CorruptRow {
        table,
        column: "tags",
        detail: format!("invalid JSON: {e}"),
    })?;
    let metadata_raw: String = get(row, start + 9, table, "metadata")?;

    Ok(Tracking {
        volatile_id: get(row, start, table, "volatile_id")?,
        fingerprint: get_opt::<String>(row, start + 1, table, "fingerprint")?.map(Fingerprint::from_raw),
        session_id: SessionId::from_raw(get::<String>(row, start + 2, table, "session_id")?),
        created_at: get_time(row, start + 3, table, "created_at")?,
        last_active_at: get_time(row, start + 4, table, "last_active_at")?,
        active_duration_ms: get(row, start + 5, table, "active_duration_ms")?,
        closed_at: get_time_opt(row, start + 6, table, "closed_at")?,
        tags,
        notes: get_opt(row, start + 8, table, "notes")?,
        metadata: parse_json(&metadata_raw, table, "metadata")?,
    })
}

/// Escape LIKE special characters for safe pattern matching.
pub fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
