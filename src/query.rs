use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::clock;
use crate::error::MonitorError;
use crate::storage::Storage;

/// Resolve (table, from, to) against a backend and return the stored
/// documents newest-first, downsampled when the range is large.
///
/// Both paths satisfy the same contract: at most `max_points` rows when
/// downsampling is enabled, strict `timestamp DESC` order, and every row
/// inside the inclusive bounds. Filtering is always on the `timestamp`
/// column; `created_at` is ingestion metadata and never substitutes.
pub async fn run(
    storage: &Storage,
    table: &str,
    from: Option<&str>,
    to: Option<&str>,
    max_points: i64,
) -> Result<Vec<Value>, MonitorError> {
    let (from, to) = normalize_bounds(from, to)?;

    let count = storage.count(table, from, to).await?;
    if count == 0 {
        return Ok(vec![]);
    }

    let downsample = max_points > 0 && count > max_points as u64;
    let entries = if downsample {
        debug!(table, count, max_points, "Downsampling query result");
        storage
            .query_bucketed(table, from, to, max_points as usize)
            .await?
    } else {
        storage.query(table, from, to).await?
    };

    Ok(entries.into_iter().map(|e| e.data).collect())
}

/// Parse optional bounds, treating blank strings as absent, and reject an
/// inverted range.
pub fn normalize_bounds(
    from: Option<&str>,
    to: Option<&str>,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), MonitorError> {
    let parse_opt = |bound: Option<&str>| -> Result<Option<DateTime<Utc>>, MonitorError> {
        match bound.map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => clock::parse(text).map(Some),
        }
    };

    let from = parse_opt(from)?;
    let to = parse_opt(to)?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(MonitorError::validation(format!(
                "from ({}) is after to ({})",
                clock::format_wire(f),
                clock::format_wire(t)
            )));
        }
    }
    Ok((from, to))
}
