use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone, Utc};

use crate::error::MonitorError;

/// Single source of "now". Storage is always UTC regardless of display
/// policy.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse the timestamp formats accepted on the wire and in storage:
/// RFC3339 (with or without fractional seconds), `YYYY-MM-DD HH:MM:SS[.ffffff]
/// [±ZZZZ]`, and `YYYY-MM-DDTHH:MM:SS[Z]`. Zone-less inputs are taken as UTC.
pub fn parse(text: &str) -> Result<DateTime<Utc>, MonitorError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(MonitorError::validation("empty timestamp"));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(MonitorError::validation(format!(
        "unrecognized timestamp: {text:?}"
    )))
}

/// Canonical wire form: nanosecond-precision RFC3339 in UTC.
pub fn format_wire(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Canonical DB text form: `YYYY-MM-DD HH:MM:SS` in UTC. Lexicographic order
/// matches chronological order, which the sqlite backend relies on.
pub fn format_db(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Display policy. Parsing and storage are always UTC; only rendering for
/// humans may honor a configured zone offset.
#[derive(Debug, Clone, Copy)]
pub struct TimePolicy {
    display_offset: FixedOffset,
    enforce_utc: bool,
}

impl Default for TimePolicy {
    fn default() -> Self {
        Self {
            display_offset: FixedOffset::east_opt(0).unwrap(),
            enforce_utc: true,
        }
    }
}

impl TimePolicy {
    /// `zone` accepts "UTC", an empty string, or a fixed offset like "+02:00".
    pub fn new(zone: &str, enforce_utc: bool) -> Result<Self, MonitorError> {
        let zone = zone.trim();
        let display_offset = if zone.is_empty() || zone.eq_ignore_ascii_case("utc") {
            FixedOffset::east_opt(0).unwrap()
        } else {
            zone.parse::<FixedOffset>().map_err(|_| {
                MonitorError::config(format!(
                    "DEFAULT_TIMEZONE must be \"UTC\" or a fixed offset like \"+02:00\", got {zone:?}"
                ))
            })?
        };
        Ok(Self {
            display_offset,
            enforce_utc,
        })
    }

    /// Render for display. With UTC enforcement on (the default) this is the
    /// wire form; otherwise the configured offset applies.
    pub fn display(&self, instant: DateTime<Utc>) -> String {
        if self.enforce_utc {
            format_wire(instant)
        } else {
            instant
                .with_timezone(&self.display_offset)
                .to_rfc3339_opts(SecondsFormat::Nanos, false)
        }
    }
}

/// Delta between two cumulative counters. A counter reset (current below
/// previous, e.g. after a host reboot) yields `current`, never a negative
/// or inflated value.
pub fn counter_delta(current: u64, previous: u64) -> u64 {
    if current < previous {
        current
    } else {
        current - previous
    }
}

/// Per-second rate for a counter delta. Elapsed time is clamped to one
/// second so a burst of samples cannot divide by zero.
pub fn rate(delta: u64, elapsed_seconds: u64) -> f64 {
    delta as f64 / elapsed_seconds.max(1) as f64
}
