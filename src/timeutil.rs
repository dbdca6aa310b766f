// ============================================================================
// SECTION 5: TIME & TIMESTAMPS
// ============================================================================
// Every timestamp inside the engine is a `DateTime<Utc>`. Snapshot sources
// mix RFC 3339, space-separated and timezone-less forms; naive values are
// taken to be UTC.
// ============================================================================

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ForensicsResult, InputError};

/// UTC timestamp alias used across the crate.
pub type Timestamp = DateTime<Utc>;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Parse a timestamp in any of the snapshot formats.
pub fn parse_time(raw: &str) -> Option<Timestamp> {
    let s = raw.trim().trim_matches('"');
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive = s.trim_end_matches('Z').trim_end_matches(" UTC");
    for fmt in NAIVE_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| Utc.from_utc_datetime(&ndt))
}

/// Parse an optional caller-supplied bound, rejecting garbage instead of ignoring it.
pub fn parse_bound(name: &str, raw: Option<&str>) -> ForensicsResult<Option<Timestamp>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => parse_time(s)
            .map(Some)
            .ok_or_else(|| InputError::invalid_time(format!("cannot parse {} '{}'", name, s)).into()),
    }
}

/// Parse `5m`, `1h`, `30s`, `1d` style durations.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    humantime::parse_duration(s).ok()
}

/// Kubernetes-style timestamp: `2025-01-01T10:00:00Z`.
pub fn format_k8s_time(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// RFC 3339 with a `Z` suffix and only as much sub-second precision as needed.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Human readable latency for a millisecond value.
pub fn format_latency(ms: f64) -> String {
    if ms < 1.0 {
        format!("{:.2}ms", ms)
    } else if ms < 1000.0 {
        format!("{:.0}ms", ms)
    } else if ms < 60_000.0 {
        format!("{:.1}s", ms / 1000.0)
    } else {
        format!("{:.1}m", ms / 60_000.0)
    }
}

/// Human readable per-second rate.
pub fn format_rate(rate: f64) -> String {
    if rate < 1.0 {
        format!("{:.2}/s", rate)
    } else {
        format!("{:.0}/s", rate)
    }
}

/// Compact duration label for minutes: `<1m`, `42m`, `3h 5m`, `2d 4h`.
pub fn format_minutes(minutes: f64) -> String {
    if minutes < 1.0 {
        "<1m".to_string()
    } else if minutes < 60.0 {
        format!("{}m", minutes as u64)
    } else if minutes < 1440.0 {
        let m = minutes as u64;
        format!("{}h {}m", m / 60, m % 60)
    } else {
        let m = minutes as u64;
        format!("{}d {}h", m / 1440, (m % 1440) / 60)
    }
}

// ----------------------------------------------------------------------------
// 5.1 Time Window
// ----------------------------------------------------------------------------

/// Optional, inclusive time bounds of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimeWindow {
    /// Unbounded window.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> ForensicsResult<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(InputError::invalid_time(format!(
                    "start {} is after end {}",
                    format_timestamp(&s),
                    format_timestamp(&e)
                ))
                .into());
            }
        }
        Ok(Self { start, end })
    }

    /// Build from raw caller strings.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> ForensicsResult<Self> {
        Self::new(parse_bound("start_time", start)?, parse_bound("end_time", end)?)
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// Inclusive containment; open bounds are unbounded.
    pub fn contains(&self, ts: &Timestamp) -> bool {
        self.start.map_or(true, |s| *ts >= s) && self.end.map_or(true, |e| *ts <= e)
    }

    /// Containment for an optional timestamp: unknown times only pass an unbounded window.
    pub fn contains_opt(&self, ts: Option<&Timestamp>) -> bool {
        match ts {
            Some(t) => self.contains(t),
            None => !self.is_bounded(),
        }
    }
}

#[cfg(test)]
mod timeutil_tests {
    use super::*;
    use test_case::test_case;

    #[test_case("2025-01-01T10:00:00Z" ; "rfc3339 zulu")]
    #[test_case("2025-01-01T10:00:00+00:00" ; "rfc3339 offset")]
    #[test_case("2025-01-01 10:00:00" ; "naive space")]
    #[test_case("2025-01-01T10:00:00.000" ; "naive fractional")]
    #[test_case("2025-01-01 10:00:00+00:00" ; "space with offset")]
    fn test_parse_time_variants(raw: &str) {
        let ts = parse_time(raw);
        assert_eq!(ts.map(|t| format_k8s_time(&t)), Some("2025-01-01T10:00:00Z".to_string()));
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert!(parse_time("yesterday").is_none());
        assert!(parse_time("").is_none());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_formatters() {
        assert_eq!(format_latency(0.5), "0.50ms");
        assert_eq!(format_latency(250.0), "250ms");
        assert_eq!(format_latency(2500.0), "2.5s");
        assert_eq!(format_latency(120_000.0), "2.0m");
        assert_eq!(format_rate(0.25), "0.25/s");
        assert_eq!(format_rate(12.4), "12/s");
        assert_eq!(format_minutes(0.4), "<1m");
        assert_eq!(format_minutes(125.0), "2h 5m");
        assert_eq!(format_minutes(1500.0), "1d 1h");
    }

    #[test]
    fn test_window_rejects_inverted_bounds() {
        let err = TimeWindow::parse(Some("2025-01-02T00:00:00Z"), Some("2025-01-01T00:00:00Z"));
        assert!(err.is_err());
    }

    #[test]
    fn test_window_contains_inclusive() {
        let w = TimeWindow::parse(Some("2025-01-01T00:00:00Z"), Some("2025-01-01T01:00:00Z")).unwrap();
        assert!(w.contains(&parse_time("2025-01-01T01:00:00Z").unwrap()));
        assert!(!w.contains(&parse_time("2025-01-01T01:00:01Z").unwrap()));
        assert!(!w.contains_opt(None));
        assert!(TimeWindow::all().contains_opt(None));
    }
}
