//! UTC time handling and canonical status time strings

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder rendered for unset status times
pub const UNSET_TIME: &str = "-";

/// A point in time pinned to UTC.
///
/// Range filters and watermarks only accept this representation, so a value
/// constructed from any zone-aware input always satisfies `Location()==UTC`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimeInUtc(DateTime<Utc>);

impl TimeInUtc {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime<Tz: TimeZone>(dt: DateTime<Tz>) -> Self {
        Self(dt.with_timezone(&Utc))
    }

    pub fn from_rfc3339(s: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| Error::Validation(format!("invalid RFC3339 time {s:?}: {e}")))
    }

    pub fn from_epoch_millis(millis: i64) -> Result<Self> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self)
            .ok_or_else(|| Error::Validation(format!("epoch millis out of range: {millis}")))
    }

    pub fn epoch_millis(self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn inner(self) -> DateTime<Utc> {
        self.0
    }

    /// Canonical rendering used in persisted statuses
    pub fn canonical(self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl fmt::Display for TimeInUtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<DateTime<Utc>> for TimeInUtc {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

/// Render an optional time as a canonical status string ("-" when unset)
pub fn format_time(t: Option<TimeInUtc>) -> String {
    t.map_or_else(|| UNSET_TIME.to_string(), |t| t.canonical())
}

/// Parse a canonical status string back; "-" and "" mean unset
pub fn parse_time(s: &str) -> Result<Option<TimeInUtc>> {
    if s.is_empty() || s == UNSET_TIME {
        return Ok(None);
    }
    TimeInUtc::from_rfc3339(s).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn construction_pins_to_utc() {
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();
        let t = TimeInUtc::from_datetime(local);
        assert_eq!(t.inner().timezone(), Utc);
        assert_eq!(t.canonical(), "2026-08-01T00:00:00Z");
    }

    #[test]
    fn unset_round_trip() {
        assert_eq!(format_time(None), "-");
        assert_eq!(parse_time("-").unwrap(), None);
        assert_eq!(parse_time("").unwrap(), None);
    }

    #[test]
    fn set_round_trip() {
        let t = TimeInUtc::from_rfc3339("2026-08-01T10:05:00Z").unwrap();
        let s = format_time(Some(t));
        assert_eq!(parse_time(&s).unwrap(), Some(t));
    }

    #[test]
    fn epoch_millis_round_trip() {
        let t = TimeInUtc::from_rfc3339("2026-08-01T10:05:00Z").unwrap();
        assert_eq!(TimeInUtc::from_epoch_millis(t.epoch_millis()).unwrap(), t);
    }
}
