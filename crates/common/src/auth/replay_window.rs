use crate::domain::{DomainError, DomainResult};
use chrono::{DateTime, TimeDelta, Utc};

/// Default tolerated clock skew between device and server.
pub const DEFAULT_REPLAY_WINDOW_MS: u64 = 300_000;

/// Bounds the clock skew accepted on signed submissions.
///
/// The bound is inclusive and symmetric: timestamps up to `max_skew` in
/// the past or in the future are accepted.
#[derive(Debug, Clone, Copy)]
pub struct ReplayWindow {
    max_skew: TimeDelta,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::from_millis(DEFAULT_REPLAY_WINDOW_MS)
    }
}

impl ReplayWindow {
    pub fn from_millis(max_skew_ms: u64) -> Self {
        let max_skew_ms = i64::try_from(max_skew_ms).unwrap_or(i64::MAX);
        Self {
            max_skew: TimeDelta::try_milliseconds(max_skew_ms).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn is_valid(&self, timestamp: &str) -> bool {
        self.is_valid_at(timestamp, Utc::now())
    }

    pub fn is_valid_at(&self, timestamp: &str, now: DateTime<Utc>) -> bool {
        match parse_timestamp(timestamp) {
            Some(parsed) => (now - parsed).abs() <= self.max_skew,
            None => false,
        }
    }

    pub fn check(&self, timestamp: &str) -> DomainResult<()> {
        if self.is_valid(timestamp) {
            Ok(())
        } else {
            Err(DomainError::ReplayRejected(timestamp.to_string()))
        }
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
