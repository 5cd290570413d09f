//! Shared utility functions for scanguard.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

const SECONDS_PER_DAY: i64 = 86400;

/// Source of wall-clock time for ledger and sync decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_to_secs(Utc::now())
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
            now: Mutex::new(truncate_to_secs(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = truncate_to_secs(to);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Timestamps are stored with second precision.
pub fn truncate_to_secs(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

pub fn from_epoch(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Parse an ISO-8601 duration such as `P30D`, `P1W` or `P1DT12H`.
///
/// Years count as 365 days and months as 30 days. Fractions are not supported.
pub fn parse_iso8601_duration(input: &str) -> Option<Duration> {
    let rest = input.trim().strip_prefix('P')?;
    if rest.is_empty() {
        return None;
    }

    let mut seconds: i64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    let mut saw_component = false;

    for c in rest.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        if c == 'T' {
            if in_time || !number.is_empty() {
                return None;
            }
            in_time = true;
            continue;
        }

        let value: i64 = number.parse().ok()?;
        number.clear();
        let unit = match (in_time, c) {
            (false, 'Y') => 365 * SECONDS_PER_DAY,
            (false, 'M') => 30 * SECONDS_PER_DAY,
            (false, 'W') => 7 * SECONDS_PER_DAY,
            (false, 'D') => SECONDS_PER_DAY,
            (true, 'H') => 3600,
            (true, 'M') => 60,
            (true, 'S') => 1,
            _ => return None,
        };
        seconds = seconds.checked_add(value.checked_mul(unit)?)?;
        saw_component = true;
    }

    if !number.is_empty() || !saw_component {
        return None;
    }
    Some(Duration::seconds(seconds))
}
