//! Points in time as stored in record headers and embedded in subfile names.
//!
//! A [`TimeValue`] is a count of microseconds since the Unix epoch. All
//! renderings are in UTC so that a filename always maps back to the same
//! instant regardless of the host timezone.

use std::fmt;
use std::ops::Sub;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::error::FormatError;

const MICROS_PER_SEC: i64 = 1_000_000;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeValue(i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeFormat {
    /// `YYYYMMDD_HHMMSS`
    Compact,
    /// `YYYYMMDD_HHMMSS_ffffff`
    CompactMicro,
    /// `YYYY-MM-DD HH:MM:SS.ffffff`
    Pretty,
    /// Decimal seconds since the epoch.
    EpochSeconds,
}

impl TimeValue {
    /// The "no value" state. Sorts before every other value, including `MIN`.
    pub const EMPTY: TimeValue = TimeValue(i64::MIN);
    pub const MIN: TimeValue = TimeValue(i64::MIN + 1);
    pub const MAX: TimeValue = TimeValue(i64::MAX);

    pub const fn from_micros(micros: i64) -> TimeValue {
        TimeValue(micros)
    }

    pub const fn from_secs(secs: i64) -> TimeValue {
        TimeValue(secs.saturating_mul(MICROS_PER_SEC))
    }

    pub fn now() -> TimeValue {
        TimeValue(Utc::now().timestamp_micros())
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self == TimeValue::EMPTY
    }

    /// Drops the sub-second part.
    pub fn truncate_to_secs(self) -> TimeValue {
        if self.is_empty() {
            return self;
        }
        TimeValue(self.0.div_euclid(MICROS_PER_SEC) * MICROS_PER_SEC)
    }

    /// Builds a value out of the digit groups found in filenames.
    ///
    /// `date` must be 8 digits, `time` 6 digits and `micros`, if present, 6 digits.
    pub fn parse(date: &str, time: &str, micros: Option<&str>) -> Result<TimeValue, FormatError> {
        let date = digits(date, 8, "date")?;
        let time = digits(time, 6, "time")?;
        let micros = match micros {
            Some(micros) => digits(micros, 6, "microseconds")?,
            None => 0,
        };
        let year = (date / 10_000) as i32;
        let month = (date / 100 % 100) as u32;
        let day = (date % 100) as u32;
        let naive_date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| FormatError::new(format!("invalid date {date:08}")))?;
        let naive_time = NaiveTime::from_hms_micro_opt(
            (time / 10_000) as u32,
            (time / 100 % 100) as u32,
            (time % 100) as u32,
            micros as u32,
        )
        .ok_or_else(|| FormatError::new(format!("invalid time {time:06}")))?;
        let naive = NaiveDateTime::new(naive_date, naive_time);
        Ok(TimeValue(Utc.from_utc_datetime(&naive).timestamp_micros()))
    }

    /// Parses `YYYYMMDD_HHMMSS` or `YYYYMMDD_HHMMSS_ffffff`.
    pub fn parse_compact(text: &str) -> Result<TimeValue, FormatError> {
        let mut parts = text.split('_');
        let (Some(date), Some(time)) = (parts.next(), parts.next()) else {
            return Err(FormatError::new(format!("not a compact time: {text:?}")));
        };
        let micros = parts.next();
        if parts.next().is_some() {
            return Err(FormatError::new(format!("not a compact time: {text:?}")));
        }
        TimeValue::parse(date, time, micros)
    }

    pub fn format(self, style: TimeFormat) -> String {
        if self.is_empty() {
            return "-".to_string();
        }
        let pattern = match style {
            TimeFormat::EpochSeconds => return self.0.div_euclid(MICROS_PER_SEC).to_string(),
            TimeFormat::Compact => "%Y%m%d_%H%M%S",
            TimeFormat::CompactMicro => "%Y%m%d_%H%M%S_%6f",
            TimeFormat::Pretty => "%Y-%m-%d %H:%M:%S%.6f",
        };
        match self.to_datetime() {
            Some(datetime) => datetime.format(pattern).to_string(),
            None => "-".to_string(),
        }
    }

    fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.div_euclid(MICROS_PER_SEC);
        let nanos = (self.0.rem_euclid(MICROS_PER_SEC) * 1_000) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos)
    }
}

fn digits(text: &str, width: usize, what: &str) -> Result<u64, FormatError> {
    if text.len() != width || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FormatError::new(format!(
            "expected {width} digits for {what}, got {text:?}"
        )));
    }
    text.parse::<u64>()
        .map_err(|err| FormatError::new(err.to_string()))
}

/// Elapsed microseconds. An empty operand makes the result saturate, so that a
/// missing timestamp always looks infinitely old.
impl Sub for TimeValue {
    type Output = i64;

    fn sub(self, rhs: TimeValue) -> i64 {
        if self.is_empty() || rhs.is_empty() {
            return i64::MAX;
        }
        self.0.saturating_sub(rhs.0)
    }
}

impl fmt::Debug for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("TimeValue(empty)");
        }
        write!(f, "TimeValue({})", self.0)
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(TimeFormat::Pretty))
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeValue;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeValue {
        TimeValue::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    micros: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: TimeValue) -> Self {
        ManualClock {
            micros: Arc::new(AtomicI64::new(start.as_micros())),
        }
    }

    pub fn set(&self, time: TimeValue) {
        self.micros.store(time.as_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, micros: i64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeValue {
        TimeValue(self.micros.load(Ordering::SeqCst))
    }
}
