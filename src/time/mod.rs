//! Wall-clock timestamps with microsecond resolution.

use std::fmt;
use std::mem;
use std::time::{SystemTime, UNIX_EPOCH};

/// An instant in UTC, counted in microseconds since the Unix epoch.
///
/// Timestamps are immutable, totally ordered and cheap to copy; pass them
/// by value. The zero timestamp is the invalid sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micro_seconds_since_epoch: i64,
}

impl Timestamp {
    pub const MICRO_SECONDS_PER_SECOND: i64 = 1_000_000;

    /// The invalid sentinel (zero microseconds).
    pub fn invalid() -> Timestamp {
        Timestamp {
            micro_seconds_since_epoch: 0,
        }
    }

    pub fn from_micros(micro_seconds_since_epoch: i64) -> Timestamp {
        Timestamp {
            micro_seconds_since_epoch,
        }
    }

    /// Reads the system clock.
    pub fn now() -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock set before the Unix epoch");
        Timestamp {
            micro_seconds_since_epoch: since_epoch.as_micros() as i64,
        }
    }

    pub fn micros(&self) -> i64 {
        self.micro_seconds_since_epoch
    }

    pub fn is_valid(&self) -> bool {
        self.micro_seconds_since_epoch > 0
    }

    /// Returns this timestamp shifted by `seconds`, which may be fractional
    /// or negative. An `f64` has 52 mantissa bits, enough for one-microsecond
    /// resolution across any realistic offset.
    pub fn add_seconds(&self, seconds: f64) -> Timestamp {
        let delta = (seconds * Self::MICRO_SECONDS_PER_SECOND as f64) as i64;
        Timestamp {
            micro_seconds_since_epoch: self.micro_seconds_since_epoch + delta,
        }
    }

    /// Seconds elapsed from `earlier` to `self`, with microsecond precision.
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        let diff = self.micro_seconds_since_epoch - earlier.micro_seconds_since_epoch;
        diff as f64 / Self::MICRO_SECONDS_PER_SECOND as f64
    }

    /// UTC wall-clock rendering for logs: `YYYYMMDD HH:MM:SS`, with a
    /// `.micros` suffix when `show_micro_seconds` is set.
    pub fn to_formatted_string(&self, show_micro_seconds: bool) -> String {
        let seconds =
            (self.micro_seconds_since_epoch / Self::MICRO_SECONDS_PER_SECOND) as libc::time_t;
        let mut tm_time: libc::tm = unsafe { mem::zeroed() };
        unsafe {
            libc::gmtime_r(&seconds, &mut tm_time);
        }
        let date_time = format!(
            "{:04}{:02}{:02} {:02}:{:02}:{:02}",
            tm_time.tm_year + 1900,
            tm_time.tm_mon + 1,
            tm_time.tm_mday,
            tm_time.tm_hour,
            tm_time.tm_min,
            tm_time.tm_sec
        );
        if show_micro_seconds {
            let micro_seconds = self.micro_seconds_since_epoch % Self::MICRO_SECONDS_PER_SECOND;
            format!("{}.{:06}", date_time, micro_seconds)
        } else {
            date_time
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.micro_seconds_since_epoch / Self::MICRO_SECONDS_PER_SECOND;
        let micro_seconds = self.micro_seconds_since_epoch % Self::MICRO_SECONDS_PER_SECOND;
        write!(formatter, "{}.{:06}", seconds, micro_seconds)
    }
}
