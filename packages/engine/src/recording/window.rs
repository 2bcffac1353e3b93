// packages/engine/src/recording/window.rs
//! Hour-aligned time windows and compressed timestamps
//!
//! Every store file covers one window and is named by the window start,
//! rendered as `YYYYMMDDhhmm` in the configured UTC offset. Entry timestamps
//! are stored as a 32-bit offset from the window start in units of
//! `2^10` nanoseconds (~1.024 µs), which covers ~73 minutes.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use std::fmt;

/// Window width in seconds
pub const WINDOW_SECS: i64 = 3600;

/// Length of a window file name
pub const FILE_NAME_LEN: usize = 12;

const FILE_NAME_FORMAT: &str = "%Y%m%d%H%M";
const CTS_SHIFT: u32 = 10;

/// One hour-aligned time partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window {
    index: i64,
}

impl Window {
    /// Window containing the given instant
    pub fn of(ts: DateTime<Utc>) -> Self {
        Self {
            index: ts.timestamp().div_euclid(WINDOW_SECS),
        }
    }

    /// Window starting at a unix timestamp, as recorded in file headers
    pub fn from_start_unix(secs: i64) -> Self {
        Self {
            index: secs.div_euclid(WINDOW_SECS),
        }
    }

    pub fn start_unix(&self) -> i64 {
        self.index * WINDOW_SECS
    }

    pub fn start(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.start_unix(), 0).unwrap_or_default()
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start() + Duration::seconds(WINDOW_SECS)
    }

    /// Whether `[start, end)` of this window intersects `[from, to)`
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start() < to && from < self.end()
    }

    /// Canonical file name for this window
    pub fn file_name(&self, offset: FixedOffset) -> String {
        self.start()
            .with_timezone(&offset)
            .format(FILE_NAME_FORMAT)
            .to_string()
    }

    /// Parse a canonical file name back into its window
    pub fn parse_file_name(name: &str, offset: FixedOffset) -> Option<Self> {
        if name.len() != FILE_NAME_LEN {
            return None;
        }
        let naive = NaiveDateTime::parse_from_str(name, FILE_NAME_FORMAT).ok()?;
        let local = offset.from_local_datetime(&naive).single()?;
        Some(Self::of(local.with_timezone(&Utc)))
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start().format("%Y-%m-%dT%H:%M:%SZ"))
    }
}

/// Parse a 12-digit window stamp (`YYYYMMDDhhmm`) into an instant
pub fn parse_stamp(stamp: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(stamp, FILE_NAME_FORMAT).ok()?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

/// Encode `ts` relative to `base`
pub fn compress(base: DateTime<Utc>, ts: DateTime<Utc>) -> Result<u32> {
    let nanos = (ts - base).num_nanoseconds().ok_or_else(|| {
        EngineError::TimestampOutOfRange(format!("{} is too far from {}", ts, base))
    })?;
    if nanos < 0 {
        return Err(EngineError::TimestampOutOfRange(format!(
            "{} precedes window start {}",
            ts, base
        )));
    }
    u32::try_from(nanos >> CTS_SHIFT).map_err(|_| {
        EngineError::TimestampOutOfRange(format!("{} is too far from {}", ts, base))
    })
}

/// Decode a compressed timestamp relative to `base`
pub fn uncompress(base: DateTime<Utc>, cts: u32) -> DateTime<Utc> {
    base + Duration::nanoseconds((cts as i64) << CTS_SHIFT)
}

/// Offset used for file naming
pub fn naming_offset(utc_offset_secs: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(utc_offset_secs).ok_or_else(|| {
        EngineError::ConfigInvalid(format!("utc offset {}s is out of range", utc_offset_secs))
    })
}
