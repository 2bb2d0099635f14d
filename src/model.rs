//! Core market-data types: granularities, series keys, candle records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Sampling interval of a candle series.
///
/// `Mon` (calendar month) has no fixed duration and is rejected by
/// [`Granularity::seconds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    S5,
    S10,
    S15,
    S30,
    M1,
    M2,
    M4,
    M5,
    M10,
    M15,
    M30,
    H1,
    H2,
    H3,
    H4,
    H6,
    H8,
    H12,
    D,
    W,
    #[serde(rename = "M")]
    Mon,
}

impl Granularity {
    /// Canonical duration in seconds. Weeks assume 7 days.
    pub fn seconds(self) -> SyncResult<i64> {
        Ok(match self {
            Self::S5 => 5,
            Self::S10 => 10,
            Self::S15 => 15,
            Self::S30 => 30,
            Self::M1 => 60,
            Self::M2 => 120,
            Self::M4 => 240,
            Self::M5 => 300,
            Self::M10 => 600,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H2 => 7_200,
            Self::H3 => 10_800,
            Self::H4 => 14_400,
            Self::H6 => 21_600,
            Self::H8 => 28_800,
            Self::H12 => 43_200,
            Self::D => 86_400,
            Self::W => 604_800,
            Self::Mon => {
                return Err(SyncError::Configuration(
                    "no fixed seconds for monthly granularity; ambiguous number of days".into(),
                ))
            }
        })
    }

    /// The wire/file token, e.g. `M15`. Monthly is `M` on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S5 => "S5",
            Self::S10 => "S10",
            Self::S15 => "S15",
            Self::S30 => "S30",
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::M4 => "M4",
            Self::M5 => "M5",
            Self::M10 => "M10",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H2 => "H2",
            Self::H3 => "H3",
            Self::H4 => "H4",
            Self::H6 => "H6",
            Self::H8 => "H8",
            Self::H12 => "H12",
            Self::D => "D",
            Self::W => "W",
            Self::Mon => "M",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "S5" => Self::S5,
            "S10" => Self::S10,
            "S15" => Self::S15,
            "S30" => Self::S30,
            "M1" => Self::M1,
            "M2" => Self::M2,
            "M4" => Self::M4,
            "M5" => Self::M5,
            "M10" => Self::M10,
            "M15" => Self::M15,
            "M30" => Self::M30,
            "H1" => Self::H1,
            "H2" => Self::H2,
            "H3" => Self::H3,
            "H4" => Self::H4,
            "H6" => Self::H6,
            "H8" => Self::H8,
            "H12" => Self::H12,
            "D" => Self::D,
            "W" => Self::W,
            "M" => Self::Mon,
            other => {
                return Err(SyncError::Configuration(format!(
                    "unknown granularity: {other}"
                )))
            }
        })
    }
}

/// One logical time series: (instrument, granularity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub instrument: String,
    pub granularity: Granularity,
}

impl SeriesKey {
    pub fn new(instrument: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            instrument: instrument.into(),
            granularity,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.instrument, self.granularity)
    }
}

/// One persisted candle record. The timestamp is the natural key within a
/// series; ordering and dedup are timestamp-based.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub time: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub complete: bool,
}

impl Candle {
    pub fn same_time(&self, other: &Candle) -> bool {
        self.time == other.time
    }
}

/// Raw candle as returned by the remote source: mid prices arrive as JSON
/// strings, the timestamp as an RFC 3339 string.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCandle {
    pub time: String,
    pub mid: RawMid,
    pub volume: u64,
    pub complete: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMid {
    pub o: String,
    pub h: String,
    pub l: String,
    pub c: String,
}

impl RawCandle {
    /// Map a wire candle to a store record, normalizing the timestamp to UTC
    /// at second precision. Malformed fields yield `None`; callers count and
    /// log, they do not abort the batch.
    pub fn to_candle(&self) -> Option<Candle> {
        let parsed = DateTime::parse_from_rfc3339(&self.time).ok()?;
        // second precision: sub-second digits from the wire never reach the store
        let time = parsed.with_timezone(&Utc).with_nanosecond(0)?.fixed_offset();
        Some(Candle {
            time,
            open: self.mid.o.parse().ok()?,
            high: self.mid.h.parse().ok()?,
            low: self.mid.l.parse().ok()?,
            close: self.mid.c.parse().ok()?,
            volume: self.volume,
            complete: self.complete,
        })
    }
}
