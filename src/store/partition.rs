//! Partition naming: calendar year-month keys and their filenames.
//!
//! Filename pattern: `<instrument>-<granularity>-<yyyy>_<mm>.csv`, e.g.
//! `EUR_USD-M1-2024_03.csv`. Instruments use `_` internally, so `-` is a safe
//! component separator.

use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset};

use crate::error::{SyncError, SyncResult};
use crate::model::SeriesKey;

/// One calendar-month slice of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn of(time: DateTime<FixedOffset>) -> Self {
        Self {
            year: time.year(),
            month: time.month(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}_{:02}", self.year, self.month)
    }
}

/// Filename for one partition of one series.
pub fn filename(series: &SeriesKey, key: PartitionKey) -> String {
    format!(
        "{}-{}-{:04}_{:02}.csv",
        series.instrument, series.granularity, key.year, key.month
    )
}

/// Parse the partition key back out of a filename.
///
/// Used to order candidate files by recency when locating a series' current
/// tail, so a non-matching filename is a classified error, not a panic.
pub fn parse_partition_key(filename: &str) -> SyncResult<PartitionKey> {
    let bad = || {
        SyncError::Configuration(format!(
            "filename does not match <instrument>-<granularity>-<yyyy>_<mm>.csv: {filename}"
        ))
    };

    let stem = filename.strip_suffix(".csv").ok_or_else(bad)?;
    let (_, ym) = stem.rsplit_once('-').ok_or_else(bad)?;
    let (year, month) = ym.split_once('_').ok_or_else(bad)?;
    if year.len() != 4 || month.len() != 2 {
        return Err(bad());
    }
    let year: i32 = year.parse().map_err(|_| bad())?;
    let month: u32 = month.parse().map_err(|_| bad())?;
    if !(1..=12).contains(&month) {
        return Err(bad());
    }
    Ok(PartitionKey { year, month })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Granularity;
    use chrono::{TimeZone, Utc};

    #[test]
    fn key_of_timestamp() {
        let t = Utc
            .with_ymd_and_hms(2024, 3, 15, 10, 0, 0)
            .unwrap()
            .fixed_offset();
        assert_eq!(PartitionKey::of(t), PartitionKey { year: 2024, month: 3 });
    }

    #[test]
    fn filename_round_trip() {
        let series = SeriesKey::new("EUR_USD", Granularity::M1);
        let key = PartitionKey { year: 2024, month: 3 };
        let name = filename(&series, key);
        assert_eq!(name, "EUR_USD-M1-2024_03.csv");
        assert_eq!(parse_partition_key(&name).unwrap(), key);
    }

    #[test]
    fn keys_order_by_recency() {
        let a = PartitionKey { year: 2023, month: 12 };
        let b = PartitionKey { year: 2024, month: 1 };
        let c = PartitionKey { year: 2024, month: 2 };
        assert!(a < b && b < c);
    }

    #[test]
    fn bad_filenames_are_configuration_errors() {
        for name in [
            "EUR_USD-M1-2024_03.txt",
            "EUR_USD-M1.csv",
            "EUR_USD-M1-2024-03.csv",
            "EUR_USD-M1-24_03.csv",
            "EUR_USD-M1-2024_3.csv",
            "EUR_USD-M1-2024_13.csv",
            "EUR_USD-M1-yyyy_mm.csv",
        ] {
            let err = parse_partition_key(name).unwrap_err();
            assert_eq!(err.classification(), "configuration", "{name}");
        }
    }
}
