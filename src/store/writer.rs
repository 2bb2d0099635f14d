//! Partition writer: routes a batch of fetched candles into monthly files.
//!
//! Inputs are already filtered to complete records and sorted ascending by
//! timestamp; the writer groups, it never sorts. Each partition is written
//! independently, so one failed file does not block the others in the batch.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::codec;
use crate::error::{SyncError, SyncResult};
use crate::model::{Candle, SeriesKey};

use super::partition::PartitionKey;
use super::StoreLayout;

/// Result of writing one partition of a batch.
#[derive(Debug)]
pub struct PartitionWrite {
    pub key: PartitionKey,
    pub path: PathBuf,
    /// File was created fresh (with header) rather than appended to.
    pub created: bool,
    pub records: usize,
}

pub struct PartitionWriter<'a> {
    layout: &'a StoreLayout,
}

impl<'a> PartitionWriter<'a> {
    pub fn new(layout: &'a StoreLayout) -> Self {
        Self { layout }
    }

    /// Append `candles` to the series, one file per calendar month.
    ///
    /// Returns one entry per touched partition, in ascending partition order;
    /// I/O failures are reported per-partition.
    pub fn write_batch(
        &self,
        series: &SeriesKey,
        candles: &[Candle],
    ) -> Vec<SyncResult<PartitionWrite>> {
        if candles.is_empty() {
            return Vec::new();
        }

        let dir = self.layout.series_dir(series);
        if let Err(e) = fs::create_dir_all(&dir) {
            return vec![Err(SyncError::io(dir, e))];
        }

        let mut groups: BTreeMap<PartitionKey, Vec<&Candle>> = BTreeMap::new();
        for candle in candles {
            groups
                .entry(PartitionKey::of(candle.time))
                .or_default()
                .push(candle);
        }

        groups
            .into_iter()
            .map(|(key, group)| self.write_partition(series, key, &group))
            .collect()
    }

    fn write_partition(
        &self,
        series: &SeriesKey,
        key: PartitionKey,
        group: &[&Candle],
    ) -> SyncResult<PartitionWrite> {
        let path = self.layout.partition_path(series, key);
        let owned: Vec<Candle> = group.iter().map(|c| (*c).clone()).collect();
        let created = !path.exists();

        if created {
            warn!(path = %path.display(), "creating new partition file");
            // create_new fails instead of silently clobbering a file another
            // writer raced to create.
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| SyncError::io(&path, e))?;
            file.write_all(codec::encode(&owned, true).as_bytes())
                .map_err(|e| SyncError::io(&path, e))?;
        } else {
            debug!(path = %path.display(), records = group.len(), "appending to partition");
            let mut file = OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| SyncError::io(&path, e))?;
            file.write_all(codec::encode(&owned, false).as_bytes())
                .map_err(|e| SyncError::io(&path, e))?;
        }

        Ok(PartitionWrite {
            key,
            path,
            created,
            records: group.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_line;
    use crate::model::Granularity;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn series() -> SeriesKey {
        SeriesKey::new("EUR_USD", Granularity::M1)
    }

    fn candle_at(time: DateTime<chrono::FixedOffset>) -> Candle {
        Candle {
            time,
            open: 1.0,
            high: 1.1,
            low: 0.9,
            close: 1.05,
            volume: 7,
            complete: true,
        }
    }

    fn minutes_from(start: DateTime<chrono::FixedOffset>, n: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| candle_at(start + Duration::minutes(i)))
            .collect()
    }

    fn read_lines(path: &std::path::Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn routes_record_to_its_own_month() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let writer = PartitionWriter::new(&layout);
        let t = Utc
            .with_ymd_and_hms(2024, 3, 15, 10, 0, 0)
            .unwrap()
            .fixed_offset();

        let results = writer.write_batch(&series(), &[candle_at(t)]);
        assert_eq!(results.len(), 1);
        let write = results.into_iter().next().unwrap().unwrap();
        assert!(write.path.ends_with("EUR_USD-M1-2024_03.csv"));
        assert!(write.created);
    }

    #[test]
    fn batch_spanning_two_months_produces_two_headed_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let writer = PartitionWriter::new(&layout);
        // 90 minutes straddling the March/April boundary
        let start = Utc
            .with_ymd_and_hms(2024, 3, 31, 23, 0, 0)
            .unwrap()
            .fixed_offset();
        let candles = minutes_from(start, 90);

        let results = writer.write_batch(&series(), &candles);
        assert_eq!(results.len(), 2);

        let mut total = 0;
        for result in results {
            let write = result.unwrap();
            assert!(write.created);
            let lines = read_lines(&write.path);
            assert_eq!(lines[0], codec::CSV_HEADER);
            // records stay ascending within the file
            let times: Vec<_> = lines[1..]
                .iter()
                .map(|l| decode_line(l).unwrap().time)
                .collect();
            assert!(times.windows(2).all(|w| w[0] < w[1]));
            total += write.records;
        }
        assert_eq!(total, 90);
    }

    #[test]
    fn append_to_existing_file_adds_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let writer = PartitionWriter::new(&layout);
        let start = Utc
            .with_ymd_and_hms(2024, 3, 15, 10, 0, 0)
            .unwrap()
            .fixed_offset();

        writer
            .write_batch(&series(), &minutes_from(start, 2))
            .into_iter()
            .for_each(|r| {
                r.unwrap();
            });
        let results =
            writer.write_batch(&series(), &minutes_from(start + Duration::minutes(2), 2));
        let write = results.into_iter().next().unwrap().unwrap();
        assert!(!write.created);

        let lines = read_lines(&write.path);
        assert_eq!(lines.len(), 5); // header + 4 records
        assert_eq!(lines.iter().filter(|l| *l == &codec::CSV_HEADER).count(), 1);
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let writer = PartitionWriter::new(&layout);
        assert!(writer.write_batch(&series(), &[]).is_empty());
        assert!(!layout.series_dir(&series()).exists());
    }
}
