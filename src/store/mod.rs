//! Month-partitioned flat-file candle store.
//!
//! Layout: `<root>/<instrument>/<granularity>/<instrument>-<granularity>-<yyyy>_<mm>.csv`.
//! The store is write-mostly and read-only-for-tail; the most recent
//! partition's last record is the resume position for a series.

pub mod partition;
pub mod reconcile;
pub mod tail;
pub mod writer;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::codec;
use crate::error::{SyncError, SyncResult};
use crate::model::{Candle, SeriesKey};
use partition::PartitionKey;

/// Resolves series directories and partition paths under one store root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

/// Resume position of a series, derived from its most recent partition file.
#[derive(Debug)]
pub enum SeriesTail {
    /// No partition file exists (or the newest one is empty).
    None,
    /// The newest partition's last line does not decode; data-integrity
    /// warning, full backfill required.
    Corrupt { path: PathBuf, last_line: String },
    /// Clean tail record.
    Candle {
        path: PathBuf,
        key: PartitionKey,
        candle: Candle,
    },
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<instrument>/<granularity>`
    pub fn series_dir(&self, series: &SeriesKey) -> PathBuf {
        self.root
            .join(&series.instrument)
            .join(series.granularity.as_str())
    }

    pub fn partition_path(&self, series: &SeriesKey, key: PartitionKey) -> PathBuf {
        self.series_dir(series).join(partition::filename(series, key))
    }

    /// Highest partition key present for a series, with its path.
    ///
    /// Filenames that do not match the partition pattern are skipped with a
    /// warning; they cannot participate in recency ordering.
    pub fn latest_partition(
        &self,
        series: &SeriesKey,
    ) -> SyncResult<Option<(PartitionKey, PathBuf)>> {
        let dir = self.series_dir(series);
        if !dir.exists() {
            return Ok(None);
        }

        let entries = fs::read_dir(&dir).map_err(|e| SyncError::io(&dir, e))?;
        let mut latest: Option<(PartitionKey, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::io(&dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = match partition::parse_partition_key(&name) {
                Ok(key) => key,
                Err(e) => {
                    warn!(file = %name, error = %e, "skipping non-partition file");
                    continue;
                }
            };
            if latest.as_ref().map_or(true, |(best, _)| key > *best) {
                latest = Some((key, path));
            }
        }
        Ok(latest)
    }

    /// Locate the series' resume position without reading whole files.
    pub fn locate_tail(&self, series: &SeriesKey) -> SeriesTail {
        let latest = match self.latest_partition(series) {
            Ok(latest) => latest,
            Err(e) => {
                // Treated like an absent tail: the caller falls back to a
                // full backfill rather than aborting the series.
                warn!(series = %series, error = %e, "failed listing partitions");
                return SeriesTail::None;
            }
        };
        let Some((key, path)) = latest else {
            return SeriesTail::None;
        };
        let Some(line) = tail::last_line_of_file(&path) else {
            return SeriesTail::None;
        };
        match codec::decode_line(&line) {
            Some(candle) => SeriesTail::Candle { path, key, candle },
            None => SeriesTail::Corrupt {
                path,
                last_line: line,
            },
        }
    }
}
