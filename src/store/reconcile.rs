//! Reconciler: self-healing for partition files and the mirror copy.
//!
//! Two independent, idempotent checks:
//! 1. duplicate/corruption cleanup for one partition file, rewriting the file
//!    canonically only when something is actually wrong;
//! 2. mirror parity, appending the missing tail lines to the mirror or
//!    replacing it wholesale when the gap is too large. The mirror is never
//!    authoritative.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, FixedOffset};
use tracing::{info, warn};

use crate::codec;
use crate::error::{SyncError, SyncResult};
use crate::model::{Candle, Granularity};

use super::tail;

/// Outcome of the duplicate/corruption cleanup of one partition file.
#[derive(Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Nothing wrong; the file was not touched.
    Clean,
    /// File rewritten from scratch (header + distinct, ordered records).
    Rewritten {
        kept: usize,
        dropped_duplicates: usize,
        dropped_corrupt: usize,
    },
}

/// Outcome of one mirror parity pass for a partition.
#[derive(Debug, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Mirror file did not exist; copied whole.
    Created,
    /// Mirror tail already matches the primary.
    UpToDate,
    /// Missing tail lines appended to the mirror.
    Appended { lines: usize },
    /// Gap exceeded the wholesale threshold; mirror replaced from primary.
    Recopied { gap_hours: i64 },
}

/// Scan one partition file for duplicate timestamps and undecodable lines,
/// rewriting it canonically when either is found.
///
/// The highest-frequency granularity (M1) gets strict decoding: any record
/// missing a field is dropped. Coarser granularities stop at the first
/// undecodable line, which tolerates a truncated trailing write but not
/// interior corruption.
pub fn cleanup_partition(path: &Path, granularity: Granularity) -> SyncResult<CleanupOutcome> {
    let content = fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
    let data_lines: Vec<&str> = content.lines().skip(1).collect();

    let mut candles: Vec<Candle> = if granularity == Granularity::M1 {
        data_lines
            .iter()
            .filter_map(|line| codec::decode_line(line))
            .collect()
    } else {
        data_lines
            .iter()
            .map(|line| codec::decode_line(line))
            .take_while(Option::is_some)
            .flatten()
            .collect()
    };
    candles.sort_by_key(|c| c.time);

    let decoded = candles.len();
    let mut duplicate_times: Vec<DateTime<FixedOffset>> = Vec::new();
    for window in candles.windows(2) {
        if window[0].same_time(&window[1])
            && duplicate_times.last() != Some(&window[0].time)
        {
            duplicate_times.push(window[0].time);
        }
    }

    if !duplicate_times.is_empty() {
        warn!(
            path = %path.display(),
            duplicates = duplicate_times.len(),
            first = ?duplicate_times.iter().take(5).collect::<Vec<_>>(),
            "partition has duplicate timestamps; rewriting"
        );
        candles.dedup_by(|a, b| a.same_time(b));
        let kept = candles.len();
        rewrite_fresh(path, &candles)?;
        return Ok(CleanupOutcome::Rewritten {
            kept,
            dropped_duplicates: decoded - kept,
            dropped_corrupt: data_lines.len() - decoded,
        });
    }

    if decoded < data_lines.len() {
        warn!(
            path = %path.display(),
            lines = data_lines.len(),
            decoded,
            "partition has undecodable records; rewriting"
        );
        rewrite_fresh(path, &candles)?;
        return Ok(CleanupOutcome::Rewritten {
            kept: decoded,
            dropped_duplicates: 0,
            dropped_corrupt: data_lines.len() - decoded,
        });
    }

    Ok(CleanupOutcome::Clean)
}

/// Delete-then-create-fresh; never rewrite in place over a partial file.
fn rewrite_fresh(path: &Path, candles: &[Candle]) -> SyncResult<()> {
    if path.exists() {
        fs::remove_file(path).map_err(|e| SyncError::io(path, e))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| SyncError::io(path, e))?;
    file.write_all(codec::encode(candles, true).as_bytes())
        .map_err(|e| SyncError::io(path, e))?;
    Ok(())
}

/// Reconciles one partition's mirror copy against the primary.
pub struct MirrorReconciler {
    /// Tail-timestamp gap (hours) beyond which the mirror is replaced
    /// wholesale instead of patched.
    pub wholesale_gap_hours: i64,
}

impl Default for MirrorReconciler {
    fn default() -> Self {
        Self {
            wholesale_gap_hours: 100,
        }
    }
}

impl MirrorReconciler {
    /// Bring `<mirror_dir>/<filename>` up to parity with `primary`.
    pub fn sync_mirror(
        &self,
        primary: &Path,
        mirror_dir: &Path,
        filename: &str,
    ) -> SyncResult<MirrorOutcome> {
        fs::create_dir_all(mirror_dir).map_err(|e| SyncError::io(mirror_dir, e))?;
        let mirror = mirror_dir.join(filename);

        if !mirror.exists() {
            fs::copy(primary, &mirror).map_err(|e| SyncError::io(&mirror, e))?;
            info!(mirror = %mirror.display(), "mirror file created from primary");
            return Ok(MirrorOutcome::Created);
        }

        let (primary_time, _) = last_candle_of(primary)?;
        let (mirror_time, mirror_last_line) = last_candle_of(&mirror)?;

        if primary_time <= mirror_time {
            self.check_size_parity(primary, &mirror, filename)?;
            return Ok(MirrorOutcome::UpToDate);
        }

        let gap_hours = (primary_time - mirror_time).num_hours();
        if gap_hours > self.wholesale_gap_hours {
            fs::remove_file(&mirror).map_err(|e| SyncError::io(&mirror, e))?;
            fs::copy(primary, &mirror).map_err(|e| SyncError::io(&mirror, e))?;
            info!(
                mirror = %mirror.display(),
                gap_hours,
                "mirror replaced wholesale; tail gap exceeded threshold"
            );
            return Ok(MirrorOutcome::Recopied { gap_hours });
        }

        info!(mirror = %mirror.display(), gap_hours, "appending missing mirror lines");
        let suffix = missing_suffix(primary, &mirror_last_line)?.ok_or_else(|| {
            SyncError::Consistency(format!(
                "mirror tail line not found anywhere in primary {}: {}",
                primary.display(),
                mirror_last_line
            ))
        })?;
        let appended = suffix.lines().count();
        let mut file = OpenOptions::new()
            .append(true)
            .open(&mirror)
            .map_err(|e| SyncError::io(&mirror, e))?;
        file.write_all(suffix.as_bytes())
            .map_err(|e| SyncError::io(&mirror, e))?;

        self.check_size_parity(primary, &mirror, filename)?;
        Ok(MirrorOutcome::Appended { lines: appended })
    }

    fn check_size_parity(&self, primary: &Path, mirror: &Path, filename: &str) -> SyncResult<()> {
        let primary_len = fs::metadata(primary)
            .map_err(|e| SyncError::io(primary, e))?
            .len();
        let mirror_len = fs::metadata(mirror)
            .map_err(|e| SyncError::io(mirror, e))?
            .len();
        if primary_len != mirror_len {
            warn!(
                file = filename,
                primary_len, mirror_len, "primary and mirror file sizes differ"
            );
        }
        Ok(())
    }
}

/// Tail record of a partition file; a partition that has no decodable tail
/// cannot be reconciled.
fn last_candle_of(path: &Path) -> SyncResult<(DateTime<FixedOffset>, String)> {
    let line = tail::last_line_of_file(path).ok_or_else(|| {
        SyncError::Corruption(format!("no tail line in {}", path.display()))
    })?;
    let candle = codec::decode_line(&line).ok_or_else(|| {
        SyncError::Corruption(format!(
            "undecodable tail line in {}: {line}",
            path.display()
        ))
    })?;
    Ok((candle.time, line))
}

/// Backward byte-scan for the lines of `path` that follow the line starting
/// with `marker`. Returns `None` when no line matches.
///
/// Only the missing tail is materialized; the scan stops as soon as the
/// marker line is found near EOF.
fn missing_suffix(path: &Path, marker: &str) -> SyncResult<Option<String>> {
    let mut file = File::open(path).map_err(|e| SyncError::io(path, e))?;
    let len = file
        .seek(SeekFrom::End(0))
        .map_err(|e| SyncError::io(path, e))?;

    // lines after the scan point, nearest EOF first
    let mut lines_rev: Vec<String> = Vec::new();
    let mut current_rev: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1];
    let mut pos = len;

    let finish = |lines_rev: &[String]| {
        let mut out = String::new();
        for line in lines_rev.iter().rev() {
            out.push_str(line);
            out.push('\n');
        }
        out
    };

    while pos > 0 {
        pos -= 1;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| SyncError::io(path, e))?;
        file.read_exact(&mut buf)
            .map_err(|e| SyncError::io(path, e))?;

        if buf[0] == b'\n' || buf[0] == b'\r' {
            if !current_rev.is_empty() {
                current_rev.reverse();
                let line = String::from_utf8_lossy(&current_rev).into_owned();
                current_rev.clear();
                if line.starts_with(marker) {
                    return Ok(Some(finish(&lines_rev)));
                }
                lines_rev.push(line);
            }
        } else {
            current_rev.push(buf[0]);
        }
    }

    // first line of the file (no terminator before it)
    if !current_rev.is_empty() {
        current_rev.reverse();
        let line = String::from_utf8_lossy(&current_rev).into_owned();
        if line.starts_with(marker) {
            return Ok(Some(finish(&lines_rev)));
        }
    }

    Ok(None)
}
