//! Sync planner: decides per series what to fetch, from the tail position.
//!
//! State machine driven by what the tail locator found:
//! * no partition file → full backfill (most recent `max_page_size` records);
//! * clean tail, next candle not expected complete yet → skip, not an error;
//! * clean tail otherwise → incremental fetch `[tail + granularity, now - margin]`;
//! * undecodable tail → full backfill, logged as a data-integrity warning.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::model::SeriesKey;
use crate::store::SeriesTail;

/// What a series worker should do this pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPlan {
    /// Fetch the most recent `max_page_size` records. `after` bounds which of
    /// them are new when a tail exists but could not be trusted for a range
    /// fetch.
    FullBackfill { after: Option<DateTime<FixedOffset>> },
    /// Fetch `[from, to]`; only records strictly after `after` are written.
    Incremental {
        from: DateTime<FixedOffset>,
        to: DateTime<FixedOffset>,
        after: DateTime<FixedOffset>,
    },
    /// Next candle cannot be complete yet; nothing to do.
    Skip,
}

/// Per-series outcome tag aggregated into the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SyncState {
    FullBackfill,
    Incremental,
    SkippedTooRecent,
    NoNewRecords,
    Error,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullBackfill => "full-backfill",
            Self::Incremental => "incremental",
            Self::SkippedTooRecent => "skipped-too-recent",
            Self::NoNewRecords => "no-new-records",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SyncPlanner {
    /// Source's maximum page size; full backfills fetch exactly this many.
    pub max_page_size: u32,
    /// Allowance for server-side publication delay before the next candle is
    /// considered complete. No weekend/market-closure awareness.
    pub server_lag: Duration,
    /// Shaved off "now" for the range upper bound, so a source with clock
    /// skew does not reject the request as being in the future.
    pub to_safety_margin: Duration,
}

impl SyncPlanner {
    pub fn plan(
        &self,
        series: &SeriesKey,
        tail: &SeriesTail,
        now: DateTime<Utc>,
    ) -> SyncResult<SyncPlan> {
        match tail {
            SeriesTail::None => Ok(SyncPlan::FullBackfill { after: None }),
            SeriesTail::Corrupt { path, last_line } => {
                warn!(
                    series = %series,
                    path = %path.display(),
                    last_line,
                    "tail record does not decode; planning full backfill"
                );
                Ok(SyncPlan::FullBackfill { after: None })
            }
            SeriesTail::Candle { candle, .. } => {
                let step = Duration::seconds(series.granularity.seconds()?);
                let resume = candle.time + step;

                if now.fixed_offset() < resume + self.server_lag {
                    debug!(
                        series = %series,
                        resume = %resume,
                        "next candle not complete yet; skipping"
                    );
                    return Ok(SyncPlan::Skip);
                }

                Ok(SyncPlan::Incremental {
                    from: resume,
                    to: (now - self.to_safety_margin).fixed_offset(),
                    after: candle.time,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Candle, Granularity};
    use crate::store::partition::PartitionKey;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn planner() -> SyncPlanner {
        SyncPlanner {
            max_page_size: 5000,
            server_lag: Duration::minutes(15),
            to_safety_margin: Duration::seconds(10),
        }
    }

    fn tail_at(time: DateTime<Utc>) -> SeriesTail {
        SeriesTail::Candle {
            path: PathBuf::from("EUR_USD-M15-2024_03.csv"),
            key: PartitionKey { year: 2024, month: 3 },
            candle: Candle {
                time: time.fixed_offset(),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1,
                complete: true,
            },
        }
    }

    fn series() -> SeriesKey {
        SeriesKey::new("EUR_USD", Granularity::M15)
    }

    #[test]
    fn no_partition_plans_full_backfill() {
        let plan = planner().plan(&series(), &SeriesTail::None, Utc::now()).unwrap();
        assert_eq!(plan, SyncPlan::FullBackfill { after: None });
    }

    #[test]
    fn corrupt_tail_plans_full_backfill() {
        let tail = SeriesTail::Corrupt {
            path: PathBuf::from("x.csv"),
            last_line: "garbage".into(),
        };
        let plan = planner().plan(&series(), &tail, Utc::now()).unwrap();
        assert_eq!(plan, SyncPlan::FullBackfill { after: None });
    }

    #[test]
    fn next_candle_within_lag_window_skips() {
        let last = Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap();
        // next candle closes 8:15, lag allowance pushes readiness to 8:30
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 8, 29, 0).unwrap();
        let plan = planner().plan(&series(), &tail_at(last), now).unwrap();
        assert_eq!(plan, SyncPlan::Skip);
    }

    #[test]
    fn ready_candle_plans_incremental_with_margin() {
        let last = Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 8, 30, 0).unwrap();
        let plan = planner().plan(&series(), &tail_at(last), now).unwrap();
        match plan {
            SyncPlan::Incremental { from, to, after } => {
                assert_eq!(from, last.fixed_offset() + Duration::minutes(15));
                assert_eq!(to, now.fixed_offset() - Duration::seconds(10));
                assert_eq!(after, last.fixed_offset());
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn monthly_granularity_fails_time_arithmetic() {
        let series = SeriesKey::new("EUR_USD", Granularity::Mon);
        let last = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let err = planner().plan(&series, &tail_at(last), Utc::now()).unwrap_err();
        assert_eq!(err.classification(), "configuration");
    }
}
