//! Sync orchestrator: one full pass over every (instrument, granularity)
//! series with bounded parallelism.
//!
//! Each worker owns its series' files end to end for the run; the only state
//! shared across workers is the progress counter and the failure accumulator,
//! both scoped to a single `run_sync_pass` call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::logfile::RunLog;
use crate::model::{Candle, Granularity, RawCandle, SeriesKey};
use crate::notify::NotificationSink;
use crate::planner::{SyncPlan, SyncPlanner, SyncState};
use crate::source::CandleSource;
use crate::store::reconcile::{cleanup_partition, MirrorReconciler};
use crate::store::writer::PartitionWriter;
use crate::store::{SeriesTail, StoreLayout};

/// One failed series (or mirror) entry in the run report. Every failure ends
/// up in exactly one of these.
#[derive(Debug)]
pub struct SeriesFailure {
    pub series: SeriesKey,
    pub classification: &'static str,
    pub message: String,
}

/// Aggregated result of one sync pass.
#[derive(Debug)]
pub struct RunReport {
    pub total: usize,
    pub state_counts: BTreeMap<SyncState, usize>,
    pub failures: Vec<SeriesFailure>,
}

impl RunReport {
    /// Overall failure as soon as any series failed; partial success is only
    /// visible through the per-series breakdown.
    pub fn overall_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn count(&self, state: SyncState) -> usize {
        self.state_counts.get(&state).copied().unwrap_or(0)
    }
}

struct SeriesOutcome {
    state: SyncState,
    errors: Vec<SyncError>,
}

impl SeriesOutcome {
    fn ok(state: SyncState) -> Self {
        Self {
            state,
            errors: Vec::new(),
        }
    }

    fn failed(error: SyncError) -> Self {
        Self {
            state: SyncState::Error,
            errors: vec![error],
        }
    }
}

pub struct SyncOrchestrator<S> {
    source: Arc<S>,
    notifier: Arc<dyn NotificationSink>,
    run_log: Arc<RunLog>,
    layout: StoreLayout,
    mirror: Option<StoreLayout>,
    mirror_reconciler: MirrorReconciler,
    planner: SyncPlanner,
    granularities: Vec<Granularity>,
    concurrency: usize,
    progress_log_every: usize,
}

impl<S: CandleSource + 'static> SyncOrchestrator<S> {
    pub fn new(
        config: &SyncConfig,
        source: Arc<S>,
        notifier: Arc<dyn NotificationSink>,
        run_log: Arc<RunLog>,
    ) -> Self {
        Self {
            source,
            notifier,
            run_log,
            layout: StoreLayout::new(&config.data_root),
            mirror: config.mirror_root.as_ref().map(StoreLayout::new),
            mirror_reconciler: MirrorReconciler {
                wholesale_gap_hours: config.mirror_wholesale_gap_hours,
            },
            planner: SyncPlanner {
                max_page_size: config.max_page_size,
                server_lag: chrono::Duration::seconds(config.server_lag_secs),
                to_safety_margin: chrono::Duration::seconds(config.to_safety_margin_secs),
            },
            granularities: config.granularities.clone(),
            concurrency: config.effective_concurrency(),
            progress_log_every: config.progress_log_every.max(1),
        }
    }

    /// One full pass: enumerate series, sync each with bounded parallelism,
    /// aggregate outcomes.
    pub async fn run_sync_pass(self: Arc<Self>) -> Result<RunReport, SyncError> {
        info!("launching candle sync pass");

        let instruments = match self.source.list_instruments().await {
            Ok(instruments) => instruments,
            Err(e) => {
                self.notifier
                    .notify(&format!("Error while listing instruments: {e}"))
                    .await;
                return Err(e);
            }
        };
        info!(count = instruments.len(), "found tradeable instruments");

        let series_list: Vec<SeriesKey> = instruments
            .iter()
            .flat_map(|i| {
                self.granularities
                    .iter()
                    .map(move |g| SeriesKey::new(i.clone(), *g))
            })
            .collect();
        let total = series_list.len();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let progress = Arc::new(AtomicUsize::new(0));
        let failures: Arc<Mutex<Vec<SeriesFailure>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(total);
        for series in &series_list {
            let this = Arc::clone(&self);
            let series = series.clone();
            let semaphore = Arc::clone(&semaphore);
            let progress = Arc::clone(&progress);
            let failures = Arc::clone(&failures);

            handles.push((
                series.clone(),
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return SyncState::Error,
                    };

                    let outcome = this.sync_series(&series).await;
                    for error in &outcome.errors {
                        failures.lock().push(SeriesFailure {
                            series: series.clone(),
                            classification: error.classification(),
                            message: error.to_string(),
                        });
                    }

                    let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % this.progress_log_every == 0 {
                        info!(done, total, "series progress");
                    }
                    outcome.state
                }),
            ));
        }

        let mut state_counts: BTreeMap<SyncState, usize> = BTreeMap::new();
        for (series, handle) in handles {
            let state = match handle.await {
                Ok(state) => state,
                Err(e) => {
                    warn!(series = %series, error = %e, "series worker panicked");
                    failures.lock().push(SeriesFailure {
                        series,
                        classification: "io",
                        message: format!("worker panicked: {e}"),
                    });
                    SyncState::Error
                }
            };
            *state_counts.entry(state).or_insert(0) += 1;
        }

        let failures = Arc::try_unwrap(failures)
            .map(Mutex::into_inner)
            .unwrap_or_default();

        let report = RunReport {
            total,
            state_counts,
            failures,
        };
        self.log_pass_breakdown(&report, &instruments);
        self.log_tail_breakdown(&series_list);
        Ok(report)
    }

    async fn sync_series(&self, series: &SeriesKey) -> SeriesOutcome {
        let tail = self.layout.locate_tail(series);
        let plan = match self.planner.plan(series, &tail, Utc::now()) {
            Ok(plan) => plan,
            Err(e) => return SeriesOutcome::failed(e),
        };

        match plan {
            SyncPlan::Skip => SeriesOutcome::ok(SyncState::SkippedTooRecent),
            SyncPlan::FullBackfill { after } => self.backfill(series, after).await,
            SyncPlan::Incremental { from, to, after } => {
                match self
                    .source
                    .fetch_by_range(&series.instrument, series.granularity, from, to)
                    .await
                {
                    Ok(raw) if raw.is_empty() => SeriesOutcome::ok(SyncState::NoNewRecords),
                    Ok(raw) => self.persist(series, raw, Some(after), SyncState::Incremental),
                    Err(SyncError::Transport(msg)) => {
                        warn!(
                            series = %series,
                            error = %msg,
                            "range fetch failed; retrying with count fetch"
                        );
                        self.run_log.append_line(&format!(
                            "error fetching candles from time for {series}; will try getting them using count"
                        ));
                        self.backfill(series, Some(after)).await
                    }
                    Err(e) => SeriesOutcome::failed(e),
                }
            }
        }
    }

    /// Fetch the most recent page of candles; used both for brand-new series
    /// and as the fallback when a range fetch fails at the transport level.
    async fn backfill(
        &self,
        series: &SeriesKey,
        after: Option<DateTime<FixedOffset>>,
    ) -> SeriesOutcome {
        match self
            .source
            .fetch_by_count(
                &series.instrument,
                series.granularity,
                self.planner.max_page_size,
            )
            .await
        {
            Ok(raw) => self.persist(series, raw, after, SyncState::FullBackfill),
            Err(e) => {
                self.run_log
                    .append_line(&format!("error fetching candles by count for {series}"));
                SeriesOutcome::failed(e)
            }
        }
    }

    /// Filter to complete records newer than the tail, write the partitions,
    /// then reconcile each touched partition and its mirror.
    fn persist(
        &self,
        series: &SeriesKey,
        raw: Vec<RawCandle>,
        after: Option<DateTime<FixedOffset>>,
        success_state: SyncState,
    ) -> SeriesOutcome {
        let fetched = raw.len();
        let mut malformed = 0usize;
        let mut candles: Vec<Candle> = raw
            .iter()
            .filter(|r| r.complete)
            .filter_map(|r| {
                let candle = r.to_candle();
                if candle.is_none() {
                    malformed += 1;
                }
                candle
            })
            .filter(|c| after.map_or(true, |boundary| c.time > boundary))
            .collect();
        candles.sort_by_key(|c| c.time);

        if malformed > 0 {
            warn!(series = %series, malformed, fetched, "dropped malformed candles from response");
        }
        if candles.is_empty() {
            return SeriesOutcome::ok(SyncState::NoNewRecords);
        }

        let writer = PartitionWriter::new(&self.layout);
        let mut errors: Vec<SyncError> = Vec::new();
        for result in writer.write_batch(series, &candles) {
            match result {
                Ok(write) => {
                    if let Err(e) = cleanup_partition(&write.path, series.granularity) {
                        errors.push(e);
                        continue;
                    }
                    if let Some(mirror) = &self.mirror {
                        let mirror_dir = mirror.series_dir(series);
                        let filename = write
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        if let Err(e) = self.mirror_reconciler.sync_mirror(
                            &write.path,
                            &mirror_dir,
                            &filename,
                        ) {
                            warn!(series = %series, error = %e, "mirror reconciliation failed");
                            errors.push(e);
                        }
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        // Mirror divergence is reported but never fails the primary write.
        let primary_failed = errors
            .iter()
            .any(|e| !matches!(e, SyncError::Consistency(_)));
        SeriesOutcome {
            state: if primary_failed {
                SyncState::Error
            } else {
                success_state
            },
            errors,
        }
    }

    fn log_pass_breakdown(&self, report: &RunReport, instruments: &[String]) {
        let succeeded = report.total - report.count(SyncState::Error);
        let summary = format!(
            "get candles done for {}/{} series ({} instruments on {} granularity levels)",
            succeeded,
            report.total,
            instruments.len(),
            self.granularities.len()
        );
        let breakdown = format!(
            "breakdown: {:?}",
            report
                .state_counts
                .iter()
                .map(|(state, count)| (state.as_str(), *count))
                .collect::<BTreeMap<_, _>>()
        );
        info!("{summary}");
        info!("{breakdown}");
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.run_log.append_line(&format!("{now} {summary}"));
        self.run_log.append_line(&format!("{now} {breakdown}"));
        for failure in &report.failures {
            self.run_log.append_line(&format!(
                "failed series {} [{}]: {}",
                failure.series, failure.classification, failure.message
            ));
        }
    }

    /// Group series by their tail timestamp and append the breakdown to the
    /// run log; a series whose tail lags the rest stands out immediately.
    fn log_tail_breakdown(&self, series_list: &[SeriesKey]) {
        let mut by_time: BTreeMap<DateTime<FixedOffset>, Vec<String>> = BTreeMap::new();
        for series in series_list {
            if let SeriesTail::Candle { candle, .. } = self.layout.locate_tail(series) {
                by_time.entry(candle.time).or_default().push(series.to_string());
            }
        }
        if by_time.is_empty() {
            return;
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.run_log
            .append_line(&format!("\nlast candle times breakdown as of {now}"));
        for (time, members) in &by_time {
            self.run_log.append_line(&format!(
                "{}: {} series ({})",
                time.to_rfc3339_opts(SecondsFormat::Secs, true),
                members.len(),
                members.join(", ")
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Granularity, RawCandle, RawMid};
    use crate::notify::LogNotifier;
    use crate::source::CandleSource;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::AtomicUsize;

    /// Scripted source: fixed instrument list, canned candles, call counters.
    struct ScriptedSource {
        instruments: Vec<String>,
        range_candles: Result<Vec<RawCandle>, String>,
        count_candles: Result<Vec<RawCandle>, String>,
        range_calls: AtomicUsize,
        count_calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(
            instruments: &[&str],
            range_candles: Result<Vec<RawCandle>, String>,
            count_candles: Result<Vec<RawCandle>, String>,
        ) -> Self {
            Self {
                instruments: instruments.iter().map(|s| s.to_string()).collect(),
                range_candles,
                count_candles,
                range_calls: AtomicUsize::new(0),
                count_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CandleSource for ScriptedSource {
        async fn list_instruments(&self) -> Result<Vec<String>, SyncError> {
            Ok(self.instruments.clone())
        }

        async fn fetch_by_range(
            &self,
            _instrument: &str,
            _granularity: Granularity,
            _from: DateTime<FixedOffset>,
            _to: DateTime<FixedOffset>,
        ) -> Result<Vec<RawCandle>, SyncError> {
            self.range_calls.fetch_add(1, Ordering::SeqCst);
            self.range_candles
                .clone()
                .map_err(SyncError::Transport)
        }

        async fn fetch_by_count(
            &self,
            _instrument: &str,
            _granularity: Granularity,
            _count: u32,
        ) -> Result<Vec<RawCandle>, SyncError> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            self.count_candles
                .clone()
                .map_err(SyncError::Transport)
        }
    }

    fn raw_candle(time: DateTime<Utc>, complete: bool) -> RawCandle {
        RawCandle {
            time: time.to_rfc3339(),
            mid: RawMid {
                o: "1.1".into(),
                h: "1.2".into(),
                l: "1.0".into(),
                c: "1.15".into(),
            },
            volume: 5,
            complete,
        }
    }

    fn minute_candles(start: DateTime<Utc>, n: usize) -> Vec<RawCandle> {
        (0..n)
            .map(|i| raw_candle(start + Duration::minutes(i as i64), true))
            .collect()
    }

    fn config_for(dir: &std::path::Path) -> SyncConfig {
        SyncConfig {
            data_root: dir.join("primary"),
            mirror_root: Some(dir.join("mirror")),
            granularities: vec![Granularity::M1],
            concurrency: 2,
            run_log_file: dir.join("run.log"),
            ..SyncConfig::default()
        }
    }

    fn orchestrator(
        config: &SyncConfig,
        source: Arc<ScriptedSource>,
    ) -> Arc<SyncOrchestrator<ScriptedSource>> {
        Arc::new(SyncOrchestrator::new(
            config,
            source,
            Arc::new(LogNotifier),
            Arc::new(RunLog::new(&config.run_log_file)),
        ))
    }

    #[tokio::test]
    async fn fresh_series_full_backfills_via_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let start = Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();
        let source = Arc::new(ScriptedSource::new(
            &["EUR_USD"],
            Ok(vec![]),
            Ok(minute_candles(start, 10)),
        ));
        let orch = orchestrator(&config, Arc::clone(&source));

        let report = orch.run_sync_pass().await.unwrap();
        assert!(report.overall_success());
        assert_eq!(report.total, 1);
        assert_eq!(report.count(SyncState::FullBackfill), 1);
        assert_eq!(source.count_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.range_calls.load(Ordering::SeqCst), 0);

        // primary and mirror both hold the series
        let layout = StoreLayout::new(&config.data_root);
        let series = SeriesKey::new("EUR_USD", Granularity::M1);
        assert!(matches!(
            layout.locate_tail(&series),
            SeriesTail::Candle { .. }
        ));
        let mirror = StoreLayout::new(config.mirror_root.as_ref().unwrap());
        assert!(matches!(
            mirror.locate_tail(&series),
            SeriesTail::Candle { .. }
        ));
    }

    #[tokio::test]
    async fn too_recent_tail_skips_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        // seed a series whose tail is right at "now"
        let layout = StoreLayout::new(&config.data_root);
        let series = SeriesKey::new("EUR_USD", Granularity::M1);
        let seed = minute_candles(Utc::now() - Duration::minutes(1), 1);
        let seeded: Vec<Candle> = seed.iter().filter_map(|r| r.to_candle()).collect();
        PartitionWriter::new(&layout)
            .write_batch(&series, &seeded)
            .into_iter()
            .for_each(|r| {
                r.unwrap();
            });
        let before = std::fs::read_to_string(
            layout.latest_partition(&series).unwrap().unwrap().1,
        )
        .unwrap();

        let source = Arc::new(ScriptedSource::new(&["EUR_USD"], Ok(vec![]), Ok(vec![])));
        let orch = orchestrator(&config, Arc::clone(&source));
        let report = orch.run_sync_pass().await.unwrap();

        assert_eq!(report.count(SyncState::SkippedTooRecent), 1);
        assert_eq!(source.range_calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.count_calls.load(Ordering::SeqCst), 0);
        let after = std::fs::read_to_string(
            layout.latest_partition(&series).unwrap().unwrap().1,
        )
        .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn range_transport_failure_falls_back_to_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let layout = StoreLayout::new(&config.data_root);
        let series = SeriesKey::new("EUR_USD", Granularity::M1);

        // tail well in the past, so the planner goes incremental
        let start = Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();
        let seeded: Vec<Candle> = minute_candles(start, 3)
            .iter()
            .filter_map(|r| r.to_candle())
            .collect();
        PartitionWriter::new(&layout)
            .write_batch(&series, &seeded)
            .into_iter()
            .for_each(|r| {
                r.unwrap();
            });

        let source = Arc::new(ScriptedSource::new(
            &["EUR_USD"],
            Err("connection reset".into()),
            Ok(minute_candles(start + Duration::minutes(3), 5)),
        ));
        let orch = orchestrator(&config, Arc::clone(&source));
        let report = orch.run_sync_pass().await.unwrap();

        assert!(report.overall_success());
        assert_eq!(report.count(SyncState::FullBackfill), 1);
        assert_eq!(source.range_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.count_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn double_transport_failure_is_a_reported_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let source = Arc::new(ScriptedSource::new(
            &["EUR_USD", "USD_JPY"],
            Err("unreachable".into()),
            Err("unreachable".into()),
        ));
        let orch = orchestrator(&config, Arc::clone(&source));
        let report = orch.run_sync_pass().await.unwrap();

        assert!(!report.overall_success());
        assert_eq!(report.count(SyncState::Error), 2);
        assert_eq!(report.failures.len(), 2);
        for failure in &report.failures {
            assert_eq!(failure.classification, "transport");
        }
    }

    #[tokio::test]
    async fn incomplete_candles_never_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let start = Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();
        let mut candles = minute_candles(start, 3);
        candles.push(raw_candle(start + Duration::minutes(3), false)); // in-progress
        let source = Arc::new(ScriptedSource::new(&["EUR_USD"], Ok(vec![]), Ok(candles)));
        let orch = orchestrator(&config, Arc::clone(&source));

        orch.run_sync_pass().await.unwrap();

        let layout = StoreLayout::new(&config.data_root);
        let series = SeriesKey::new("EUR_USD", Granularity::M1);
        let (_, path) = layout.latest_partition(&series).unwrap().unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 4); // header + 3 complete candles
    }

    #[tokio::test]
    async fn empty_range_response_is_no_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let layout = StoreLayout::new(&config.data_root);
        let series = SeriesKey::new("EUR_USD", Granularity::M1);
        let start = Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();
        let seeded: Vec<Candle> = minute_candles(start, 1)
            .iter()
            .filter_map(|r| r.to_candle())
            .collect();
        PartitionWriter::new(&layout)
            .write_batch(&series, &seeded)
            .into_iter()
            .for_each(|r| {
                r.unwrap();
            });

        let source = Arc::new(ScriptedSource::new(&["EUR_USD"], Ok(vec![]), Ok(vec![])));
        let orch = orchestrator(&config, Arc::clone(&source));
        let report = orch.run_sync_pass().await.unwrap();

        assert_eq!(report.count(SyncState::NoNewRecords), 1);
        assert_eq!(source.range_calls.load(Ordering::SeqCst), 1);
    }
}
