//! Configuration: defaults, optional TOML file, `CANDLESYNC_*` env overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::model::Granularity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Primary store root.
    pub data_root: PathBuf,
    /// Mirror store root; mirror reconciliation is skipped when unset.
    pub mirror_root: Option<PathBuf>,
    /// Granularities synced for every instrument.
    pub granularities: Vec<Granularity>,
    /// Worker cap; 0 means available hardware parallelism.
    pub concurrency: usize,
    /// Source's maximum candles per request.
    pub max_page_size: u32,
    /// Server publication delay allowance for the skip heuristic, seconds.
    pub server_lag_secs: i64,
    /// Shaved off "now" for range upper bounds, seconds.
    pub to_safety_margin_secs: i64,
    /// Mirror tail gap beyond which the mirror is replaced wholesale, hours.
    pub mirror_wholesale_gap_hours: i64,
    /// Log progress every N completed series.
    pub progress_log_every: usize,
    /// Weekdays on which the job exits immediately.
    pub disabled_days: Vec<Weekday>,
    /// Lock/timestamp file path; run-lock gating is skipped when unset.
    pub lock_file: Option<PathBuf>,
    /// Minimum seconds between successful runs.
    pub min_run_interval_secs: u64,
    /// Run-scoped text log path.
    pub run_log_file: PathBuf,
    /// Source REST base URL.
    pub api_url: String,
    /// Account whose tradeable instruments are enumerated.
    pub account_id: String,
    /// Bearer token; normally provided via `CANDLESYNC_API_TOKEN`.
    pub api_token: String,
    /// Operator notification webhook; log-only notifications when unset.
    pub notify_webhook: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./candles"),
            mirror_root: None,
            granularities: vec![Granularity::M15, Granularity::M1],
            concurrency: 0,
            max_page_size: 5000,
            server_lag_secs: 900,
            to_safety_margin_secs: 10,
            mirror_wholesale_gap_hours: 100,
            progress_log_every: 10,
            disabled_days: vec![],
            lock_file: None,
            min_run_interval_secs: 3600,
            run_log_file: PathBuf::from("batch-job-output.txt"),
            api_url: "https://api-fxpractice.oanda.com".to_string(),
            account_id: String::new(),
            api_token: String::new(),
            notify_webhook: None,
        }
    }
}

impl SyncConfig {
    /// Defaults, overlaid with the TOML file (when given), overlaid with env.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("CANDLESYNC_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CANDLESYNC_MIRROR_ROOT") {
            self.mirror_root = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("CANDLESYNC_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = env::var("CANDLESYNC_ACCOUNT_ID") {
            self.account_id = v;
        }
        if let Ok(v) = env::var("CANDLESYNC_API_TOKEN") {
            self.api_token = v;
        }
        if let Ok(v) = env::var("CANDLESYNC_NOTIFY_WEBHOOK") {
            self.notify_webhook = Some(v);
        }
        if let Some(v) = env::var("CANDLESYNC_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.concurrency = v;
        }
    }

    /// Worker cap with the 0-means-auto rule applied.
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
