//! Candle sync batch entrypoint.
//!
//! One invocation is one sync pass: gate on disabled days and the run lock,
//! sweep every (instrument, granularity) series, then report and exit. The
//! process exit code is nonzero when any series failed, so a scheduler can
//! alert on it directly.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use candlesync::config::SyncConfig;
use candlesync::logfile::RunLog;
use candlesync::notify::{LogNotifier, NotificationSink, WebhookNotifier};
use candlesync::orchestrator::SyncOrchestrator;
use candlesync::runlock::{LockOutcome, RunLock};
use candlesync::source::oanda::OandaClient;

#[derive(Parser, Debug)]
#[command(name = "candlesync", about = "Incremental candlestick store sync")]
struct Args {
    /// TOML config file; defaults plus env vars are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the primary store root.
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Override the worker cap (0 means hardware parallelism).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Run even on disabled days and ignore the run-lock interval.
    #[arg(long, default_value_t = false)]
    force: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "candlesync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv();
    init_tracing();

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "sync run aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<bool> {
    let args = Args::parse();
    let mut config = SyncConfig::load(args.config.as_deref())?;
    if let Some(root) = args.data_root {
        config.data_root = root;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }

    let today = Utc::now().weekday();
    if !args.force && config.disabled_days.contains(&today) {
        info!(day = %today, "sync disabled for this weekday; exiting");
        return Ok(true);
    }

    // The run lock keeps overlapping scheduler invocations (and accidental
    // manual runs right after a scheduled one) from hammering the source.
    let guard = match &config.lock_file {
        Some(lock_file) if !args.force => {
            let lock = RunLock::new(lock_file, config.min_run_interval_secs);
            match lock.acquire()? {
                LockOutcome::Acquired(guard) => Some(guard),
                LockOutcome::AlreadyRunning => {
                    warn!("another sync run is already in progress; exiting");
                    return Ok(true);
                }
                LockOutcome::RanRecently { seconds_ago } => {
                    info!(seconds_ago, "last successful run is too recent; exiting");
                    return Ok(true);
                }
            }
        }
        _ => None,
    };

    let source = Arc::new(
        OandaClient::new(
            config.api_url.clone(),
            config.account_id.clone(),
            &config.api_token,
        )
        .context("building source client")?,
    );
    let notifier: Arc<dyn NotificationSink> = match &config.notify_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };
    let run_log = Arc::new(RunLog::new(&config.run_log_file));

    let orchestrator = Arc::new(SyncOrchestrator::new(
        &config,
        source,
        Arc::clone(&notifier),
        run_log,
    ));
    let report = orchestrator.run_sync_pass().await?;

    if report.overall_success() {
        info!(total = report.total, "sync pass completed");
        if let Some(guard) = &guard {
            guard.mark_success();
        }
        Ok(true)
    } else {
        error!(
            failed = report.failures.len(),
            total = report.total,
            "sync pass completed with failures"
        );
        let mut lines = vec![format!(
            "{} of {} series failed to sync:",
            report.failures.len(),
            report.total
        )];
        for failure in &report.failures {
            lines.push(format!(
                "- {} [{}]: {}",
                failure.series, failure.classification, failure.message
            ));
        }
        notifier.notify(&lines.join("\n")).await;
        Ok(false)
    }
}
