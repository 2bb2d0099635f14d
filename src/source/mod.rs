//! Remote candle source seam.
//!
//! The sync engine only ever talks to the source through this trait, so tests
//! and the end-to-end harness can drive a pass with a scripted source.

pub mod oanda;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use crate::error::SyncResult;
use crate::model::{Granularity, RawCandle};

#[async_trait]
pub trait CandleSource: Send + Sync {
    /// All tradeable instruments for the configured account.
    async fn list_instruments(&self) -> SyncResult<Vec<String>>;

    /// Candles in `[from, to]` for one series.
    async fn fetch_by_range(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: DateTime<FixedOffset>,
        to: DateTime<FixedOffset>,
    ) -> SyncResult<Vec<RawCandle>>;

    /// The most recent `count` candles for one series.
    async fn fetch_by_count(
        &self,
        instrument: &str,
        granularity: Granularity,
        count: u32,
    ) -> SyncResult<Vec<RawCandle>>;
}
