//! Candle Sync Engine
//!
//! Incremental synchronization of historical candlestick data against a
//! remote source, persisted into a month-partitioned CSV store with an
//! optional mirror copy.

pub mod codec;
pub mod config;
pub mod error;
pub mod logfile;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod runlock;
pub mod source;
pub mod store;

pub use error::{SyncError, SyncResult};
