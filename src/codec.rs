//! CSV line codec for candle records.
//!
//! Field order is fixed: `time,open,high,low,close,volume,isComplete`.
//! Timestamps are RFC 3339 at second precision with an explicit offset, so a
//! record round-trips losslessly. The completeness flag serializes as `0`/`1`
//! for format stability.

use chrono::{DateTime, SecondsFormat};

use crate::model::Candle;

pub const CSV_HEADER: &str = "time,open,high,low,close,volume,isComplete";

const FIELD_COUNT: usize = 7;

/// Decode one CSV line (without header) into a candle.
///
/// Any malformed line (wrong column count, unparseable number or timestamp)
/// yields `None` rather than an error; callers use `None` to detect
/// corruption.
pub fn decode_line(line: &str) -> Option<Candle> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != FIELD_COUNT {
        return None;
    }

    let time = DateTime::parse_from_rfc3339(fields[0]).ok()?;
    let complete = match fields[6] {
        "0" => false,
        "1" => true,
        _ => return None,
    };

    Some(Candle {
        time,
        open: fields[1].parse().ok()?,
        high: fields[2].parse().ok()?,
        low: fields[3].parse().ok()?,
        close: fields[4].parse().ok()?,
        volume: fields[5].parse().ok()?,
        complete,
    })
}

/// Encode one candle as a single CSV line, newline-terminated.
pub fn encode_line(candle: &Candle) -> String {
    format!(
        "{},{},{},{},{},{},{}\n",
        candle.time.to_rfc3339_opts(SecondsFormat::Secs, true),
        candle.open,
        candle.high,
        candle.low,
        candle.close,
        candle.volume,
        u8::from(candle.complete),
    )
}

/// Encode a batch of candles, optionally prefixed with the schema header.
pub fn encode(candles: &[Candle], with_header: bool) -> String {
    let mut out = String::with_capacity(candles.len() * 64 + CSV_HEADER.len() + 1);
    if with_header {
        out.push_str(CSV_HEADER);
        out.push('\n');
    }
    for candle in candles {
        out.push_str(&encode_line(candle));
    }
    out
}
