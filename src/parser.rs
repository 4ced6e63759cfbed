//! Line parser for "Committed State" records.

use crate::event::{CommittedEvent, zero_timestamp};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Layout of the bracketed timestamp, e.g. `2024-01-01|00:00:05.000`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d|%H:%M:%S%.3f";

static COMMITTED_STATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"I\[(.*?)\] Committed State\s+module=(.*?)\s+height=(.*?)\s+txs=(.*?)\s+appHash=(.*)",
    )
    .expect("committed state pattern is valid")
});

/// What to do with a line that matches the pattern but carries a field that
/// does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldPolicy {
    /// Reject the line with a [`ParseError`].
    #[default]
    Strict,
    /// Keep the line, substituting the zero timestamp or `0` for the bad field.
    ZeroFill,
}

/// A matched line whose fields could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    #[error("invalid height {0:?}")]
    Height(String),

    #[error("invalid txs {0:?}")]
    Txs(String),
}

/// Parse a line with [`FieldPolicy::Strict`].
///
/// Returns `Ok(None)` for lines that are not "Committed State" records.
pub fn parse_line(line: &str) -> Result<Option<CommittedEvent>, ParseError> {
    parse_line_with(line, FieldPolicy::Strict)
}

/// Parse a line, handling undecodable fields according to `policy`.
pub fn parse_line_with(
    line: &str,
    policy: FieldPolicy,
) -> Result<Option<CommittedEvent>, ParseError> {
    let Some(caps) = COMMITTED_STATE_RE.captures(line) else {
        return Ok(None);
    };

    let raw_ts = &caps[1];
    let raw_height = &caps[3];
    let raw_txs = &caps[4];

    let timestamp = match parse_timestamp(raw_ts) {
        Some(ts) => ts,
        None if policy == FieldPolicy::ZeroFill => zero_timestamp(),
        None => return Err(ParseError::Timestamp(raw_ts.to_string())),
    };
    let height = match raw_height.parse::<i64>() {
        Ok(h) => h,
        Err(_) if policy == FieldPolicy::ZeroFill => 0,
        Err(_) => return Err(ParseError::Height(raw_height.to_string())),
    };
    let txs = match raw_txs.parse::<i64>() {
        Ok(t) => t,
        Err(_) if policy == FieldPolicy::ZeroFill => 0,
        Err(_) => return Err(ParseError::Txs(raw_txs.to_string())),
    };

    Ok(Some(CommittedEvent {
        timestamp,
        module: caps[2].to_string(),
        height,
        txs,
        app_hash: caps[5].trim().to_string(),
    }))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}
