use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Collection holding one document per observed commit.
pub const COMMITTED_STATE: &str = "committed_state";

/// Collection holding derived block time gap records.
pub const BLOCK_TIME_GAP: &str = "block_time_gap";

/// Field used as the natural key of both collections.
pub const HEIGHT_KEY: &str = "height";

/// A record type that lives in a named collection and is deduplicated on a
/// natural key.
pub trait Record: Serialize {
    /// Name of the collection this record is stored in.
    const COLLECTION: &'static str;

    /// Field name of the natural key.
    const KEY: &'static str;

    /// Value of the natural key for this record.
    fn key(&self) -> i64;
}

/// One "Committed State" line from the node log.
///
/// Serialized with the node's field names (`appHash`), so stored documents
/// keep the layout downstream query scripts expect:
///
/// ```text
/// {"timestamp":"2024-01-01T00:00:05Z","module":"state","height":10,"txs":3,"appHash":"ABC"}
/// ```
///
/// # Examples
///
/// ```
/// use commit_ingest::CommittedEvent;
///
/// let line = "I[2024-01-01|00:00:05.000] Committed State module=state height=10 txs=3 appHash=ABC";
/// let event: CommittedEvent = commit_ingest::parse_line(line).unwrap().unwrap();
/// assert_eq!(event.height, 10);
/// assert_eq!(event.app_hash, "ABC");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommittedEvent {
    /// Commit time taken from the log line, interpreted as UTC.
    pub timestamp: DateTime<Utc>,

    /// Subsystem that emitted the line.
    pub module: String,

    /// Block height. Natural key.
    pub height: i64,

    /// Number of transactions in the block.
    pub txs: i64,

    /// Application hash after the commit, whitespace-trimmed.
    #[serde(rename = "appHash")]
    pub app_hash: String,
}

impl Record for CommittedEvent {
    const COLLECTION: &'static str = COMMITTED_STATE;
    const KEY: &'static str = HEIGHT_KEY;

    fn key(&self) -> i64 {
        self.height
    }
}

/// Derived record: two commits adjacent in processing order were at least the
/// gap threshold apart.
///
/// `timestamp`, `height` and `txs` are copied from the later commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapEvent {
    pub timestamp: DateTime<Utc>,
    pub height: i64,
    pub txs: i64,

    /// Seconds elapsed since the previous commit.
    #[serde(rename = "timeDiff")]
    pub time_diff: f64,

    /// Height of the earlier commit.
    #[serde(rename = "previousHeight")]
    pub previous_height: i64,
}

impl Record for GapEvent {
    const COLLECTION: &'static str = BLOCK_TIME_GAP;
    const KEY: &'static str = HEIGHT_KEY;

    fn key(&self) -> i64 {
        self.height
    }
}

/// The zero instant (`0001-01-01T00:00:00Z`) used when a timestamp cannot be
/// parsed under [`FieldPolicy::ZeroFill`](crate::FieldPolicy::ZeroFill).
pub fn zero_timestamp() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn committed_event_uses_node_field_names() {
        let event = CommittedEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap(),
            module: "state".into(),
            height: 10,
            txs: 3,
            app_hash: "ABC".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["appHash"], "ABC");
        assert_eq!(json["height"], 10);
        assert!(json.get("app_hash").is_none());
    }

    #[test]
    fn gap_event_uses_camel_case_fields() {
        let gap = GapEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 11).unwrap(),
            height: 11,
            txs: 1,
            time_diff: 6.0,
            previous_height: 10,
        };
        let json = serde_json::to_value(&gap).unwrap();
        assert_eq!(json["timeDiff"], 6.0);
        assert_eq!(json["previousHeight"], 10);
    }

    #[test]
    fn zero_timestamp_is_year_one() {
        assert_eq!(zero_timestamp().to_rfc3339(), "0001-01-01T00:00:00+00:00");
    }
}
