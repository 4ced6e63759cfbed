use crate::event::{CommittedEvent, GapEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default minimum interval, in seconds, between adjacent commits that counts
/// as a gap.
pub const DEFAULT_GAP_THRESHOLD_SECS: f64 = 5.0;

/// The part of the previous commit the detector needs to remember.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastCommit {
    pub timestamp: DateTime<Utc>,
    pub height: i64,
}

impl From<&CommittedEvent> for LastCommit {
    fn from(event: &CommittedEvent) -> Self {
        LastCommit {
            timestamp: event.timestamp,
            height: event.height,
        }
    }
}

/// Tracks the last processed commit and flags long intervals between
/// consecutive commits.
///
/// "Consecutive" means adjacent in processing order, not adjacent heights:
/// the detector is fed historical segments oldest-first and then the live
/// file, and carries its state across all of them.
#[derive(Debug, Clone)]
pub struct GapDetector {
    threshold: f64,
    last: Option<LastCommit>,
}

impl Default for GapDetector {
    fn default() -> Self {
        GapDetector::new(DEFAULT_GAP_THRESHOLD_SECS)
    }
}

impl GapDetector {
    pub fn new(threshold_secs: f64) -> Self {
        GapDetector {
            threshold: threshold_secs,
            last: None,
        }
    }

    /// Feed the next commit.
    ///
    /// Returns a [`GapEvent`] when the interval since the previous commit is
    /// at least the threshold. The remembered commit always advances to
    /// `event`, gap or not.
    pub fn observe(&mut self, event: &CommittedEvent) -> Option<GapEvent> {
        let gap = self.last.and_then(|prev| {
            let delta = seconds_between(prev.timestamp, event.timestamp);
            (delta >= self.threshold).then(|| GapEvent {
                timestamp: event.timestamp,
                height: event.height,
                txs: event.txs,
                time_diff: delta,
                previous_height: prev.height,
            })
        });
        self.last = Some(LastCommit::from(event));
        gap
    }

    /// The most recently observed commit, if any.
    pub fn last(&self) -> Option<LastCommit> {
        self.last
    }

    /// Resume from a previously saved commit.
    pub fn restore(&mut self, last: Option<LastCommit>) {
        self.last = last;
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

// Log timestamps carry millisecond precision.
fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1_000.0
}
