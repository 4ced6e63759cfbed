use crate::gap::{GapDetector, LastCommit};
use crate::lines::LineReader;
use crate::parser::{FieldPolicy, parse_line_with};
use crate::store::{Backend, EventStore, Insert};
use log::{info, warn};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

/// Consumer of raw log lines.
///
/// The historical scanner and the tailer only produce lines; what happens to
/// them is up to the sink.
pub trait LineSink {
    fn consume_line(&mut self, line: &str);

    /// Last commit seen by the sink, persisted alongside tail checkpoints.
    fn last_commit(&self) -> Option<LastCommit> {
        None
    }
}

impl LineSink for Vec<String> {
    fn consume_line(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

impl<S: LineSink + ?Sized> LineSink for &mut S {
    fn consume_line(&mut self, line: &str) {
        (**self).consume_line(line)
    }

    fn last_commit(&self) -> Option<LastCommit> {
        (**self).last_commit()
    }
}

/// Running totals of what the pipeline did with its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub commits: u64,
    pub commits_stored: u64,
    pub commits_duplicate: u64,
    pub gaps_stored: u64,
    pub gaps_duplicate: u64,
    pub failures: u64,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lines, {} commits ({} new, {} already stored), {} gaps ({} already stored), {} failures",
            self.lines,
            self.commits,
            self.commits_stored,
            self.commits_duplicate,
            self.gaps_stored + self.gaps_duplicate,
            self.gaps_duplicate,
            self.failures,
        )
    }
}

/// Parser → gap detector → store, for one ordered stream of lines.
///
/// A single pipeline is fed historical segments first and the live file
/// afterwards, so the gap detector sees every commit in order.
pub struct Pipeline<B> {
    store: EventStore<B>,
    detector: GapDetector,
    policy: FieldPolicy,
    stats: IngestStats,
}

impl<B: Backend> Pipeline<B> {
    pub fn new(store: EventStore<B>, detector: GapDetector) -> Self {
        Pipeline {
            store,
            detector,
            policy: FieldPolicy::default(),
            stats: IngestStats::default(),
        }
    }

    pub fn with_policy(mut self, policy: FieldPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &EventStore<B> {
        &self.store
    }

    pub fn detector(&self) -> &GapDetector {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut GapDetector {
        &mut self.detector
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Parse one line and store whatever it yields.
    ///
    /// Never fails: malformed lines and store errors are logged, counted and
    /// dropped.
    pub fn ingest_line(&mut self, line: &str) {
        self.stats.lines += 1;

        let event = match parse_line_with(line, self.policy) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!("skipping committed state line: {e}: {line}");
                self.stats.failures += 1;
                return;
            }
        };
        self.stats.commits += 1;

        match self.store.insert(&event) {
            Ok(Insert::Created(_)) => self.stats.commits_stored += 1,
            Ok(Insert::AlreadyPresent) => self.stats.commits_duplicate += 1,
            Err(e) => {
                warn!("failed to store committed state at height {}: {e}", event.height);
                self.stats.failures += 1;
            }
        }

        let Some(gap) = self.detector.observe(&event) else {
            return;
        };
        match self.store.insert(&gap) {
            Ok(Insert::Created(_)) => {
                self.stats.gaps_stored += 1;
                info!(
                    "block time gap {:.2}s (height {} -> {}, txs {})",
                    gap.time_diff, gap.previous_height, gap.height, gap.txs
                );
            }
            Ok(Insert::AlreadyPresent) => self.stats.gaps_duplicate += 1,
            Err(e) => {
                warn!("failed to store block time gap at height {}: {e}", gap.height);
                self.stats.failures += 1;
            }
        }
    }
}

impl<B: Backend> LineSink for Pipeline<B> {
    fn consume_line(&mut self, line: &str) {
        self.ingest_line(line);
    }

    fn last_commit(&self) -> Option<LastCommit> {
        self.detector.last()
    }
}

/// Feed every line of `path` to `sink`.
///
/// Returns the offset just past the last line delivered. With
/// `include_partial` unset, an unterminated last line is left for the tailer.
pub fn ingest_file<S: LineSink + ?Sized>(
    path: &Path,
    sink: &mut S,
    include_partial: bool,
) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut lines = LineReader::new(BufReader::new(file), 0).include_partial(include_partial);
    for line in lines.by_ref() {
        sink.consume_line(&line?);
    }
    Ok(lines.offset())
}
