//! Replay of rotated log segments.
//!
//! The node rotates `stdout.txt` to `stdout.txt.1`, `stdout.txt.2`, ... with
//! larger suffixes being newer. Replaying them in ascending order before the
//! live file keeps the gap detector's view chronological.

use crate::pipeline::{LineSink, ingest_file};
use log::{info, warn};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One rotated file, `<live name>.<index>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: u64,
    pub path: PathBuf,
}

/// What a replay got through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub segments: usize,
    pub skipped: usize,
}

/// List the rotated segments of `live_name` in `dir`, oldest first.
///
/// Only files named exactly `<live_name>.<digits>` qualify; names whose suffix
/// does not fit a `u64` are ignored. Symlinks count when they resolve to a
/// regular file. Entries that cannot be inspected are logged and skipped.
pub fn scan_segments(dir: &Path, live_name: &str) -> io::Result<Vec<Segment>> {
    let pattern = Regex::new(&format!(r"^{}\.(\d+)$", regex::escape(live_name)))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("cannot read entry in {}: {e}", dir.display());
                continue;
            }
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(index) = pattern
            .captures(name)
            .and_then(|caps| caps[1].parse::<u64>().ok())
        else {
            continue;
        };

        let path = entry.path();
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                warn!("skipping segment {}: {e}", path.display());
                continue;
            }
        }
        segments.push(Segment { index, path });
    }

    segments.sort_by_key(|s| s.index);
    Ok(segments)
}

/// Feed every rotated segment of `live_name` to `sink`, oldest first.
///
/// An unreadable directory ends the replay early; an unreadable segment is
/// skipped. Neither is an error for the caller.
pub fn replay_history<S: LineSink + ?Sized>(
    dir: &Path,
    live_name: &str,
    sink: &mut S,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    info!("replaying rotated segments in {}", dir.display());

    let segments = match scan_segments(dir, live_name) {
        Ok(segments) => segments,
        Err(e) => {
            warn!("cannot read log directory {}: {e}", dir.display());
            return summary;
        }
    };

    for segment in segments {
        info!("replaying {}", segment.path.display());
        // Rotated segments are final, so an unterminated last line is complete.
        match ingest_file(&segment.path, sink, true) {
            Ok(_) => summary.segments += 1,
            Err(e) => {
                warn!("cannot read segment {}: {e}", segment.path.display());
                summary.skipped += 1;
            }
        }
    }

    info!(
        "replayed {} rotated segments ({} skipped)",
        summary.segments, summary.skipped
    );
    summary
}
