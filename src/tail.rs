//! Rotation-aware tailing of the live log file.
//!
//! The containing directory is watched rather than the file itself: rotation
//! replaces the file, and a watch on the old inode would go quiet.

use crate::checkpoint::{self, TailCheckpoint, read_line_hash_before};
use crate::lines::LineReader;
use crate::pipeline::LineSink;
use log::{debug, info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::convert::Infallible;
use std::fs::{self, File};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TailError {
    #[error("cannot watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("file watch channel closed")]
    WatchClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What a directory notification means for the watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// A new file appeared at the watched path.
    Rotated,
    /// The watched file grew.
    Written,
}

/// Follows one log file across rotations.
///
/// Holds an open handle and the byte offset just past the last complete line
/// delivered. The offset goes back to 0 when the path is recreated or the file
/// shrinks below it.
#[derive(Debug)]
pub struct Tailer {
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    checkpoint: Option<PathBuf>,
}

impl Tailer {
    /// Tail `path` from `offset`. The file is opened now if it exists.
    pub fn at_offset(path: impl Into<PathBuf>, offset: u64) -> Self {
        let path = path.into();
        let file = match File::open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("cannot open {}: {e}", path.display());
                }
                None
            }
        };
        Tailer {
            path,
            file,
            offset,
            checkpoint: None,
        }
    }

    /// Tail `path` from its current end, or from 0 if it doesn't exist yet.
    pub fn at_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Tailer::at_offset(path, size)
    }

    /// Persist a [`TailCheckpoint`] to `path` after every read that consumed
    /// lines and after every rotation.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Watch the containing directory and feed new lines to `sink` forever.
    ///
    /// Returns only on failure: the watch could not be set up, or its event
    /// channel closed.
    pub fn run<S: LineSink + ?Sized>(mut self, sink: &mut S) -> Result<Infallible, TailError> {
        let dir = self.resolve_dir()?;

        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(tx).map_err(|source| TailError::Watch {
            path: dir.clone(),
            source,
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| TailError::Watch {
                path: dir.clone(),
                source,
            })?;
        info!("watching {} from offset {}", self.path.display(), self.offset);

        // Lines appended before the watch went live.
        self.apply(Change::Written, sink);

        self.run_with(&rx, sink)
    }

    /// The notification loop of [`run`](Tailer::run), over any event source.
    pub fn run_with<S: LineSink + ?Sized>(
        &mut self,
        events: &Receiver<notify::Result<Event>>,
        sink: &mut S,
    ) -> Result<Infallible, TailError> {
        for item in events {
            match item {
                Ok(event) => {
                    if let Some(change) = self.classify(&event) {
                        self.apply(change, sink);
                    }
                }
                Err(e) => warn!("file watch error: {e}"),
            }
        }
        Err(TailError::WatchClosed)
    }

    /// Map a directory notification to a change of the watched file.
    ///
    /// Events for other files in the directory yield `None`.
    pub fn classify(&self, event: &Event) -> Option<Change> {
        // A paired rename carries `[from, to]`; only a move onto the path
        // replaces the file.
        if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
            return (event.paths.last() == Some(&self.path)).then_some(Change::Rotated);
        }
        if !event.paths.iter().any(|p| p == &self.path) {
            return None;
        }
        match event.kind {
            EventKind::Create(_) => Some(Change::Rotated),
            EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
                Some(Change::Rotated)
            }
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => Some(Change::Written),
            _ => None,
        }
    }

    /// React to a change: reopen on rotation, then read whatever is new.
    ///
    /// Failures are logged; the next notification retries.
    pub fn apply<S: LineSink + ?Sized>(&mut self, change: Change, sink: &mut S) {
        if change == Change::Rotated {
            self.reopen();
            self.save_checkpoint(&*sink);
        }
        if let Err(e) = self.drain(sink) {
            warn!("cannot read {}: {e}", self.path.display());
        }
    }

    /// Drop the current handle and start over at offset 0 of whatever file
    /// now lives at the path.
    pub fn reopen(&mut self) {
        info!("{} was recreated, reading from the start", self.path.display());
        self.offset = 0;
        self.file = match File::open(&self.path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("cannot open {}: {e}", self.path.display());
                None
            }
        };
    }

    /// Deliver every complete line past the offset and advance it.
    ///
    /// A trailing unterminated line is left in place and re-read by a later
    /// call once it is complete. Returns the number of lines delivered.
    pub fn drain<S: LineSink + ?Sized>(&mut self, sink: &mut S) -> io::Result<usize> {
        if self.file.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} does not exist yet", self.path.display());
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            info!(
                "{} shrank to {len} bytes below offset {}, reading from the start",
                self.path.display(),
                self.offset
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut lines = LineReader::new(BufReader::new(&mut *file), self.offset);
        let mut count = 0;
        for line in lines.by_ref() {
            sink.consume_line(&line?);
            count += 1;
        }
        self.offset = lines.offset();

        if count > 0 {
            debug!(
                "read {count} lines from {}, offset now {}",
                self.path.display(),
                self.offset
            );
            self.save_checkpoint(&*sink);
        }
        Ok(count)
    }

    fn save_checkpoint<S: LineSink + ?Sized>(&mut self, sink: &S) {
        let Some(path) = self.checkpoint.clone() else {
            return;
        };

        let hash = match self.file.as_mut() {
            Some(file) => match read_line_hash_before(file, self.offset) {
                Ok(hash) => hash.unwrap_or_default(),
                Err(e) => {
                    warn!("cannot hash last line of {}: {e}", self.path.display());
                    return;
                }
            },
            None => String::new(),
        };

        let cp = TailCheckpoint::new(sink.last_commit(), self.offset, hash);
        if let Err(e) = checkpoint::save(&path, &cp) {
            warn!("cannot save tail checkpoint {}: {e}", path.display());
        }
    }

    /// Canonicalize the containing directory so watched paths compare equal to
    /// the paths notifications carry.
    fn resolve_dir(&mut self) -> io::Result<PathBuf> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let dir = fs::canonicalize(&parent)?;
        if let Some(name) = self.path.file_name() {
            self.path = dir.join(name);
        }
        Ok(dir)
    }
}
