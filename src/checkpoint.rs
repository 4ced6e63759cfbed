//! Persisted tail position.
//!
//! A [`TailCheckpoint`] records how far the live log has been consumed and
//! the gap detector's last commit, so a restart that skips historical replay
//! can resume where it stopped instead of jumping to end of file.

use crate::atomic;
use crate::gap::LastCommit;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// File name of the checkpoint inside the database directory.
pub const CHECKPOINT_FILE: &str = "tail_cursor.json";

/// Compute xxh64 hash of raw line bytes (without trailing newline), hex-encoded.
pub fn line_hash(line: &[u8]) -> String {
    let hash = xxhash_rust::xxh64::xxh64(line, 0);
    format!("{:016x}", hash)
}

/// A persisted tail position.
///
/// ```text
/// $ cat data/node_logs/tail_cursor.json | jq .
/// {
///   "last": { "timestamp": "2024-01-01T00:00:11Z", "height": 11 },
///   "offset": 1284,
///   "hash": "a3f2e1b09c4d..."
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailCheckpoint {
    /// Gap detector state at `offset`.
    pub last: Option<LastCommit>,

    /// Byte offset into the live log just past the last consumed line.
    pub offset: u64,

    /// Hash of the last consumed line, empty when `offset` is 0.
    pub hash: String,
}

/// Outcome of checking a checkpoint against the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    OffsetBeyondEof,
    HashMismatch,
}

impl TailCheckpoint {
    pub fn new(last: Option<LastCommit>, offset: u64, hash: String) -> Self {
        TailCheckpoint { last, offset, hash }
    }

    /// Check that `log_path` still holds the line this checkpoint ends on.
    ///
    /// A rotated or truncated file fails the check and the checkpoint should
    /// be discarded.
    pub fn verify(&self, log_path: &Path) -> io::Result<Validity> {
        let mut file = match File::open(log_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.offset > 0 => {
                return Ok(Validity::OffsetBeyondEof);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Validity::Valid),
            Err(e) => return Err(e),
        };

        if self.offset > file.metadata()?.len() {
            return Ok(Validity::OffsetBeyondEof);
        }
        if self.offset == 0 {
            return Ok(Validity::Valid);
        }

        match read_line_hash_before(&mut file, self.offset)? {
            Some(hash) if hash == self.hash => Ok(Validity::Valid),
            Some(_) => Ok(Validity::HashMismatch),
            None => Ok(Validity::Valid),
        }
    }
}

/// Save a checkpoint atomically.
pub fn save(path: &Path, checkpoint: &TailCheckpoint) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(checkpoint)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    atomic::write_atomic(path, &json)
}

/// Load a checkpoint.
///
/// Returns `Ok(None)` if the file doesn't exist or doesn't deserialize.
pub fn load(path: &Path) -> io::Result<Option<TailCheckpoint>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match serde_json::from_str(&contents) {
        Ok(checkpoint) => Ok(Some(checkpoint)),
        Err(_) => Ok(None),
    }
}

/// Delete a checkpoint file and its `.tmp` file if present.
pub fn delete(path: &Path) -> io::Result<()> {
    atomic::remove_with_tmp(path)
}

/// Read the line immediately before `offset` and return its hash.
///
/// The offset should point to the byte after the newline of the last consumed
/// line. Returns `None` if offset is 0 or past the end of the file.
pub fn read_line_hash_before<F: Read + Seek>(
    file: &mut F,
    offset: u64,
) -> io::Result<Option<String>> {
    if offset == 0 {
        return Ok(None);
    }

    let file_len = file.seek(SeekFrom::End(0))?;

    if offset > file_len {
        return Ok(None);
    }

    // offset - 1 is the '\n' at end of previous line
    let newline_pos = offset - 1;
    let mut start = 0u64;

    if newline_pos > 0 {
        let scan_start = newline_pos.saturating_sub(8192);
        file.seek(SeekFrom::Start(scan_start))?;
        let mut buf = vec![0u8; (newline_pos - scan_start) as usize];
        file.read_exact(&mut buf)?;

        if let Some(pos) = buf.iter().rposition(|&b| b == b'\n') {
            start = scan_start + pos as u64 + 1;
        } else {
            start = scan_start;
        }
    }

    file.seek(SeekFrom::Start(start))?;
    let mut line_buf = vec![0u8; (newline_pos - start) as usize];
    file.read_exact(&mut line_buf)?;

    Ok(Some(line_hash(&line_buf)))
}
