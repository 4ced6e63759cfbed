#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use commit_ingest::store::Backend;
use commit_ingest::{CommittedEvent, EventStore, GapDetector, GapEvent, MemoryBackend, Pipeline};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// A "Committed State" line `secs` seconds after 2024-01-01T00:00:00.
pub fn commit_line(height: i64, secs: i64) -> String {
    commit_line_ms(height, secs * 1_000)
}

pub fn commit_line_ms(height: i64, millis: i64) -> String {
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(millis);
    format!(
        "I[{}] Committed State module=state height={height} txs={} appHash=H{height}",
        ts.format("%Y-%m-%d|%H:%M:%S%.3f"),
        height % 5
    )
}

pub fn noise_line(i: usize) -> String {
    format!("I[2024-01-01|00:00:00.000] Executed block module=state height={i} validTxs=0 invalidTxs=0")
}

pub fn write_lines(path: &Path, lines: &[String]) {
    let mut body = String::new();
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }
    fs::write(path, body).unwrap();
}

pub fn append_raw(path: &Path, text: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.sync_data().unwrap();
}

pub fn append_lines(path: &Path, lines: &[String]) {
    for line in lines {
        append_raw(path, &format!("{line}\n"));
    }
}

pub fn memory_pipeline() -> Pipeline<MemoryBackend> {
    let mut store = EventStore::new(MemoryBackend::new());
    store.ensure_indexes().unwrap();
    Pipeline::new(store, GapDetector::default())
}

pub fn heights<B: Backend>(pipeline: &Pipeline<B>) -> Vec<i64> {
    let commits: Vec<CommittedEvent> = pipeline.store().all().unwrap();
    commits.iter().map(|c| c.height).collect()
}

/// `(previous_height, height)` of every stored gap.
pub fn gap_pairs<B: Backend>(pipeline: &Pipeline<B>) -> Vec<(i64, i64)> {
    let gaps: Vec<GapEvent> = pipeline.store().all().unwrap();
    gaps.iter().map(|g| (g.previous_height, g.height)).collect()
}
