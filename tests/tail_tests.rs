mod common;

use common::{
    append_lines, append_raw, commit_line, gap_pairs, heights, memory_pipeline, write_lines,
};
use commit_ingest::{Change, LineSink, TailError, Tailer};
use notify::event::{CreateKind, DataChange, ModifyKind};
use notify::{Event, EventKind};
use std::fs;
use std::sync::mpsc;
use std::time::Duration;
use tempfile::tempdir;

fn write_event(path: &std::path::Path) -> notify::Result<Event> {
    Ok(Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any)))
        .add_path(path.to_path_buf()))
}

fn create_event(path: &std::path::Path) -> notify::Result<Event> {
    Ok(Event::new(EventKind::Create(CreateKind::File)).add_path(path.to_path_buf()))
}

#[test]
fn test_at_end_skips_existing_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.txt");
    write_lines(&path, &[commit_line(1, 0)]);

    let mut tailer = Tailer::at_end(&path);
    let mut lines: Vec<String> = Vec::new();
    assert_eq!(tailer.drain(&mut lines).unwrap(), 0);

    append_lines(&path, &[commit_line(2, 1)]);
    assert_eq!(tailer.drain(&mut lines).unwrap(), 1);
    assert_eq!(lines, vec![commit_line(2, 1)]);
    assert_eq!(tailer.offset(), fs::metadata(&path).unwrap().len());
}

#[test]
fn test_at_end_of_missing_file_starts_at_zero() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.txt");

    let mut tailer = Tailer::at_end(&path);
    let mut lines: Vec<String> = Vec::new();
    assert_eq!(tailer.drain(&mut lines).unwrap(), 0);

    append_lines(&path, &[commit_line(1, 0)]);
    assert_eq!(tailer.drain(&mut lines).unwrap(), 1);
    assert_eq!(tailer.offset(), fs::metadata(&path).unwrap().len());
}

#[test]
fn test_partial_line_waits_for_newline() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.txt");
    let line = commit_line(1, 0);
    let (head, tail) = line.split_at(25);

    let mut tailer = Tailer::at_offset(&path, 0);
    let mut lines: Vec<String> = Vec::new();

    append_raw(&path, head);
    assert_eq!(tailer.drain(&mut lines).unwrap(), 0);
    assert_eq!(tailer.offset(), 0);

    append_raw(&path, &format!("{tail}\n"));
    assert_eq!(tailer.drain(&mut lines).unwrap(), 1);
    assert_eq!(lines, vec![line]);
}

#[test]
fn test_rotation_resets_to_new_file_start() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.txt");
    write_lines(&path, &[commit_line(1, 0), commit_line(2, 1)]);

    let mut tailer = Tailer::at_end(&path);
    let before = tailer.offset();
    assert!(before > 0);

    // Rotate: move the old file aside, the producer writes to a fresh one
    // before the tailer hears about it.
    fs::rename(&path, dir.path().join("live.txt.1")).unwrap();
    write_lines(&path, &[commit_line(3, 2)]);
    append_lines(&path, &[commit_line(4, 3)]);

    let mut lines: Vec<String> = Vec::new();
    tailer.apply(Change::Rotated, &mut lines);

    assert_eq!(lines, vec![commit_line(3, 2), commit_line(4, 3)]);
    assert_eq!(tailer.offset(), fs::metadata(&path).unwrap().len());
}

#[test]
fn test_rotation_before_new_file_exists() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.txt");
    write_lines(&path, &[commit_line(1, 0)]);
    let mut tailer = Tailer::at_end(&path);

    fs::rename(&path, dir.path().join("live.txt.1")).unwrap();
    let mut lines: Vec<String> = Vec::new();
    tailer.apply(Change::Rotated, &mut lines);
    assert!(lines.is_empty());
    assert_eq!(tailer.offset(), 0);

    write_lines(&path, &[commit_line(2, 1)]);
    tailer.apply(Change::Written, &mut lines);
    assert_eq!(lines, vec![commit_line(2, 1)]);
}

#[test]
fn test_truncation_resets_offset() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.txt");
    write_lines(&path, &[commit_line(1, 0), commit_line(2, 1), commit_line(3, 2)]);
    let mut tailer = Tailer::at_end(&path);

    // copytruncate-style rotation: same inode, shorter content
    write_lines(&path, &[commit_line(4, 3)]);

    let mut lines: Vec<String> = Vec::new();
    assert_eq!(tailer.drain(&mut lines).unwrap(), 1);
    assert_eq!(lines, vec![commit_line(4, 3)]);
}

#[test]
fn test_run_with_drives_pipeline_until_channel_closes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.txt");
    write_lines(&path, &[commit_line(1, 0)]);

    let mut pipeline = memory_pipeline();
    let mut tailer = Tailer::at_offset(&path, 0);
    let (tx, rx) = mpsc::channel();

    append_lines(&path, &[commit_line(2, 8)]);
    tx.send(write_event(&path)).unwrap();
    tx.send(Err(notify::Error::generic("spurious"))).unwrap();
    // Events for other files in the directory are ignored.
    tx.send(write_event(&dir.path().join("other.txt"))).unwrap();

    fs::rename(&path, dir.path().join("live.txt.1")).unwrap();
    write_lines(&path, &[commit_line(3, 9), commit_line(4, 20)]);
    tx.send(create_event(&path)).unwrap();
    drop(tx);

    let err = tailer.run_with(&rx, &mut pipeline).unwrap_err();
    assert!(matches!(err, TailError::WatchClosed));

    assert_eq!(heights(&pipeline), vec![1, 2, 3, 4]);
    assert_eq!(gap_pairs(&pipeline), vec![(1, 2), (3, 4)]);
}

/// Forwards lines to a channel so a test can observe a tailer running on
/// another thread.
struct ChannelSink(mpsc::Sender<String>);

impl LineSink for ChannelSink {
    fn consume_line(&mut self, line: &str) {
        let _ = self.0.send(line.to_string());
    }
}

#[test]
fn test_run_follows_writes_and_rotation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.txt");
    write_lines(&path, &[commit_line(1, 0)]);

    let (tx, rx) = mpsc::channel();
    let tail_path = path.clone();
    std::thread::spawn(move || {
        let mut sink = ChannelSink(tx);
        let _ = Tailer::at_end(&tail_path).run(&mut sink);
    });

    // Give the watcher time to register.
    std::thread::sleep(Duration::from_millis(300));

    append_lines(&path, &[commit_line(2, 1)]);
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        commit_line(2, 1)
    );

    fs::rename(&path, dir.path().join("live.txt.1")).unwrap();
    write_lines(&path, &[commit_line(3, 2)]);
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        commit_line(3, 2)
    );
}
