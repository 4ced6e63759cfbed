use chrono::{TimeZone, Utc};
use commit_ingest::store::{Backend, Document, ID_FIELD};
use commit_ingest::{COMMITTED_STATE, CommittedEvent, EventStore, Insert, JsonlBackend, StoreError};
use std::fs;
use std::io::Write;
use tempfile::tempdir;

fn commit(height: i64) -> CommittedEvent {
    CommittedEvent {
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, height as u32 % 60).unwrap(),
        module: "state".into(),
        height,
        txs: 1,
        app_hash: format!("H{height}"),
    }
}

fn height_doc(height: i64) -> Document {
    let mut doc = Document::new();
    doc.insert("height".to_string(), height.into());
    doc
}

fn open_store(dir: &std::path::Path) -> EventStore<JsonlBackend> {
    let mut store = EventStore::new(JsonlBackend::open(dir).unwrap());
    store.ensure_indexes().unwrap();
    store
}

#[test]
fn test_documents_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let mut store = open_store(dir.path());
        store.insert(&commit(1)).unwrap();
        store.insert(&commit(2)).unwrap();
    }

    let store = open_store(dir.path());
    let commits: Vec<CommittedEvent> = store.all().unwrap();
    assert_eq!(commits, vec![commit(1), commit(2)]);
}

#[test]
fn test_index_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let mut store = open_store(dir.path());
        store.insert(&commit(5)).unwrap();
    }

    // No ensure_indexes this time: the catalog alone restores the index.
    let mut store = EventStore::new(JsonlBackend::open(dir.path()).unwrap());
    assert_eq!(store.insert(&commit(5)).unwrap(), Insert::AlreadyPresent);
    assert_eq!(store.count(COMMITTED_STATE).unwrap(), 1);
}

#[test]
fn test_ids_keep_increasing_after_reopen() {
    let dir = tempdir().unwrap();
    let first = {
        let mut store = open_store(dir.path());
        match store.insert(&commit(1)).unwrap() {
            Insert::Created(id) => id,
            other => panic!("expected a new document, got {other:?}"),
        }
    };

    let mut store = open_store(dir.path());
    match store.insert(&commit(2)).unwrap() {
        Insert::Created(id) => assert!(id > first),
        other => panic!("expected a new document, got {other:?}"),
    }
}

#[test]
fn test_second_open_is_locked() {
    let dir = tempdir().unwrap();
    let first = JsonlBackend::open(dir.path()).unwrap();

    let err = JsonlBackend::open(dir.path()).unwrap_err();
    assert!(matches!(err, StoreError::Locked { .. }));

    drop(first);
    JsonlBackend::open(dir.path()).unwrap();
}

#[test]
fn test_duplicates_on_disk_are_repaired() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(format!("{COMMITTED_STATE}.jsonl"));
    fs::write(
        &path,
        concat!(
            "{\"_id\":1,\"height\":100,\"module\":\"a\"}\n",
            "{\"_id\":2,\"height\":101,\"module\":\"b\"}\n",
            "{\"_id\":3,\"height\":100,\"module\":\"c\"}\n",
        ),
    )
    .unwrap();

    {
        let store = open_store(dir.path());
        let docs = store.backend().documents(COMMITTED_STATE).unwrap();
        let modules: Vec<_> = docs.iter().map(|d| d["module"].as_str().unwrap()).collect();
        assert_eq!(modules, vec!["a", "b"]);
    }

    // The repair was written back.
    let contents = fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 2);
    let backend = JsonlBackend::open(dir.path()).unwrap();
    assert!(backend.duplicate_groups(COMMITTED_STATE, "height").unwrap().is_empty());
}

#[test]
fn test_partial_trailing_line_is_truncated() {
    let dir = tempdir().unwrap();
    {
        let mut store = open_store(dir.path());
        store.insert(&commit(1)).unwrap();
    }

    let path = dir.path().join(format!("{COMMITTED_STATE}.jsonl"));
    let intact = fs::metadata(&path).unwrap().len();
    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"{\"_id\":2,\"heig").unwrap();
    drop(file);

    let mut store = open_store(dir.path());
    assert_eq!(fs::metadata(&path).unwrap().len(), intact);
    assert_eq!(store.count(COMMITTED_STATE).unwrap(), 1);

    // Appends continue cleanly after the cut.
    store.insert(&commit(2)).unwrap();
    drop(store);
    let store = open_store(dir.path());
    assert_eq!(store.count(COMMITTED_STATE).unwrap(), 2);
}

#[test]
fn test_corrupt_line_fails_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(format!("{COMMITTED_STATE}.jsonl"));
    fs::write(&path, "{\"_id\":1,\"height\":1}\nnot json\n").unwrap();

    match JsonlBackend::open(dir.path()).unwrap_err() {
        StoreError::Corrupt { line, .. } => assert_eq!(line, 2),
        other => panic!("expected Corrupt, got {other:?}"),
    }
}

#[test]
fn test_document_without_id_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(format!("{COMMITTED_STATE}.jsonl"));
    fs::write(&path, "{\"height\":1}\n").unwrap();

    let err = JsonlBackend::open(dir.path()).unwrap_err();
    assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
}

#[test]
fn test_stored_documents_carry_ids() {
    let dir = tempdir().unwrap();
    let mut store = open_store(dir.path());
    store.insert(&commit(9)).unwrap();

    let docs = store.backend().documents(COMMITTED_STATE).unwrap();
    assert!(docs[0].get(ID_FIELD).and_then(|v| v.as_u64()).is_some());
    assert_eq!(docs[0]["appHash"], "H9");
}

#[test]
fn test_failed_append_leaves_no_fragment() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(format!("{COMMITTED_STATE}.jsonl"));
    {
        let mut store = open_store(dir.path());
        store.insert(&commit(1)).unwrap();

        // What a write interrupted halfway through leaves behind.
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"_id\":2,\"heig").unwrap();
        drop(file);

        assert!(matches!(store.insert(&commit(3)).unwrap(), Insert::Created(_)));
    }

    let store = open_store(dir.path());
    let commits: Vec<CommittedEvent> = store.all().unwrap();
    assert_eq!(commits, vec![commit(1), commit(3)]);
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.lines().all(|l| l.starts_with('{') && l.ends_with('}')));
}

#[test]
fn test_reads_reflect_deletes_and_appends() {
    let dir = tempdir().unwrap();
    let mut backend = JsonlBackend::open(dir.path()).unwrap();
    let mut ids = Vec::new();
    for h in [1, 2, 2, 3] {
        ids.push(backend.insert_one(COMMITTED_STATE, height_doc(h)).unwrap());
    }

    let groups = backend.duplicate_groups(COMMITTED_STATE, "height").unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].ids, vec![ids[1], ids[2]]);

    assert_eq!(backend.delete_many(COMMITTED_STATE, &[ids[2]]).unwrap(), 1);
    backend.create_unique_index(COMMITTED_STATE, "height").unwrap();

    let last = backend.insert_one(COMMITTED_STATE, height_doc(4)).unwrap();
    assert!(last > ids[3]);

    let heights: Vec<i64> = backend
        .documents(COMMITTED_STATE)
        .unwrap()
        .iter()
        .map(|d| d["height"].as_i64().unwrap())
        .collect();
    assert_eq!(heights, vec![1, 2, 3, 4]);
}
