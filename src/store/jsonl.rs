use super::collection::{Grouping, UniqueIndex};
use super::{Backend, DocId, Document, DuplicateGroup, ID_FIELD, IndexOutcome, StoreError};
use crate::atomic;
use crate::lines::LineReader;
use fs2::FileExt;
use log::{debug, warn};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const CATALOG_FILE: &str = "catalog.json";
const LOCK_FILE: &str = "LOCK";
const EXTENSION: &str = "jsonl";

/// Unique index fields per collection.
type Catalog = BTreeMap<String, Vec<String>>;

/// Durable backend storing each collection as a JSON-lines file.
///
/// Layout of the database directory:
///
/// ```text
/// <dir>/
///   LOCK                    advisory lock held while open
///   catalog.json            unique index definitions
///   committed_state.jsonl   one document per line
///   block_time_gap.jsonl
/// ```
///
/// Only index keys and the next `_id` are held in memory; reads stream the
/// collection file. Inserts append a line and `sync_data` before the document
/// becomes visible. Deletes rewrite the collection file through a `.tmp` +
/// rename.
#[derive(Debug)]
pub struct JsonlBackend {
    dir: PathBuf,
    catalog: Catalog,
    collections: HashMap<String, JsonlCollection>,
    _lock: File,
}

#[derive(Debug)]
struct JsonlCollection {
    name: String,
    path: PathBuf,
    file: File,
    /// Length of the file up to the end of the last complete document.
    len: u64,
    next_id: DocId,
    indexes: Vec<UniqueIndex>,
}

impl JsonlBackend {
    /// Open or create a database directory.
    ///
    /// Takes an exclusive lock on `<dir>/LOCK`; a second open of the same
    /// directory fails with [`StoreError::Locked`] until the first is dropped.
    /// A partial last line left by a crash mid-append is cut off.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        match lock.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(StoreError::Locked { path: dir });
            }
            Err(e) => return Err(e.into()),
        }

        let mut backend = JsonlBackend {
            catalog: load_catalog(&dir.join(CATALOG_FILE)),
            dir,
            collections: HashMap::new(),
            _lock: lock,
        };
        backend.load_collections()?;
        Ok(backend)
    }

    /// Returns the database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file backing `collection`.
    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.{EXTENSION}"))
    }

    fn load_collections(&mut self) -> Result<(), StoreError> {
        let mut dropped = false;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let name = name.to_string();

            let fields = self.catalog.get(&name).cloned().unwrap_or_default();
            let (coll, violated) = JsonlCollection::load(&name, path, &fields)?;
            if !violated.is_empty() {
                for field in &violated {
                    warn!(
                        "{}: contents violate unique index on {field}, dropping it",
                        coll.path.display()
                    );
                }
                if let Some(list) = self.catalog.get_mut(&name) {
                    list.retain(|f| !violated.contains(f));
                }
                dropped = true;
            }
            self.collections.insert(name, coll);
        }

        if dropped {
            self.save_catalog()?;
        }
        Ok(())
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut JsonlCollection, StoreError> {
        let path = self.collection_path(name);
        match self.collections.entry(name.to_string()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let file = open_append(&path)?;
                let len = file.metadata()?.len();
                Ok(e.insert(JsonlCollection {
                    name: name.to_string(),
                    path,
                    file,
                    len,
                    next_id: 1,
                    indexes: Vec::new(),
                }))
            }
        }
    }

    fn save_catalog(&self) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.catalog)?;
        atomic::write_atomic(&self.dir.join(CATALOG_FILE), &json)?;
        Ok(())
    }
}

impl JsonlCollection {
    /// Scan an existing collection file, rebuilding the indexes named in
    /// `fields`. Returns the collection and the fields whose index the
    /// contents violate; those indexes are left out.
    fn load(
        name: &str,
        path: PathBuf,
        fields: &[String],
    ) -> Result<(Self, Vec<String>), StoreError> {
        let mut indexes: Vec<UniqueIndex> = fields.iter().map(|f| UniqueIndex::new(f)).collect();
        let mut violated: Vec<String> = Vec::new();
        let mut next_id = 1;
        let mut count = 0usize;

        let end = scan(&path, |id, doc, _| {
            count += 1;
            next_id = next_id.max(id + 1);
            for idx in &mut indexes {
                if !idx.add(&doc) && !violated.iter().any(|f| f == idx.field()) {
                    violated.push(idx.field().to_string());
                }
            }
            Ok(())
        })?;
        indexes.retain(|idx| !violated.iter().any(|f| f == idx.field()));
        debug!("loaded {count} documents from {}", path.display());

        let actual = fs::metadata(&path)?.len();
        if actual > end {
            warn!(
                "{}: dropping partial last line ({} bytes)",
                path.display(),
                actual - end
            );
            OpenOptions::new().write(true).open(&path)?.set_len(end)?;
        }

        let file = open_append(&path)?;
        let coll = JsonlCollection {
            name: name.to_string(),
            path,
            file,
            len: end,
            next_id,
            indexes,
        };
        Ok((coll, violated))
    }

    fn has_index(&self, field: &str) -> bool {
        self.indexes.iter().any(|idx| idx.field() == field)
    }

    fn create_unique_index(&mut self, field: &str) -> Result<IndexOutcome, StoreError> {
        if self.has_index(field) {
            return Ok(IndexOutcome::AlreadyExists);
        }
        let mut index = UniqueIndex::new(field);
        scan(&self.path, |_, doc, _| {
            index.check(&self.name, &doc)?;
            index.add(&doc);
            Ok(())
        })?;
        self.indexes.push(index);
        Ok(IndexOutcome::Created)
    }

    fn insert(&mut self, mut doc: Document) -> Result<DocId, StoreError> {
        for idx in &self.indexes {
            idx.check(&self.name, &doc)?;
        }
        let id = self.next_id;
        doc.insert(ID_FIELD.to_string(), Value::from(id));

        self.append(&doc)?;
        self.next_id += 1;
        for idx in &mut self.indexes {
            idx.add(&doc);
        }
        Ok(id)
    }

    /// Append one document line.
    ///
    /// Bytes past `len` are the remains of an append that failed midway and
    /// are cut off first. A failed write is rolled back to `len` as well, so
    /// the file always ends on a complete line.
    fn append(&mut self, doc: &Document) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(doc)?;
        line.push(b'\n');

        let actual = self.file.metadata()?.len();
        if actual > self.len {
            warn!(
                "{}: cutting {} bytes left by a failed append",
                self.path.display(),
                actual - self.len
            );
            self.file.set_len(self.len)?;
        }

        let written = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            if let Err(undo) = self.file.set_len(self.len) {
                warn!("{}: cannot roll back append: {undo}", self.path.display());
            }
            return Err(e.into());
        }
        self.len += line.len() as u64;
        Ok(())
    }

    fn duplicate_groups(&self, field: &str) -> Result<Vec<DuplicateGroup>, StoreError> {
        let mut grouping = Grouping::new(field);
        scan(&self.path, |id, doc, _| {
            grouping.add(id, &doc);
            Ok(())
        })?;
        Ok(grouping.duplicates())
    }

    /// Rewrite the file without the documents in `ids`, rebuilding the
    /// indexes from what remains.
    fn delete_many(&mut self, ids: &[DocId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let doomed: HashSet<DocId> = ids.iter().copied().collect();
        let mut indexes: Vec<UniqueIndex> = self
            .indexes
            .iter()
            .map(|idx| UniqueIndex::new(idx.field()))
            .collect();

        let tmp = atomic::tmp_path(&self.path);
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut removed = 0;
        let mut len = 0u64;
        scan(&self.path, |id, doc, line| {
            if doomed.contains(&id) {
                removed += 1;
                return Ok(());
            }
            for idx in &mut indexes {
                idx.add(&doc);
            }
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
            len += line.len() as u64 + 1;
            Ok(())
        })?;

        if removed == 0 {
            drop(out);
            fs::remove_file(&tmp)?;
            return Ok(0);
        }

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;

        // The old handle points at the replaced file.
        self.file = open_append(&self.path)?;
        self.len = len;
        self.indexes = indexes;
        Ok(removed)
    }

    fn documents(&self) -> Result<Vec<Document>, StoreError> {
        let mut docs = Vec::new();
        scan(&self.path, |_, doc, _| {
            docs.push(doc);
            Ok(())
        })?;
        Ok(docs)
    }
}

impl Backend for JsonlBackend {
    type Id = DocId;

    fn create_unique_index(
        &mut self,
        collection: &str,
        field: &str,
    ) -> Result<IndexOutcome, StoreError> {
        let outcome = self.collection_mut(collection)?.create_unique_index(field)?;

        let fields = self.catalog.entry(collection.to_string()).or_default();
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
            self.save_catalog()?;
        }
        Ok(outcome)
    }

    fn insert_one(&mut self, collection: &str, doc: Document) -> Result<DocId, StoreError> {
        self.collection_mut(collection)?.insert(doc)
    }

    fn duplicate_groups(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<Vec<DuplicateGroup>, StoreError> {
        match self.collections.get(collection) {
            Some(coll) => coll.duplicate_groups(field),
            None => Ok(Vec::new()),
        }
    }

    fn delete_many(&mut self, collection: &str, ids: &[DocId]) -> Result<usize, StoreError> {
        match self.collections.get_mut(collection) {
            Some(coll) => coll.delete_many(ids),
            None => Ok(0),
        }
    }

    fn documents(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        match self.collections.get(collection) {
            Some(coll) => coll.documents(),
            None => Ok(Vec::new()),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Missing or unreadable catalogs are treated as empty: indexes are recreated
/// by the next `ensure_indexes`.
fn load_catalog(path: &Path) -> Catalog {
    let contents = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Catalog::new(),
        Err(e) => {
            warn!("cannot read {}: {e}, ignoring catalog", path.display());
            return Catalog::new();
        }
    };
    match serde_json::from_slice(&contents) {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!("corrupt catalog {}: {e}, ignoring", path.display());
            Catalog::new()
        }
    }
}

/// Stream the complete lines of a collection file, calling `f` with each
/// document, its `_id` and its raw line.
///
/// Returns the offset just past the last complete line. A trailing line
/// without a newline is not passed to `f`.
fn scan<F>(path: &Path, mut f: F) -> Result<u64, StoreError>
where
    F: FnMut(DocId, Document, &str) -> Result<(), StoreError>,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut lines = LineReader::new(BufReader::new(file), 0);
    let mut line_no = 0;
    for line in lines.by_ref() {
        let line = line?;
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.to_path_buf(),
            line: line_no,
            reason,
        };
        let doc: Document = serde_json::from_str(&line).map_err(|e| corrupt(e.to_string()))?;
        let id = doc
            .get(ID_FIELD)
            .and_then(Value::as_u64)
            .ok_or_else(|| corrupt(format!("missing numeric {ID_FIELD}")))?;
        f(id, doc, &line)?;
    }
    Ok(lines.offset())
}
