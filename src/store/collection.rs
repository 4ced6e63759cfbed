use super::StoreError;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// A stored document: a JSON object carrying an `_id` field.
pub type Document = Map<String, Value>;

/// Surrogate identifier assigned by the file and memory backends, monotonic
/// within a collection.
pub type DocId = u64;

/// Name of the surrogate identifier field.
pub const ID_FIELD: &str = "_id";

/// Result of asking for a unique index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    AlreadyExists,
}

/// Documents sharing one key value, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup<I = DocId> {
    pub key: Value,
    pub ids: Vec<I>,
}

/// Index key of `field` in `doc`. A missing field indexes as `null`.
pub fn index_key(doc: &Document, field: &str) -> String {
    doc.get(field)
        .map(Value::to_string)
        .unwrap_or_else(|| Value::Null.to_string())
}

/// Key set of one unique index.
#[derive(Debug, Clone)]
pub(crate) struct UniqueIndex {
    field: String,
    keys: HashSet<String>,
}

impl UniqueIndex {
    pub(crate) fn new(field: &str) -> Self {
        UniqueIndex {
            field: field.to_string(),
            keys: HashSet::new(),
        }
    }

    pub(crate) fn field(&self) -> &str {
        &self.field
    }

    /// Record the key of `doc`. Returns `false` if it was already present.
    pub(crate) fn add(&mut self, doc: &Document) -> bool {
        self.keys.insert(index_key(doc, &self.field))
    }

    /// Fail with [`StoreError::DuplicateKey`] if `doc` collides.
    pub(crate) fn check(&self, collection: &str, doc: &Document) -> Result<(), StoreError> {
        let key = index_key(doc, &self.field);
        if self.keys.contains(&key) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                field: self.field.clone(),
                key,
            });
        }
        Ok(())
    }

    /// Build an index over `docs`, failing on the first collision.
    pub(crate) fn build<'a>(
        collection: &str,
        field: &str,
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> Result<Self, StoreError> {
        let mut index = UniqueIndex::new(field);
        for doc in docs {
            index.check(collection, doc)?;
            index.add(doc);
        }
        Ok(index)
    }
}

/// Groups documents by one field as they are fed in.
///
/// Groups and their ids keep the order of first appearance, so the first id
/// of each group is the oldest document.
#[derive(Debug)]
pub(crate) struct Grouping {
    field: String,
    groups: Vec<DuplicateGroup>,
    positions: HashMap<String, usize>,
}

impl Grouping {
    pub(crate) fn new(field: &str) -> Self {
        Grouping {
            field: field.to_string(),
            groups: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, id: DocId, doc: &Document) {
        let key = index_key(doc, &self.field);
        match self.positions.get(&key) {
            Some(&pos) => self.groups[pos].ids.push(id),
            None => {
                self.positions.insert(key, self.groups.len());
                self.groups.push(DuplicateGroup {
                    key: doc.get(&self.field).cloned().unwrap_or(Value::Null),
                    ids: vec![id],
                });
            }
        }
    }

    /// Only the groups with more than one member.
    pub(crate) fn duplicates(mut self) -> Vec<DuplicateGroup> {
        self.groups.retain(|g| g.ids.len() > 1);
        self.groups
    }
}

/// In-memory collection: documents plus unique indexes.
#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    docs: Vec<(DocId, Document)>,
    indexes: Vec<UniqueIndex>,
    next_id: DocId,
}

impl Collection {
    pub fn new(name: &str) -> Self {
        Collection {
            name: name.to_string(),
            docs: Vec::new(),
            indexes: Vec::new(),
            next_id: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.docs.iter().map(|(_, doc)| doc)
    }

    pub fn has_index(&self, field: &str) -> bool {
        self.indexes.iter().any(|idx| idx.field() == field)
    }

    /// Add a unique index on `field`.
    ///
    /// Fails with [`StoreError::DuplicateKey`] if existing documents already
    /// share a value of `field`; the collection is left unchanged.
    pub fn create_unique_index(&mut self, field: &str) -> Result<IndexOutcome, StoreError> {
        if self.has_index(field) {
            return Ok(IndexOutcome::AlreadyExists);
        }
        let index = UniqueIndex::build(&self.name, field, self.documents())?;
        self.indexes.push(index);
        Ok(IndexOutcome::Created)
    }

    /// Check `doc` against every unique index, assign it the next `_id` and
    /// store it.
    pub fn insert(&mut self, mut doc: Document) -> Result<DocId, StoreError> {
        for idx in &self.indexes {
            idx.check(&self.name, &doc)?;
        }
        let id = self.next_id;
        doc.insert(ID_FIELD.to_string(), Value::from(id));
        for idx in &mut self.indexes {
            idx.add(&doc);
        }
        self.next_id += 1;
        self.docs.push((id, doc));
        Ok(id)
    }

    /// Group documents by `field`, returning only groups with more than one
    /// member.
    pub fn duplicate_groups(&self, field: &str) -> Vec<DuplicateGroup> {
        let mut grouping = Grouping::new(field);
        for (id, doc) in &self.docs {
            grouping.add(*id, doc);
        }
        grouping.duplicates()
    }

    /// Remove the documents with the given ids. Returns how many were removed.
    pub fn delete_many(&mut self, ids: &[DocId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let doomed: HashSet<DocId> = ids.iter().copied().collect();
        let before = self.docs.len();
        self.docs.retain(|(id, _)| !doomed.contains(id));
        let removed = before - self.docs.len();

        if removed > 0 {
            for idx in &mut self.indexes {
                let mut rebuilt = UniqueIndex::new(idx.field());
                for (_, doc) in &self.docs {
                    rebuilt.add(doc);
                }
                *idx = rebuilt;
            }
        }
        removed
    }
}
