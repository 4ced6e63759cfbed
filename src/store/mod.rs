//! Idempotent document storage for committed-state and gap records.
//!
//! [`EventStore`] implements the ingestion contract (unique natural key,
//! insert-or-ignore, duplicate repair) over any [`Backend`]. Three backends
//! ship with the crate: [`MongoBackend`], the file-based [`JsonlBackend`] and
//! [`MemoryBackend`].

mod collection;
mod jsonl;
mod mongo;

pub use collection::{
    Collection, DocId, Document, DuplicateGroup, ID_FIELD, IndexOutcome, index_key,
};
pub use jsonl::JsonlBackend;
pub use mongo::MongoBackend;

use crate::event::{BLOCK_TIME_GAP, COMMITTED_STATE, HEIGHT_KEY, Record};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index already holds this key, or existing documents prevent
    /// building one.
    #[error("duplicate key in {collection}: {field} = {key}")]
    DuplicateKey {
        collection: String,
        field: String,
        key: String,
    },

    #[error("store at {path} is locked by another process")]
    Locked { path: PathBuf },

    #[error("{path}:{line}: corrupt document: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("record did not serialize to a JSON object")]
    NotAnObject,

    #[error("document encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("bson encoding: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[error("mongodb: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey { .. })
    }
}

/// Collection-level operations a document database must offer.
///
/// The shape follows what MongoDB exposes; [`MongoBackend`] maps each call to
/// one driver operation.
pub trait Backend {
    /// Identifier the backend assigns to stored documents.
    type Id: Clone + Debug + PartialEq;

    /// Create a unique index on `field`.
    ///
    /// Must fail with [`StoreError::DuplicateKey`] when existing documents
    /// collide on `field`.
    fn create_unique_index(
        &mut self,
        collection: &str,
        field: &str,
    ) -> Result<IndexOutcome, StoreError>;

    /// Insert a document, assigning its `_id`.
    ///
    /// Must fail with [`StoreError::DuplicateKey`] on a unique index collision.
    fn insert_one(&mut self, collection: &str, doc: Document) -> Result<Self::Id, StoreError>;

    /// Groups of documents sharing a value of `field`, only groups of two or
    /// more. The first id of each group is the oldest document.
    fn duplicate_groups(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<Vec<DuplicateGroup<Self::Id>>, StoreError>;

    /// Delete documents by `_id`, returning how many were removed.
    fn delete_many(&mut self, collection: &str, ids: &[Self::Id]) -> Result<usize, StoreError>;

    /// All documents of a collection in insertion order.
    fn documents(&self, collection: &str) -> Result<Vec<Document>, StoreError>;
}

/// Non-durable backend. Collections spring into existence on first write.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: HashMap<String, Collection>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection_mut(&mut self, name: &str) -> &mut Collection {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Collection::new(name))
    }
}

impl Backend for MemoryBackend {
    type Id = DocId;

    fn create_unique_index(
        &mut self,
        collection: &str,
        field: &str,
    ) -> Result<IndexOutcome, StoreError> {
        self.collection_mut(collection).create_unique_index(field)
    }

    fn insert_one(&mut self, collection: &str, doc: Document) -> Result<DocId, StoreError> {
        self.collection_mut(collection).insert(doc)
    }

    fn duplicate_groups(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<Vec<DuplicateGroup>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.duplicate_groups(field))
            .unwrap_or_default())
    }

    fn delete_many(&mut self, collection: &str, ids: &[DocId]) -> Result<usize, StoreError> {
        Ok(self
            .collections
            .get_mut(collection)
            .map(|c| c.delete_many(ids))
            .unwrap_or(0))
    }

    fn documents(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.documents().cloned().collect())
            .unwrap_or_default())
    }
}

/// Outcome of [`EventStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert<I = DocId> {
    Created(I),
    /// A record with the same natural key is already stored.
    AlreadyPresent,
}

/// Insert-or-ignore persistence of [`Record`]s.
pub struct EventStore<B> {
    backend: B,
}

impl<B: Backend> EventStore<B> {
    pub fn new(backend: B) -> Self {
        EventStore { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_inner(self) -> B {
        self.backend
    }

    /// Make sure both collections carry a unique index on `height`.
    ///
    /// Must succeed before any ingestion starts: the index is what makes
    /// overlapping historical and live reads safe.
    pub fn ensure_indexes(&mut self) -> Result<(), StoreError> {
        info!("ensuring unique indexes");
        for collection in [COMMITTED_STATE, BLOCK_TIME_GAP] {
            self.ensure_unique_index(collection, HEIGHT_KEY)?;
        }
        info!("unique indexes ready");
        Ok(())
    }

    /// Create a unique index, repairing duplicates once if they block it.
    pub fn ensure_unique_index(
        &mut self,
        collection: &str,
        field: &str,
    ) -> Result<(), StoreError> {
        match self.backend.create_unique_index(collection, field) {
            Ok(IndexOutcome::Created) => {
                info!("created unique index on {collection}.{field}");
                Ok(())
            }
            Ok(IndexOutcome::AlreadyExists) => {
                info!("unique index on {collection}.{field} already exists");
                Ok(())
            }
            Err(e) if e.is_duplicate_key() => {
                warn!("{collection} holds duplicate {field} values, removing duplicates");
                let removed = self.remove_duplicates(collection, field)?;
                if removed > 0 {
                    info!("removed {removed} duplicate documents from {collection}");
                }
                self.backend.create_unique_index(collection, field)?;
                info!("created unique index on {collection}.{field}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Keep the first document of every duplicate group on `field` and delete
    /// the rest. Returns the number of deleted documents.
    pub fn remove_duplicates(
        &mut self,
        collection: &str,
        field: &str,
    ) -> Result<usize, StoreError> {
        let doomed: Vec<B::Id> = self
            .backend
            .duplicate_groups(collection, field)?
            .iter()
            .flat_map(|group| group.ids.iter().skip(1).cloned())
            .collect();
        self.backend.delete_many(collection, &doomed)
    }

    /// Store a record unless one with the same natural key exists.
    pub fn insert<R: Record>(&mut self, record: &R) -> Result<Insert<B::Id>, StoreError> {
        let doc = match serde_json::to_value(record)? {
            Value::Object(map) => map,
            _ => return Err(StoreError::NotAnObject),
        };
        match self.backend.insert_one(R::COLLECTION, doc) {
            Ok(id) => Ok(Insert::Created(id)),
            Err(e) if e.is_duplicate_key() => Ok(Insert::AlreadyPresent),
            Err(e) => Err(e),
        }
    }

    pub fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self.backend.documents(collection)?.len())
    }

    /// All records of type `R`, in insertion order.
    pub fn all<R: Record + DeserializeOwned>(&self) -> Result<Vec<R>, StoreError> {
        self.backend
            .documents(R::COLLECTION)?
            .into_iter()
            .map(|doc| serde_json::from_value(Value::Object(doc)).map_err(StoreError::from))
            .collect()
    }

    /// Records of type `R` whose natural key equals `key`.
    pub fn find<R: Record + DeserializeOwned>(&self, key: i64) -> Result<Vec<R>, StoreError> {
        let wanted = Value::from(key);
        self.backend
            .documents(R::COLLECTION)?
            .into_iter()
            .filter(|doc| doc.get(R::KEY) == Some(&wanted))
            .map(|doc| serde_json::from_value(Value::Object(doc)).map_err(StoreError::from))
            .collect()
    }
}
