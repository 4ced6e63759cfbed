use super::{Backend, Document, DuplicateGroup, ID_FIELD, IndexOutcome, StoreError};
use chrono::{DateTime, SecondsFormat};
use log::{debug, info, warn};
use mongodb::IndexModel;
use mongodb::bson::{self, Bson, Document as BsonDocument, doc};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::sync::{Client, Collection, Database};
use serde_json::Value;

/// Server error code for a unique index violation.
const DUPLICATE_KEY: i32 = 11000;
/// The collection does not exist yet.
const NAMESPACE_NOT_FOUND: i32 = 26;
/// An index with the same name but other options exists.
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;

/// Field stored as a BSON date instead of the RFC 3339 string serde produces.
const TIMESTAMP_FIELD: &str = "timestamp";

/// Backend talking to a MongoDB server through the synchronous driver.
///
/// Documents keep their server-assigned `ObjectId`s; the oldest document of a
/// duplicate group is the one with the smallest `_id`.
#[derive(Debug, Clone)]
pub struct MongoBackend {
    db: Database,
}

impl MongoBackend {
    /// Connect to `uri` and ping the server.
    ///
    /// The driver connects lazily, so the ping is what surfaces an unreachable
    /// server or bad credentials.
    pub fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)?;
        let db = client.database(database);
        db.run_command(doc! { "ping": 1 }).run()?;
        info!("connected to MongoDB, database {database}");
        Ok(MongoBackend { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.db.collection(name)
    }
}

impl Backend for MongoBackend {
    type Id = Bson;

    fn create_unique_index(
        &mut self,
        collection: &str,
        field: &str,
    ) -> Result<IndexOutcome, StoreError> {
        let coll = self.collection(collection);
        let name = format!("{field}_1");
        let existing = match coll.list_index_names().run() {
            Ok(names) => names,
            Err(e) if error_code(&e) == Some(NAMESPACE_NOT_FOUND) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if existing.contains(&name) {
            return Ok(IndexOutcome::AlreadyExists);
        }

        let model = IndexModel::builder()
            .keys(doc! { field: 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        match coll.create_index(model).run() {
            Ok(_) => Ok(IndexOutcome::Created),
            Err(e) => match error_code(&e) {
                Some(DUPLICATE_KEY) => Err(duplicate_key(collection, field, &e)),
                Some(INDEX_OPTIONS_CONFLICT | INDEX_KEY_SPECS_CONFLICT) => {
                    warn!("{collection}.{field} is indexed with other options: {e}");
                    Ok(IndexOutcome::AlreadyExists)
                }
                _ => Err(e.into()),
            },
        }
    }

    fn insert_one(&mut self, collection: &str, doc: Document) -> Result<Bson, StoreError> {
        let doc = to_bson_document(&doc)?;
        match self.collection(collection).insert_one(doc).run() {
            Ok(result) => Ok(result.inserted_id),
            Err(e) if error_code(&e) == Some(DUPLICATE_KEY) => {
                Err(duplicate_key(collection, "unique index", &e))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn duplicate_groups(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<Vec<DuplicateGroup<Bson>>, StoreError> {
        let pipeline = [
            doc! { "$sort": { ID_FIELD: 1 } },
            doc! {
                "$group": {
                    ID_FIELD: format!("${field}"),
                    "ids": { "$push": format!("${ID_FIELD}") },
                    "count": { "$sum": 1 },
                }
            },
            doc! { "$match": { "count": { "$gt": 1 } } },
            doc! { "$sort": { ID_FIELD: 1 } },
        ];

        let mut groups = Vec::new();
        for result in self.collection(collection).aggregate(pipeline).run()? {
            let group = result?;
            let Ok(ids) = group.get_array("ids") else {
                warn!("{collection}: skipping malformed duplicate group {group}");
                continue;
            };
            let key = group.get(ID_FIELD).cloned().unwrap_or(Bson::Null);
            groups.push(DuplicateGroup {
                key: key.into_relaxed_extjson(),
                ids: ids.clone(),
            });
        }
        debug!("{collection}: {} duplicate groups on {field}", groups.len());
        Ok(groups)
    }

    fn delete_many(&mut self, collection: &str, ids: &[Bson]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let filter = doc! { ID_FIELD: { "$in": ids.to_vec() } };
        let result = self.collection(collection).delete_many(filter).run()?;
        Ok(result.deleted_count as usize)
    }

    fn documents(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let cursor = self
            .collection(collection)
            .find(doc! {})
            .sort(doc! { ID_FIELD: 1 })
            .run()?;
        cursor
            .map(|result| result.map(from_bson_document).map_err(StoreError::from))
            .collect()
    }
}

fn error_code(e: &MongoError) -> Option<i32> {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.code),
        ErrorKind::Command(c) => Some(c.code),
        _ => None,
    }
}

fn duplicate_key(collection: &str, field: &str, e: &MongoError) -> StoreError {
    StoreError::DuplicateKey {
        collection: collection.to_string(),
        field: field.to_string(),
        key: e.to_string(),
    }
}

/// Convert a JSON document, storing an RFC 3339 `timestamp` as a BSON date.
fn to_bson_document(doc: &Document) -> Result<BsonDocument, StoreError> {
    let mut out = bson::to_document(doc)?;
    let date = match out.get(TIMESTAMP_FIELD) {
        Some(Bson::String(s)) => DateTime::parse_from_rfc3339(s).ok(),
        _ => None,
    };
    if let Some(ts) = date {
        out.insert(TIMESTAMP_FIELD, bson::DateTime::from_millis(ts.timestamp_millis()));
    }
    Ok(out)
}

/// Convert a stored document back to JSON, the reverse of
/// [`to_bson_document`]. Other BSON types use relaxed extended JSON.
fn from_bson_document(mut doc: BsonDocument) -> Document {
    let text = match doc.get(TIMESTAMP_FIELD) {
        Some(Bson::DateTime(date)) => DateTime::from_timestamp_millis(date.timestamp_millis())
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        _ => None,
    };
    if let Some(text) = text {
        doc.insert(TIMESTAMP_FIELD, text);
    }
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
