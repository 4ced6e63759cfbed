pub mod app;
mod atomic;
pub mod checkpoint;
pub mod config;
mod event;
mod gap;
pub mod history;
mod lines;
mod parser;
mod pipeline;
pub mod store;
pub mod tail;

pub use app::IngestError;
pub use checkpoint::TailCheckpoint;
pub use config::{Config, StoreKind};
pub use event::{BLOCK_TIME_GAP, COMMITTED_STATE, CommittedEvent, GapEvent, HEIGHT_KEY, Record};
pub use gap::{DEFAULT_GAP_THRESHOLD_SECS, GapDetector, LastCommit};
pub use lines::LineReader;
pub use parser::{FieldPolicy, ParseError, parse_line, parse_line_with};
pub use pipeline::{IngestStats, LineSink, Pipeline, ingest_file};
pub use store::{EventStore, Insert, JsonlBackend, MemoryBackend, MongoBackend, StoreError};
pub use tail::{Change, TailError, Tailer};
