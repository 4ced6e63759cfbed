//! Startup sequencing: indexes, historical replay, live file, then tailing.

use crate::checkpoint::{self, Validity};
use crate::config::{Config, StoreKind};
use crate::gap::GapDetector;
use crate::history::replay_history;
use crate::pipeline::{Pipeline, ingest_file};
use crate::store::{Backend, EventStore, JsonlBackend, MemoryBackend, MongoBackend, StoreError};
use crate::tail::{TailError, Tailer};
use log::{info, warn};
use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("tail: {0}")]
    Tail(#[from] TailError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Open the configured store and ingest until something fatal happens.
///
/// An unreachable MongoDB server is fatal: nothing is read before the store
/// answers a ping.
pub fn run(config: &Config) -> Result<Infallible, IngestError> {
    config.log_summary();
    match config.backend {
        StoreKind::Mongo => {
            let backend = MongoBackend::connect(&config.mongo_uri, &config.database)?;
            run_with_backend(config, backend)
        }
        StoreKind::Jsonl => {
            let backend = JsonlBackend::open(config.database_dir())?;
            info!("opened store {}", backend.dir().display());
            run_with_backend(config, backend)
        }
        StoreKind::Memory => {
            warn!("using the in-memory store, nothing will be persisted");
            run_with_backend(config, MemoryBackend::new())
        }
    }
}

pub fn run_with_backend<B: Backend>(
    config: &Config,
    backend: B,
) -> Result<Infallible, IngestError> {
    let (mut pipeline, tailer) = start(config, backend)?;
    Ok(tailer.run(&mut pipeline)?)
}

/// Everything before steady-state tailing.
///
/// Ensures the unique indexes, replays rotated segments and the current live
/// file through one pipeline (unless historical logs are skipped), and returns
/// that pipeline with a tailer positioned where ingestion stopped.
pub fn start<B: Backend>(
    config: &Config,
    backend: B,
) -> Result<(Pipeline<B>, Tailer), IngestError> {
    let mut store = EventStore::new(backend);
    store.ensure_indexes()?;

    let mut pipeline = Pipeline::new(store, GapDetector::new(config.gap_threshold_secs))
        .with_policy(config.field_policy());
    let live = config.live_log_path();

    let tailer = if config.skip_historical_logs {
        info!("skipping historical logs, tailing new lines only");
        resume_position(config, &live, &mut pipeline)
    } else {
        replay_history(&config.log_dir, &config.main_log_name, &mut pipeline);
        let offset = match ingest_file(&live, &mut pipeline, false) {
            Ok(offset) => offset,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!("cannot read {}: {e}", live.display());
                fs::metadata(&live).map(|m| m.len()).unwrap_or(0)
            }
        };
        info!("startup ingestion done: {}", pipeline.stats());
        Tailer::at_offset(&live, offset)
    };

    let tailer = if config.persist_cursor {
        let path = config.checkpoint_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tailer.with_checkpoint(path)
    } else {
        tailer
    };

    Ok((pipeline, tailer))
}

/// Where to start tailing when historical replay is skipped: a verified
/// checkpoint if cursor persistence is on, otherwise the end of the file.
fn resume_position<B: Backend>(
    config: &Config,
    live: &Path,
    pipeline: &mut Pipeline<B>,
) -> Tailer {
    if !config.persist_cursor {
        return Tailer::at_end(live);
    }

    let path = config.checkpoint_path();
    let cp = match checkpoint::load(&path) {
        Ok(Some(cp)) => cp,
        Ok(None) => return Tailer::at_end(live),
        Err(e) => {
            warn!("cannot read tail checkpoint {}: {e}", path.display());
            return Tailer::at_end(live);
        }
    };

    match cp.verify(live) {
        Ok(Validity::Valid) => {
            info!("resuming {} from checkpoint offset {}", live.display(), cp.offset);
            pipeline.detector_mut().restore(cp.last);
            Tailer::at_offset(live, cp.offset)
        }
        Ok(validity) => {
            info!("discarding tail checkpoint ({validity:?}), starting at end of file");
            if let Err(e) = checkpoint::delete(&path) {
                warn!("cannot remove tail checkpoint {}: {e}", path.display());
            }
            Tailer::at_end(live)
        }
        Err(e) => {
            warn!("cannot verify tail checkpoint: {e}");
            Tailer::at_end(live)
        }
    }
}
