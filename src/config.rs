use crate::checkpoint::CHECKPOINT_FILE;
use crate::gap::DEFAULT_GAP_THRESHOLD_SECS;
use crate::parser::FieldPolicy;
use clap::{ArgAction, Parser, ValueEnum};
use log::info;
use std::path::PathBuf;

/// Runtime configuration. Every flag can also be set through its environment
/// variable.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(
    name = "commit-ingest",
    version,
    about = "Tail a node log and store committed state records and block time gaps"
)]
pub struct Config {
    /// Directory holding the live log and its rotated segments
    #[arg(long, env = "LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    /// File name of the live log; rotated segments are `<name>.<N>`
    #[arg(long, env = "MAIN_LOG_NAME", default_value = "stdout-xx.txt")]
    pub main_log_name: String,

    /// Skip rotated segments and the existing live log, tail new lines only
    #[arg(
        long,
        env = "SKIP_HISTORICAL_LOGS",
        action = ArgAction::Set,
        value_parser = literal_true,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub skip_historical_logs: bool,

    /// Document store to write to
    #[arg(long, env = "STORE_BACKEND", value_enum, default_value_t = StoreKind::Mongo)]
    pub backend: StoreKind,

    /// MongoDB connection string
    #[arg(long, env = "MONGO_URI", default_value = "mongodb://localhost:27017")]
    pub mongo_uri: String,

    /// Database name; with the jsonl backend, a subdirectory of the store directory
    #[arg(long, env = "MONGO_DATABASE", default_value = "node_logs")]
    pub database: String,

    /// Root directory of the jsonl store and the tail cursor
    #[arg(long, env = "STORE_DIR", default_value = "./data")]
    pub store_dir: PathBuf,

    /// Minimum seconds between consecutive commits recorded as a gap
    #[arg(long, env = "GAP_THRESHOLD_SECS", default_value_t = DEFAULT_GAP_THRESHOLD_SECS)]
    pub gap_threshold_secs: f64,

    /// Store commits with unparsable fields as zero values instead of dropping them
    #[arg(
        long,
        env = "ZERO_FILL_MALFORMED",
        action = ArgAction::Set,
        value_parser = literal_true,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub zero_fill_malformed: bool,

    /// Persist the tail position so a restart with --skip-historical-logs resumes from it
    #[arg(
        long,
        env = "PERSIST_CURSOR",
        action = ArgAction::Set,
        value_parser = literal_true,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub persist_cursor: bool,

}

/// Where documents are stored.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// MongoDB server at `--mongo-uri`
    #[default]
    Mongo,
    /// JSON-lines files under `--store-dir`
    Jsonl,
    /// Memory only, nothing survives a restart (dry run)
    Memory,
}

/// Boolean switches are on only for the literal string `true`.
fn literal_true(value: &str) -> Result<bool, String> {
    Ok(value == "true")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_dir: PathBuf::from("./logs"),
            main_log_name: "stdout-xx.txt".to_string(),
            skip_historical_logs: false,
            backend: StoreKind::Mongo,
            mongo_uri: "mongodb://localhost:27017".to_string(),
            database: "node_logs".to_string(),
            store_dir: PathBuf::from("./data"),
            gap_threshold_secs: DEFAULT_GAP_THRESHOLD_SECS,
            zero_fill_malformed: false,
            persist_cursor: false,
        }
    }
}

impl Config {
    pub fn live_log_path(&self) -> PathBuf {
        self.log_dir.join(&self.main_log_name)
    }

    pub fn database_dir(&self) -> PathBuf {
        self.store_dir.join(&self.database)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.database_dir().join(CHECKPOINT_FILE)
    }

    pub fn field_policy(&self) -> FieldPolicy {
        if self.zero_fill_malformed {
            FieldPolicy::ZeroFill
        } else {
            FieldPolicy::Strict
        }
    }

    pub fn log_summary(&self) {
        match self.backend {
            StoreKind::Mongo => info!("store: mongodb, database {}", self.database),
            StoreKind::Jsonl => info!("store: {}", self.database_dir().display()),
            StoreKind::Memory => info!("store: memory only"),
        }
        info!("live log: {}", self.live_log_path().display());
        info!("skip historical logs: {}", self.skip_historical_logs);
        info!("gap threshold: {}s", self.gap_threshold_secs);
    }
}
