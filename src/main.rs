use clap::Parser;
use commit_ingest::{Config, app};
use log::error;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    match app::run(&config) {
        Ok(never) => match never {},
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
