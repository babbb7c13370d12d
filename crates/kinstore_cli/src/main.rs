//! CLI smoke entry point.
//!
//! # Responsibility
//! - Open a store for the chosen backend and report its health.
//! - Keep output deterministic for quick local sanity checks.
//!
//! Usage: `kinstore_cli <document|relational> <database_path> [log_dir]`

use kinstore_core::{Backend, Context, Store, StoreConfig};
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("kinstore_core version={}", kinstore_core::core_version());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (backend, path) = match args.as_slice() {
        [backend, path, ..] => (backend, path),
        _ => {
            eprintln!("usage: kinstore_cli <document|relational> <database_path> [log_dir]");
            return ExitCode::from(2);
        }
    };

    if let Some(log_dir) = args.get(2) {
        if let Err(err) = kinstore_core::init_logging(kinstore_core::default_log_level(), log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    let backend: Backend = match backend.parse() {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    match run(StoreConfig::new(backend, path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            log::error!("event=cli_run module=cli status=error error={}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&config)?;
    store.ping(&Context::background())?;
    println!("backend={}", store.backend());
    println!("database_path={}", config.database_path.display());
    println!("connections_in_use={}", store.connections_in_use());
    println!("active_sessions={}", store.active_sessions());
    store.close()?;
    println!("status=ok");
    Ok(())
}
