//! scribecore entrypoint: parse flags, set up logging, run the session
//! controller until shutdown.
//!
//! The process exposes no interactive CLI; all runtime control flows over
//! the line-oriented stdin/stdout IPC. Exit code 0 on clean shutdown,
//! non-zero on fatal initialisation failure.

use anyhow::Result;
use clap::Parser;
use scribecore::config::AppConfig;
use scribecore::{init_logging, log_debug, log_file_path, session};

fn main() -> Result<()> {
    let config = AppConfig::parse();
    init_logging(&config);
    log_debug("=== scribecore starting ===");
    log_debug(&format!("log file: {:?}", log_file_path()));

    let result = session::run_core(config);
    match &result {
        Ok(()) => log_debug("=== scribecore exiting cleanly ==="),
        Err(err) => log_debug(&format!("=== scribecore fatal: {err:#} ===")),
    }
    result
}
