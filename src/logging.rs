//! File-backed logging so diagnostics never leak onto the IPC transport.
//!
//! The stdout stream is reserved for the line-oriented status protocol, so
//! all diagnostics go to a size-rotated log file under the user data dir.
//! `CT_VERBOSE=1` additionally mirrors log lines to stderr for development.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::AppConfig;

const LOG_MAX_BYTES: u64 = 4 * 1024 * 1024;

/// Resolve the active log-file location.
pub fn log_file_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("scribecore")
        .join("scribecore.log")
}

/// Append-only writer that rotates the file once it passes the size cap.
///
/// Rotation keeps exactly one predecessor (`scribecore.log.1`); older
/// generations are overwritten.
struct RotatingLogWriter {
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl RotatingLogWriter {
    fn open(path: PathBuf) -> Self {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).ok();
        let written = file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            path,
            file,
            written,
        }
    }

    fn rotate_if_needed(&mut self) {
        if self.written < LOG_MAX_BYTES {
            return;
        }
        self.file = None;
        let rotated = self.path.with_extension("log.1");
        let _ = fs::rename(&self.path, rotated);
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .ok();
        self.written = 0;
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rotate_if_needed();
        match self.file.as_mut() {
            Some(file) => {
                let n = file.write(buf)?;
                self.written = self.written.saturating_add(n as u64);
                Ok(n)
            }
            // Logging must never take down the pipeline.
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedLogWriter(Arc<Mutex<RotatingLogWriter>>);

impl Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut writer) => writer.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut writer) => writer.flush(),
            Err(_) => Ok(()),
        }
    }
}

static LOGGING_READY: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber. Safe to call more than once.
pub fn init_logging(config: &AppConfig) {
    let verbose = config.verbose;
    LOGGING_READY.get_or_init(|| {
        let writer = SharedLogWriter(Arc::new(Mutex::new(RotatingLogWriter::open(
            log_file_path(),
        ))));
        let max_level = if verbose {
            tracing::Level::TRACE
        } else {
            tracing::Level::DEBUG
        };
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(max_level)
            .with_ansi(false)
            .with_target(false)
            .with_writer(move || writer.clone())
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Debug log helper kept for parity across modules that predate `tracing`.
pub fn log_debug(message: &str) {
    tracing::debug!("{message}");
}
