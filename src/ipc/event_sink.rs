//! Single-writer stdout sink so transport lines never interleave.
//!
//! All outbound traffic funnels through [`send_message`], which locks
//! stdout per line. Diagnostic labels that are not part of the §6.1 prefix
//! set go to the log file instead, unless verbose mode or the label
//! whitelist says otherwise.

use std::env;
use std::io::{self, Write};
use std::sync::OnceLock;

#[cfg(any(test, feature = "mutants"))]
use std::collections::HashMap;
#[cfg(any(test, feature = "mutants"))]
use std::sync::Mutex;

use crate::log_debug;

use super::protocol::OutboundMessage;

/// Emit one protocol line on the transport.
pub fn send_message(message: &OutboundMessage) {
    let line = message.encode();
    #[cfg(any(test, feature = "mutants"))]
    if capture_test_line(&line) {
        return;
    }
    write_transport_line(&line);
}

/// Route a labelled diagnostic either to the transport (verbose or
/// whitelisted) or to the log file.
pub fn send_log_label(label: &str, text: &str) {
    if transport_allows_label(label) {
        let line = format!("{label}:{}", super::escape::escape_payload(text));
        #[cfg(any(test, feature = "mutants"))]
        if capture_test_line(&line) {
            return;
        }
        write_transport_line(&line);
    } else {
        log_debug(&format!("{label}: {text}"));
    }
}

fn write_transport_line(line: &str) {
    let mut stdout = io::stdout().lock();
    if let Err(err) = writeln!(stdout, "{line}") {
        log_debug(&format!("transport write failed: {err}"));
        return;
    }
    if let Err(err) = stdout.flush() {
        log_debug(&format!("transport flush failed: {err}"));
    }
}

struct LabelPolicy {
    verbose: bool,
    whitelist: Vec<String>,
}

fn label_policy() -> &'static LabelPolicy {
    static POLICY: OnceLock<LabelPolicy> = OnceLock::new();
    POLICY.get_or_init(|| LabelPolicy {
        verbose: env::var("CT_VERBOSE").map(|v| v == "1").unwrap_or(false),
        whitelist: env::var("CT_LOG_WHITELIST")
            .map(|raw| {
                raw.split(',')
                    .map(|label| label.trim().to_string())
                    .filter(|label| !label.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn transport_allows_label(label: &str) -> bool {
    let policy = label_policy();
    policy.verbose || policy.whitelist.iter().any(|allowed| allowed == label)
}

// ============================================================================
// Test capture sink: unit tests assert on emitted lines per thread instead
// of scraping stdout.
// ============================================================================

#[cfg(any(test, feature = "mutants"))]
#[derive(Default)]
struct LineSink {
    per_thread: HashMap<std::thread::ThreadId, Vec<String>>,
}

#[cfg(any(test, feature = "mutants"))]
static LINE_SINK: OnceLock<Mutex<LineSink>> = OnceLock::new();

#[cfg(any(test, feature = "mutants"))]
fn capture_test_line(line: &str) -> bool {
    if let Some(sink) = LINE_SINK.get() {
        if let Ok(mut lines) = sink.lock() {
            lines
                .per_thread
                .entry(std::thread::current().id())
                .or_default()
                .push(line.to_string());
            return true;
        }
    }
    false
}

#[cfg(any(test, feature = "mutants"))]
pub fn init_capture_sink() {
    let _ = LINE_SINK.get_or_init(|| Mutex::new(LineSink::default()));
}

#[cfg(any(test, feature = "mutants"))]
pub fn line_snapshot() -> usize {
    init_capture_sink();
    let current = std::thread::current().id();
    LINE_SINK
        .get()
        .and_then(|sink| {
            sink.lock()
                .ok()
                .and_then(|lines| lines.per_thread.get(&current).map(Vec::len))
        })
        .unwrap_or(0)
}

#[cfg(any(test, feature = "mutants"))]
pub fn lines_since(start: usize) -> Vec<String> {
    let current = std::thread::current().id();
    LINE_SINK
        .get()
        .and_then(|sink| {
            sink.lock().ok().and_then(|lines| {
                lines
                    .per_thread
                    .get(&current)
                    .map(|thread_lines| thread_lines.iter().skip(start).cloned().collect())
            })
        })
        .unwrap_or_default()
}
