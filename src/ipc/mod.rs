//! Line-oriented IPC between the core and the detached UI process.
//!
//! Outbound messages are prefix-tagged single lines on stdout; inbound
//! commands arrive one per line on stdin. The transport strips embedded
//! newlines, so free-text payloads are escaped at this boundary and
//! unescaped by the receiver.

pub mod escape;
mod event_sink;
pub mod protocol;
mod stdin_reader;

pub use event_sink::{send_log_label, send_message};
pub use stdin_reader::spawn_stdin_reader;

#[cfg(any(test, feature = "mutants"))]
pub use event_sink::{init_capture_sink, lines_since, line_snapshot};
