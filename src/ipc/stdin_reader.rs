//! Stdin command reader thread.

use std::io::{self, BufRead};
use std::sync::mpsc::Sender;
use std::thread;

use crate::log_debug;

use super::protocol::{InboundCommand, OutboundMessage, StatusColor};
use super::send_message;

/// Read newline-delimited commands from stdin until EOF or the controller
/// side hangs up. Malformed lines are dropped with a warning status.
pub fn spawn_stdin_reader(tx: Sender<InboundCommand>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        let stdin_lock = stdin.lock();

        for line in stdin_lock.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };

            if line.trim().is_empty() {
                continue;
            }

            match InboundCommand::parse(&line) {
                Ok(cmd) => {
                    if tx.send(cmd).is_err() {
                        break; // Controller has exited
                    }
                }
                Err(err) => {
                    log_debug(&format!("dropped malformed command: {err}"));
                    send_message(&OutboundMessage::Status {
                        color: StatusColor::Yellow,
                        text: format!("Ignored malformed command ({err})"),
                    });
                }
            }
        }

        log_debug("Stdin reader thread exiting");
    })
}
