//! Session orchestration: the controller event loop and its plumbing.

mod controller;
pub mod jobs;
mod pipeline;
pub mod state;

pub use controller::Controller;
pub use pipeline::{AudioEvent, AudioPipeline};
pub use state::{transition_allowed, Phase};

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::protocol::InboundCommand;
use crate::log_debug;

const LOOP_WAIT_MS: u64 = 5;

/// Run the dictation core until `SHUTDOWN` or stdin EOF.
///
/// # Errors
///
/// Propagates fatal initialisation failures; runtime errors are handled
/// inside the loop and surfaced as status messages instead.
pub fn run_core(config: AppConfig) -> Result<()> {
    let mut controller = Controller::new(config);
    controller.startup();

    let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
    let _stdin_handle = crate::ipc::spawn_stdin_reader(cmd_tx);
    run_loop(&mut controller, &cmd_rx, None)
}

/// Controller loop shared by production and tests. `max_loops` bounds the
/// iteration count for deterministic test runs.
pub fn run_loop(
    controller: &mut Controller,
    cmd_rx: &Receiver<InboundCommand>,
    max_loops: Option<u64>,
) -> Result<()> {
    let mut loop_count: u64 = 0;
    loop {
        loop_count += 1;
        if let Some(limit) = max_loops {
            if loop_count >= limit {
                log_debug("controller loop reached test limit, exiting");
                break;
            }
        }

        // Wait briefly for commands so idle loops don't spin.
        match cmd_rx.recv_timeout(Duration::from_millis(LOOP_WAIT_MS)) {
            Ok(cmd) => controller.handle_command(cmd),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log_debug("command channel disconnected, exiting");
                break;
            }
        }

        controller.drain_audio();
        controller.drain_jobs();

        if controller.should_exit() {
            log_debug("graceful exit requested; shutting down");
            break;
        }
    }
    log_debug("controller loop exiting");
    Ok(())
}
