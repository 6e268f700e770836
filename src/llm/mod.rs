//! LLM streaming engine: channel demultiplexing, display assembly,
//! repetition cutoff, and final-artifact cleanup.

pub mod assemble;
pub mod markers;
pub mod parser;
pub mod repetition;
pub mod runtime;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::CoreError;

pub use parser::{Section, StreamEvent, StreamParser};
pub use repetition::RepetitionGuard;
pub use runtime::{
    apply_model_overrides, is_gpt_oss, seeds_for_model, GenerationParams, LlmClient, LlmRequest,
    TokenSource,
};

/// Result of a completed (or early-terminated) stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Concatenated thinking-channel text, markers removed.
    pub thinking: String,
    /// Cleaned response artifact.
    pub response: String,
    /// True when the repetition guard ended the stream early.
    pub stopped_by_repetition: bool,
}

/// Drive a token source to completion.
///
/// `on_event` receives every channel-routed slice as it becomes available,
/// in stream order: all thinking slices precede the first response slice.
/// Cancellation is checked at every token boundary.
///
/// # Errors
///
/// [`CoreError::Cancelled`] when the cancel flag is raised; source errors
/// propagate as-is.
pub fn run_stream(
    source: &mut dyn TokenSource,
    guard: &mut RepetitionGuard,
    cancel: &AtomicBool,
    mut on_event: impl FnMut(&StreamEvent),
) -> Result<StreamOutcome, CoreError> {
    let mut stream_parser = StreamParser::new();
    let mut thinking = String::new();
    let mut response = String::new();
    let mut stopped_by_repetition = false;

    'stream: loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(CoreError::Cancelled);
        }
        let Some(token) = source.next_token()? else {
            break;
        };
        for event in stream_parser.feed(&token) {
            let tripped = absorb_event(&event, &mut thinking, &mut response, guard);
            on_event(&event);
            if tripped {
                stopped_by_repetition = true;
                break 'stream;
            }
        }
    }

    if !stopped_by_repetition {
        for event in stream_parser.finish() {
            let tripped = absorb_event(&event, &mut thinking, &mut response, guard);
            on_event(&event);
            if tripped {
                stopped_by_repetition = true;
                break;
            }
        }
    }

    Ok(StreamOutcome {
        thinking,
        response: assemble::clean_artifact(&response),
        stopped_by_repetition,
    })
}

fn absorb_event(
    event: &StreamEvent,
    thinking: &mut String,
    response: &mut String,
    guard: &mut RepetitionGuard,
) -> bool {
    match event {
        StreamEvent::Thinking(text) => {
            thinking.push_str(text);
            false
        }
        StreamEvent::Response(text) => {
            assemble::append_chunk(response, text);
            guard.push_text(text)
        }
    }
}
