//! Error kinds the core distinguishes when deciding the next session state.
//!
//! Every long-running operation reports failures through one of these
//! variants so the controller can map them to a status color and a
//! recovery path without inspecting error strings.

use thiserror::Error;

/// Failure classification shared by audio, transcription, and LLM tasks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Microphone could not be opened or read; another app may hold it.
    #[error("audio device unavailable: {0}")]
    AudioUnavailable(String),

    /// ASR or LLM model failed to initialise.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Inference failed mid-session.
    #[error("model runtime error: {0}")]
    ModelRuntime(String),

    /// Utterance hard cap, transcription deadline, or token-idle deadline hit.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed inbound IPC line.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// User-requested abort. Never surfaced to the UI as an error.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Compact label used in logs and status text.
    pub fn label(&self) -> &'static str {
        match self {
            CoreError::AudioUnavailable(_) => "audio_unavailable",
            CoreError::ModelLoad(_) => "model_load",
            CoreError::ModelRuntime(_) => "model_runtime",
            CoreError::Timeout(_) => "timeout",
            CoreError::Protocol(_) => "protocol",
            CoreError::Cancelled => "cancelled",
        }
    }
}
