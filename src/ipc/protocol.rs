//! Typed IPC message contract so the core and the UI exchange stable lines.
//!
//! Outbound lines are `PREFIX:payload`; the full prefix set is closed and
//! every free-text payload is newline-escaped before it reaches the
//! transport. Inbound commands are plain lines, with `CONFIG:` and
//! `VOCABULARY_API:` carrying JSON payloads.

use serde::Serialize;
use serde_json::Value;

use crate::config::Mode;
use crate::CoreError;

use super::escape::escape_payload;

// ============================================================================
// Outbound (core → UI)
// ============================================================================

/// Status light colors understood by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColor {
    Grey,
    Blue,
    Green,
    Orange,
    Red,
    Yellow,
}

impl StatusColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusColor::Grey => "grey",
            StatusColor::Blue => "blue",
            StatusColor::Green => "green",
            StatusColor::Orange => "orange",
            StatusColor::Red => "red",
            StatusColor::Yellow => "yellow",
        }
    }
}

/// Sub-channel of the streaming LLM multiplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStreamKind {
    Thinking,
    Chunk,
    End,
}

impl ProofStreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofStreamKind::Thinking => "thinking",
            ProofStreamKind::Chunk => "chunk",
            ProofStreamKind::End => "end",
        }
    }
}

/// Final artifact tag for LLM-processed transcripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Proofed,
    Letter,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Proofed => "PROOFED",
            ArtifactKind::Letter => "LETTER",
        }
    }

    pub fn for_mode(mode: Mode) -> Option<Self> {
        match mode {
            Mode::Proofread => Some(ArtifactKind::Proofed),
            Mode::Letter => Some(ArtifactKind::Letter),
            Mode::Dictate => None,
        }
    }
}

/// UI-facing audio phase names, coarser than the internal phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioState {
    Activation,
    Dictation,
    Processing,
    Inactive,
}

/// Snapshot published on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub program_active: bool,
    pub audio_state: AudioState,
    pub is_dictating: bool,
    pub is_proofing_active: bool,
    pub can_dictate: bool,
    pub current_mode: Option<&'static str>,
}

/// Startup summary of the model identifiers this runtime can serve.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub asr: Vec<String>,
    pub llm: Vec<String>,
}

/// Every line the core may put on the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// One-shot readiness marker after initialisation. The prefix keeps the
    /// legacy spelling the UI already matches on.
    BackendReady,
    /// Ask the UI to push its persisted configuration.
    GetConfig,
    Models(String),
    ModelSelected {
        mode: Mode,
        model_id: String,
    },
    State(String),
    Status {
        color: StatusColor,
        text: String,
    },
    ProofStream {
        color: StatusColor,
        kind: ProofStreamKind,
        payload: String,
    },
    AudioAmp(u8),
    FinalTranscript(String),
    DictationPreview(String),
    Transcription {
        kind: ArtifactKind,
        text: String,
    },
    TranscriptionError(String),
    VocabResponse {
        id: String,
        payload: String,
    },
    Error(String),
}

impl OutboundMessage {
    pub fn state(snapshot: &StateSnapshot) -> Self {
        let json = serde_json::to_string(snapshot).unwrap_or_else(|_| "{}".to_string());
        OutboundMessage::State(json)
    }

    pub fn models(summary: &ModelSummary) -> Self {
        let json = serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string());
        OutboundMessage::Models(json)
    }

    /// Render the exact wire line. Always single-line.
    pub fn encode(&self) -> String {
        match self {
            OutboundMessage::BackendReady => "PYTHON_BACKEND_READY".to_string(),
            OutboundMessage::GetConfig => "GET_CONFIG".to_string(),
            OutboundMessage::Models(json) => format!("MODELS:{json}"),
            OutboundMessage::ModelSelected { mode, model_id } => {
                format!("MODEL_SELECTED:{}:{model_id}", mode.as_str())
            }
            OutboundMessage::State(json) => format!("STATE:{json}"),
            OutboundMessage::Status { color, text } => {
                format!("STATUS:{}:{}", color.as_str(), escape_payload(text))
            }
            OutboundMessage::ProofStream {
                color,
                kind,
                payload,
            } => format!(
                "STATUS:{}:PROOF_STREAM:{}:{}",
                color.as_str(),
                kind.as_str(),
                escape_payload(payload)
            ),
            OutboundMessage::AudioAmp(level) => format!("AUDIO_AMP:{}", (*level).min(100)),
            OutboundMessage::FinalTranscript(text) => {
                format!("FINAL_TRANSCRIPT:{}", escape_payload(text))
            }
            OutboundMessage::DictationPreview(text) => {
                format!("DICTATION_PREVIEW:{}", escape_payload(text))
            }
            OutboundMessage::Transcription { kind, text } => {
                format!("TRANSCRIPTION:{}:{}", kind.as_str(), escape_payload(text))
            }
            OutboundMessage::TranscriptionError(detail) => {
                format!("TRANSCRIPTION:error:{}", escape_payload(detail))
            }
            OutboundMessage::VocabResponse { id, payload } => {
                format!("VOCAB_RESPONSE:{id}:{payload}")
            }
            OutboundMessage::Error(detail) => format!("ERROR:{}", escape_payload(detail)),
        }
    }
}

// ============================================================================
// Inbound (UI → core)
// ============================================================================

/// Commands the UI may send, one per stdin line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    StartDictate,
    StartProofread,
    StartLetter,
    StopDictation,
    AbortDictation,
    ToggleActive,
    Restart,
    Shutdown,
    Config(Value),
    ModelsRequest,
    VocabularyApi { id: String, payload: Value },
}

impl InboundCommand {
    /// Parse one transport line. Malformed lines are protocol errors; the
    /// caller logs and drops them with a yellow status.
    pub fn parse(line: &str) -> Result<Self, CoreError> {
        let trimmed = line.trim();
        match trimmed {
            "start_dictate" => return Ok(InboundCommand::StartDictate),
            "start_proofread" => return Ok(InboundCommand::StartProofread),
            "start_letter" => return Ok(InboundCommand::StartLetter),
            "STOP_DICTATION" => return Ok(InboundCommand::StopDictation),
            "ABORT_DICTATION" => return Ok(InboundCommand::AbortDictation),
            "TOGGLE_ACTIVE" => return Ok(InboundCommand::ToggleActive),
            "RESTART" => return Ok(InboundCommand::Restart),
            "SHUTDOWN" => return Ok(InboundCommand::Shutdown),
            "MODELS_REQUEST" => return Ok(InboundCommand::ModelsRequest),
            _ => {}
        }

        if let Some(json) = trimmed.strip_prefix("CONFIG:") {
            let value: Value = serde_json::from_str(json)
                .map_err(|err| CoreError::Protocol(format!("bad CONFIG payload: {err}")))?;
            return Ok(InboundCommand::Config(value));
        }

        if let Some(rest) = trimmed.strip_prefix("VOCABULARY_API:") {
            let (id, json) = rest
                .split_once(':')
                .ok_or_else(|| CoreError::Protocol("VOCABULARY_API missing id".to_string()))?;
            if id.is_empty() {
                return Err(CoreError::Protocol("VOCABULARY_API empty id".to_string()));
            }
            let value: Value = serde_json::from_str(json).map_err(|err| {
                CoreError::Protocol(format!("bad VOCABULARY_API payload: {err}"))
            })?;
            return Ok(InboundCommand::VocabularyApi {
                id: id.to_string(),
                payload: value,
            });
        }

        Err(CoreError::Protocol(format!(
            "unknown command '{}'",
            truncate_for_log(trimmed)
        )))
    }
}

fn truncate_for_log(line: &str) -> &str {
    let cut = line
        .char_indices()
        .nth(48)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len());
    &line[..cut]
}
