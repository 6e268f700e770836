//! Engine configuration so CLI flags, env toggles, and UI-pushed settings resolve consistently.
//!
//! Two layers: [`AppConfig`] is parsed once at startup from flags and env;
//! [`EngineSettings`] is the mutable slice the UI can replace at runtime via
//! `CONFIG:<json>` without a restart.

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::vocab::VocabularyEntry;

pub const DEFAULT_AUTO_STOP_SILENCE_SECS: f32 = 1.5;
pub const MIN_AUTO_STOP_SILENCE_SECS: f32 = 1.0;
pub const MAX_AUTO_STOP_SILENCE_SECS: f32 = 3.0;

pub const DEFAULT_VAD_AGGRESSIVENESS: u8 = 2;
pub const MAX_VAD_AGGRESSIVENESS: u8 = 3;

/// Upper bound on buffered utterance frames before FIFO dropping starts.
pub const DEFAULT_MAX_UTTERANCE_FRAMES: usize = 600;

/// Capture longer than this gets its oldest frames trimmed eagerly.
pub const PROGRESSIVE_CLEANUP_MS: u64 = 60_000;

/// Capture longer than this is force-stopped with a warning.
pub const HARD_CAP_MS: u64 = 150_000;

/// Dictation mode selected by a wake word or an explicit UI command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Dictate,
    Proofread,
    Letter,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Dictate => "dictate",
            Mode::Proofread => "proofread",
            Mode::Letter => "letter",
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "dictate" => Some(Mode::Dictate),
            "proofread" => Some(Mode::Proofread),
            "letter" => Some(Mode::Letter),
            _ => None,
        }
    }

    /// Tie-break rank when several wake phrases match one window.
    /// Higher wins: proofread over letter over dictate.
    pub fn precedence(&self) -> u8 {
        match self {
            Mode::Proofread => 2,
            Mode::Letter => 1,
            Mode::Dictate => 0,
        }
    }

    /// Modes that route the transcript through the LLM.
    pub fn uses_llm(&self) -> bool {
        !matches!(self, Mode::Dictate)
    }

    pub const ALL: [Mode; 3] = [Mode::Dictate, Mode::Proofread, Mode::Letter];
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup configuration from CLI flags and `CT_*` env toggles.
#[derive(Debug, Parser, Clone)]
#[command(about = "scribecore dictation engine", author, version)]
pub struct AppConfig {
    /// Input device name substring (default: system default input)
    #[arg(long = "input-device")]
    pub input_device: Option<String>,

    /// Path to the Whisper GGML model file
    #[arg(long = "asr-model", env = "CT_ASR_MODEL")]
    pub asr_model_path: Option<String>,

    /// Base URL of the local LLM runtime (Ollama-compatible NDJSON streaming)
    #[arg(
        long = "llm-endpoint",
        env = "CT_LLM_ENDPOINT",
        default_value = "http://127.0.0.1:11434"
    )]
    pub llm_endpoint: String,

    /// Transcription language ("auto" enables detection)
    #[arg(long = "lang", default_value = "en")]
    pub lang: String,

    /// Whisper beam size (1 = greedy)
    #[arg(long = "asr-beam-size", default_value_t = 1)]
    pub asr_beam_size: usize,

    /// Whisper sampling temperature
    #[arg(long = "asr-temperature", default_value_t = 0.0)]
    pub asr_temperature: f32,

    /// VAD aggressiveness 0 (permissive) to 3 (strict)
    #[arg(long = "vad-aggressiveness", default_value_t = DEFAULT_VAD_AGGRESSIVENESS, value_parser = parse_vad_aggressiveness)]
    pub vad_aggressiveness: u8,

    /// Sustained trailing silence that auto-stops a capture, in seconds
    #[arg(long = "auto-stop-silence-secs", default_value_t = DEFAULT_AUTO_STOP_SILENCE_SECS, value_parser = parse_auto_stop_silence)]
    pub auto_stop_silence_secs: f32,

    /// Utterance buffer cap in frames before FIFO dropping
    #[arg(long = "max-utterance-frames", default_value_t = DEFAULT_MAX_UTTERANCE_FRAMES)]
    pub max_utterance_frames: usize,

    /// Skip LLM warm-up at startup; load lazily on first proof/letter session
    #[arg(long = "light-mode", env = "CT_LIGHT_MODE", default_value_t = false)]
    pub light_mode: bool,

    /// Mirror all log labels to the transport instead of the log file
    #[arg(long = "verbose", env = "CT_VERBOSE", default_value_t = false)]
    pub verbose: bool,
}

fn parse_vad_aggressiveness(raw: &str) -> Result<u8, String> {
    let value: u8 = raw
        .parse()
        .map_err(|_| format!("invalid VAD aggressiveness '{raw}'"))?;
    if value > MAX_VAD_AGGRESSIVENESS {
        return Err(format!(
            "VAD aggressiveness must be 0..={MAX_VAD_AGGRESSIVENESS}, got {value}"
        ));
    }
    Ok(value)
}

fn parse_auto_stop_silence(raw: &str) -> Result<f32, String> {
    let value: f32 = raw
        .parse()
        .map_err(|_| format!("invalid silence threshold '{raw}'"))?;
    if !(MIN_AUTO_STOP_SILENCE_SECS..=MAX_AUTO_STOP_SILENCE_SECS).contains(&value) {
        return Err(format!(
            "silence threshold must be {MIN_AUTO_STOP_SILENCE_SECS}..={MAX_AUTO_STOP_SILENCE_SECS} seconds, got {value}"
        ));
    }
    Ok(value)
}

impl AppConfig {
    pub fn auto_stop_silence_ms(&self) -> u64 {
        (self.auto_stop_silence_secs * 1000.0) as u64
    }
}

/// Per-mode behavior: wake phrases, the LLM prompt, and cleanup rules.
///
/// `prompt_template` and `model_id` stay `None` for dictate, which delivers
/// the raw transcript without an LLM pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeConfig {
    pub wake_phrases: Vec<String>,
    pub prompt_template: Option<String>,
    pub model_id: Option<String>,
    #[serde(default)]
    pub filler_words: Vec<String>,
}

/// The three mode configurations plus lookup helpers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeTable {
    pub dictate: ModeConfig,
    pub proofread: ModeConfig,
    pub letter: ModeConfig,
}

const DEFAULT_FILLERS: &[&str] = &["um", "uh", "erm", "you know"];

const DEFAULT_PROOFREAD_PROMPT: &str = "Correct grammar, spelling, and punctuation in the dictated text below. Preserve the meaning and clinical terminology. Return only the corrected text.\n\n{text}";

const DEFAULT_LETTER_PROMPT: &str = "Format the dictated text below as a professional letter with a greeting, body paragraphs, and a closing. Correct grammar as you go. Return only the letter.\n\n{text}";

impl Default for ModeTable {
    fn default() -> Self {
        let fillers: Vec<String> = DEFAULT_FILLERS.iter().map(|s| s.to_string()).collect();
        Self {
            dictate: ModeConfig {
                wake_phrases: vec!["note".to_string(), "start dictation".to_string()],
                prompt_template: None,
                model_id: None,
                filler_words: fillers.clone(),
            },
            proofread: ModeConfig {
                wake_phrases: vec!["proofread".to_string()],
                prompt_template: Some(DEFAULT_PROOFREAD_PROMPT.to_string()),
                model_id: Some("qwen3:4b".to_string()),
                filler_words: fillers.clone(),
            },
            letter: ModeConfig {
                wake_phrases: vec!["letter".to_string()],
                prompt_template: Some(DEFAULT_LETTER_PROMPT.to_string()),
                model_id: Some("qwen3:4b".to_string()),
                filler_words: fillers,
            },
        }
    }
}

impl ModeTable {
    pub fn get(&self, mode: Mode) -> &ModeConfig {
        match mode {
            Mode::Dictate => &self.dictate,
            Mode::Proofread => &self.proofread,
            Mode::Letter => &self.letter,
        }
    }
}

/// Runtime settings the UI pushes via `CONFIG:<json>`.
///
/// All fields are optional so a partial payload only overrides what it
/// names; everything else keeps its current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub modes: Option<ModeTable>,
    pub asr_model: Option<String>,
    pub auto_stop_silence_secs: Option<f32>,
    pub vad_aggressiveness: Option<u8>,
    pub vocabulary: Option<Vec<VocabularyEntry>>,
}

/// Effective runtime settings after CLI defaults and any UI patches.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub modes: ModeTable,
    pub asr_model: Option<String>,
    pub auto_stop_silence_ms: u64,
    pub vad_aggressiveness: u8,
}

impl EngineSettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            modes: ModeTable::default(),
            asr_model: config.asr_model_path.clone(),
            auto_stop_silence_ms: config.auto_stop_silence_ms(),
            vad_aggressiveness: config.vad_aggressiveness,
        }
    }

    /// Apply a UI patch. Returns the modes whose model id changed so the
    /// controller can emit `MODEL_SELECTED` lines.
    pub fn apply_patch(&mut self, patch: SettingsPatch) -> Vec<(Mode, String)> {
        let mut model_changes = Vec::new();
        if let Some(modes) = patch.modes {
            for mode in Mode::ALL {
                let new_model = modes.get(mode).model_id.clone();
                if new_model != self.modes.get(mode).model_id {
                    if let Some(id) = new_model {
                        model_changes.push((mode, id));
                    }
                }
            }
            self.modes = modes;
        }
        if let Some(model) = patch.asr_model {
            self.asr_model = Some(model);
        }
        if let Some(secs) = patch.auto_stop_silence_secs {
            let clamped = secs.clamp(MIN_AUTO_STOP_SILENCE_SECS, MAX_AUTO_STOP_SILENCE_SECS);
            self.auto_stop_silence_ms = (clamped * 1000.0) as u64;
        }
        if let Some(level) = patch.vad_aggressiveness {
            self.vad_aggressiveness = level.min(MAX_VAD_AGGRESSIVENESS);
        }
        model_changes
    }
}
