//! Wake-word recognition over short transcribed audio windows.
//!
//! While the session is listening, recent voiced frames accumulate in a
//! bounded rolling window. Once a speech burst settles, the window is
//! transcribed and the text is matched against the per-mode phrase sets.
//! Matching is whole-word: multi-word phrases must appear contiguously,
//! and a phrase buried inside longer conversation is not actionable.

use crate::audio::{AudioFrame, FRAME_MS};
use crate::config::{Mode, ModeTable};

/// Longest audio window considered for one wake decision.
pub const WAKE_WINDOW_MS: u64 = 1500;

/// Speech required before a window is worth transcribing.
const WAKE_MIN_SPEECH_MS: u64 = 160;

/// Pause that marks the end of a candidate wake utterance.
const WAKE_SETTLE_SILENCE_MS: u64 = 240;

// Keep detections short and command-like to reduce false positives from
// background conversation that merely mentions a wake phrase.
const WAKE_MAX_TRANSCRIPT_TOKENS: usize = 7;
const WAKE_MAX_PREFIX_TOKENS: usize = 1;
const WAKE_MAX_SUFFIX_TOKENS: usize = 3;
const WAKE_SINGLE_WORD_MAX_SUFFIX_TOKENS: usize = 2;

/// A recognized wake phrase and the mode it selects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeMatch {
    pub mode: Mode,
    pub confidence: f32,
}

/// Normalized per-mode phrase sets built from the mode table.
#[derive(Debug, Clone)]
pub struct WakePhraseSets {
    phrases: Vec<(Mode, String)>,
}

impl WakePhraseSets {
    pub fn from_modes(modes: &ModeTable) -> Self {
        let mut phrases = Vec::new();
        for mode in Mode::ALL {
            for phrase in &modes.get(mode).wake_phrases {
                let normalized = normalize_for_match(phrase);
                if !normalized.is_empty() {
                    phrases.push((mode, normalized));
                }
            }
        }
        Self { phrases }
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

/// Match a transcript hypothesis against all configured phrase sets.
///
/// When phrases for several modes match the same window, the tie-break is
/// mode precedence: proofread over letter over dictate.
pub fn match_wake(transcript: &str, sets: &WakePhraseSets) -> Option<WakeMatch> {
    let normalized = normalize_for_match(transcript);
    if normalized.is_empty() {
        return None;
    }
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    if tokens.is_empty() || tokens.len() > WAKE_MAX_TRANSCRIPT_TOKENS {
        return None;
    }

    let mut best: Option<WakeMatch> = None;
    for (mode, phrase) in &sets.phrases {
        let Some(confidence) = phrase_confidence(&tokens, phrase) else {
            continue;
        };
        let candidate = WakeMatch {
            mode: *mode,
            confidence,
        };
        best = Some(match best {
            None => candidate,
            Some(current) => pick_match(current, candidate),
        });
    }
    best
}

fn pick_match(current: WakeMatch, candidate: WakeMatch) -> WakeMatch {
    if candidate.mode.precedence() > current.mode.precedence() {
        candidate
    } else if candidate.mode.precedence() == current.mode.precedence()
        && candidate.confidence > current.confidence
    {
        candidate
    } else {
        current
    }
}

/// Lowercase, strip punctuation, collapse separators to single spaces.
fn normalize_for_match(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    let mut previous_was_space = true;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                normalized.push(lower);
            }
            previous_was_space = false;
            continue;
        }
        if previous_was_space {
            continue;
        }
        if ch.is_whitespace() || matches!(ch, '-' | '_' | '\'') {
            normalized.push(' ');
            previous_was_space = true;
        }
    }
    normalized.trim().to_string()
}

/// Confidence for a contiguous whole-word match, or `None` when the phrase
/// is absent or not actionable at its position.
fn phrase_confidence(haystack_tokens: &[&str], phrase: &str) -> Option<f32> {
    let phrase_tokens: Vec<&str> = phrase.split_whitespace().collect();
    if phrase_tokens.is_empty() || haystack_tokens.len() < phrase_tokens.len() {
        return None;
    }
    haystack_tokens
        .windows(phrase_tokens.len())
        .enumerate()
        .filter(|(start_idx, window)| {
            *window == phrase_tokens.as_slice()
                && window_is_actionable(*start_idx, phrase_tokens.len(), haystack_tokens.len())
        })
        .map(|(start_idx, _)| {
            let surplus = haystack_tokens.len() - phrase_tokens.len() + start_idx;
            1.0 - 0.1 * surplus as f32
        })
        .fold(None, |best: Option<f32>, confidence| {
            Some(best.map_or(confidence, |b| b.max(confidence)))
        })
}

fn window_is_actionable(start_idx: usize, phrase_len: usize, token_count: usize) -> bool {
    let prefix_tokens = start_idx;
    let suffix_tokens = token_count.saturating_sub(start_idx + phrase_len);
    if phrase_len == 1 {
        return prefix_tokens == 0 && suffix_tokens <= WAKE_SINGLE_WORD_MAX_SUFFIX_TOKENS;
    }
    prefix_tokens <= WAKE_MAX_PREFIX_TOKENS && suffix_tokens <= WAKE_MAX_SUFFIX_TOKENS
}

// ============================================================================
// Rolling window of recent voiced frames.
// ============================================================================

/// Outcome of feeding one frame into the wake window.
#[derive(Debug, PartialEq, Eq)]
pub enum WakeWindowVerdict {
    Accumulating,
    /// A speech burst settled; the window should be transcribed.
    Ready,
}

/// Bounded accumulator for the audio under wake-word consideration.
pub struct WakeWindow {
    frames: Vec<Vec<i16>>,
    speech_ms: u64,
    trailing_silence_ms: u64,
    max_frames: usize,
}

impl WakeWindow {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            speech_ms: 0,
            trailing_silence_ms: 0,
            max_frames: (WAKE_WINDOW_MS / FRAME_MS) as usize,
        }
    }

    /// Feed one classified frame. Call only while listening.
    pub fn push(&mut self, frame: &AudioFrame, is_voiced: bool) -> WakeWindowVerdict {
        if is_voiced {
            self.speech_ms += FRAME_MS;
            self.trailing_silence_ms = 0;
            self.frames.push(frame.samples.clone());
        } else if self.speech_ms > 0 {
            self.trailing_silence_ms += FRAME_MS;
            self.frames.push(frame.samples.clone());
        } else {
            // Leading silence carries no wake information.
            return WakeWindowVerdict::Accumulating;
        }

        let window_full = self.frames.len() >= self.max_frames;
        let settled =
            self.speech_ms >= WAKE_MIN_SPEECH_MS && self.trailing_silence_ms >= WAKE_SETTLE_SILENCE_MS;
        if window_full || settled {
            WakeWindowVerdict::Ready
        } else {
            WakeWindowVerdict::Accumulating
        }
    }

    /// Drain the window into contiguous PCM, resetting for the next burst.
    pub fn take_pcm(&mut self) -> Vec<i16> {
        let total: usize = self.frames.iter().map(Vec::len).sum();
        let mut pcm = Vec::with_capacity(total);
        for frame in self.frames.drain(..) {
            pcm.extend(frame);
        }
        self.speech_ms = 0;
        self.trailing_silence_ms = 0;
        pcm
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.speech_ms = 0;
        self.trailing_silence_ms = 0;
    }

    pub fn has_speech(&self) -> bool {
        self.speech_ms >= WAKE_MIN_SPEECH_MS
    }
}

impl Default for WakeWindow {
    fn default() -> Self {
        Self::new()
    }
}
