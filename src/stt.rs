//! Whisper speech-to-text integration so captured utterances become local transcripts.
//!
//! Wraps `whisper_rs` behind a small API. The model is loaded once and
//! reused across captures; loading happens on the calling thread and is
//! the slow part, so the controller defers it to *Preparing*.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::config::Mode;

/// ASR backends the catalog can name. Only Whisper-family models have a
/// compiled-in engine today; Parakeet identifiers are listed but report
/// as unavailable when selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrModelKind {
    WhisperLike,
    Parakeet,
}

impl AsrModelKind {
    pub fn classify(model_id: &str) -> Self {
        if model_id.to_ascii_lowercase().contains("parakeet") {
            AsrModelKind::Parakeet
        } else {
            AsrModelKind::WhisperLike
        }
    }
}

/// Decode parameters passed through to Whisper for each request.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub lang: String,
    pub beam_size: usize,
    pub temperature: f32,
}

#[inline]
fn should_insert_boundary_space(prev: char, next: char) -> bool {
    if prev.is_whitespace() || next.is_whitespace() {
        return false;
    }
    if matches!(
        next,
        '.' | ',' | '!' | '?' | ';' | ':' | '%' | ')' | ']' | '}' | '"' | '\''
    ) {
        return false;
    }
    if matches!(prev, '(' | '[' | '{' | '"' | '\'' | '/' | '-') {
        return false;
    }
    true
}

fn append_segment(transcript: &mut String, segment: &str) {
    let segment = segment.trim();
    if segment.is_empty() {
        return;
    }
    if let (Some(prev), Some(next)) = (transcript.chars().last(), segment.chars().next()) {
        if should_insert_boundary_space(prev, next) {
            transcript.push(' ');
        }
    }
    transcript.push_str(segment);
}

fn samples_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32_768.0).collect()
}

#[cfg(unix)]
mod platform {
    use anyhow::{anyhow, Context, Result};
    use std::io;
    use std::os::raw::{c_char, c_uint, c_void};
    use std::os::unix::io::AsRawFd;
    use std::sync::Once;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    use super::DecodeOptions;
    use crate::log_debug;

    /// Whisper model context for speech-to-text transcription.
    ///
    /// Holds the loaded GGML model in memory. Create once and reuse for all
    /// transcription requests to avoid repeated model loading.
    pub struct Transcriber {
        ctx: WhisperContext,
    }

    impl Transcriber {
        /// Loads the Whisper model from disk.
        ///
        /// Temporarily redirects stderr to `/dev/null` during loading because
        /// whisper.cpp emits verbose initialization messages that would land
        /// between transport lines.
        ///
        /// # Errors
        ///
        /// Returns an error if the model file cannot be loaded or stderr
        /// redirection fails.
        pub fn new(model_path: &str) -> Result<Self> {
            install_whisper_log_silencer();

            let null = std::fs::OpenOptions::new()
                .write(true)
                .open("/dev/null")
                .context("failed to open /dev/null")?;
            let null_fd = null.as_raw_fd();

            // SAFETY: dup(2) duplicates the stderr file descriptor. We restore
            // it after model loading completes and hold the only reference.
            let orig_stderr = unsafe { libc::dup(2) };
            if orig_stderr < 0 {
                return Err(anyhow!(
                    "failed to dup stderr: {}",
                    io::Error::last_os_error()
                ));
            }

            // SAFETY: dup2 replaces stderr with /dev/null; both fds are valid.
            let dup_result = unsafe { libc::dup2(null_fd, 2) };
            if dup_result < 0 {
                // SAFETY: orig_stderr is a valid fd from dup(2).
                unsafe {
                    libc::close(orig_stderr);
                }
                return Err(anyhow!(
                    "failed to redirect stderr: {}",
                    io::Error::last_os_error()
                ));
            }

            let ctx_result =
                WhisperContext::new_with_params(model_path, WhisperContextParameters::default());

            // SAFETY: restore stderr using the saved fd from dup(2).
            let restore_result = unsafe { libc::dup2(orig_stderr, 2) };
            // SAFETY: orig_stderr is a valid fd returned by dup(2).
            unsafe {
                libc::close(orig_stderr);
            }
            if restore_result < 0 {
                return Err(anyhow!(
                    "failed to restore stderr: {}",
                    io::Error::last_os_error()
                ));
            }

            let ctx = ctx_result.context("failed to load whisper model")?;
            Ok(Self { ctx })
        }

        /// Run transcription for captured PCM and return the stitched text.
        ///
        /// # Errors
        ///
        /// Returns an error if Whisper state allocation fails or inference
        /// cannot complete for the provided samples.
        pub fn transcribe(&self, samples: &[i16], options: &DecodeOptions) -> Result<String> {
            let audio = super::samples_to_f32(samples);
            let mut state = self
                .ctx
                .create_state()
                .context("failed to create whisper state")?;
            let beam_size = i32::try_from(options.beam_size).unwrap_or(1);
            let mut params = if options.beam_size > 1 {
                FullParams::new(SamplingStrategy::BeamSearch {
                    beam_size,
                    patience: -1.0,
                })
            } else {
                FullParams::new(SamplingStrategy::Greedy { best_of: 1 })
            };
            if options.lang.eq_ignore_ascii_case("auto") {
                params.set_language(None);
                params.set_detect_language(true);
            } else {
                params.set_language(Some(&options.lang));
                params.set_detect_language(false);
            }
            params.set_temperature(options.temperature);
            // Keep one logical core free and clamp worker fanout to reduce
            // contention with the audio thread.
            let n_threads = std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
                .saturating_sub(1)
                .clamp(1, 4);
            params.set_n_threads(i32::try_from(n_threads).unwrap_or(1));
            params.set_print_progress(false);
            params.set_print_timestamps(false);
            params.set_print_special(false);
            params.set_print_realtime(false);
            params.set_translate(false);
            params.set_token_timestamps(false);
            state.full(params, &audio)?;
            let mut transcript = String::new();
            let num_segments = match state.full_n_segments() {
                Ok(count) => count,
                Err(err) => {
                    log_debug(&format!("whisper failed to read segment count: {err}"));
                    return Ok(transcript);
                }
            };
            if num_segments < 0 {
                log_debug("whisper returned a negative segment count");
                return Ok(transcript);
            }
            // Whisper splits output into small segments; stitch them together.
            for i in 0..num_segments {
                match state.full_get_segment_text_lossy(i) {
                    Ok(text) => super::append_segment(&mut transcript, &text),
                    Err(err) => log_debug(&format!("failed to read whisper segment {i}: {err}")),
                }
            }
            Ok(transcript.replace("[BLANK_AUDIO]", ""))
        }
    }

    fn install_whisper_log_silencer() {
        static INSTALL_LOG_CALLBACK: Once = Once::new();
        INSTALL_LOG_CALLBACK.call_once(|| unsafe {
            // SAFETY: whisper_rs expects a valid callback pointer; ours ignores
            // its inputs and never dereferences raw pointers.
            whisper_rs::set_log_callback(Some(whisper_log_callback), std::ptr::null_mut());
        });
    }

    #[allow(unused_variables)]
    unsafe extern "C" fn whisper_log_callback(
        _level: c_uint,
        _text: *const c_char,
        _user_data: *mut c_void,
    ) {
        // Silence the default whisper.cpp logger so it cannot interleave with
        // the transport.
        // SAFETY: We do not dereference any incoming pointers.
    }
}

#[cfg(unix)]
pub use platform::Transcriber;

#[cfg(not(unix))]
mod platform {
    use anyhow::{anyhow, Result};

    use super::DecodeOptions;

    /// Stub implementation for unsupported targets.
    pub struct Transcriber;

    impl Transcriber {
        /// # Errors
        ///
        /// Always returns an error because this target does not support Whisper.
        pub fn new(_: &str) -> Result<Self> {
            Err(anyhow!(
                "Whisper transcription is currently supported only on Unix-like platforms"
            ))
        }

        /// # Errors
        ///
        /// Always returns an error because this target does not support Whisper.
        pub fn transcribe(&self, _: &[i16], _: &DecodeOptions) -> Result<String> {
            Err(anyhow!(
                "Whisper transcription is currently supported only on Unix-like platforms"
            ))
        }
    }
}

#[cfg(not(unix))]
pub use platform::Transcriber;

// ============================================================================
// Fingerprinted transcript cache
// ============================================================================

/// Cache key: PCM content, mode, and the digest of the prompt in force.
pub fn fingerprint(pcm: &[i16], mode: Mode, prompt_digest: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    pcm.hash(&mut hasher);
    mode.as_str().hash(&mut hasher);
    prompt_digest.hash(&mut hasher);
    hasher.finish()
}

/// Digest helper for prompt templates.
pub fn prompt_digest(prompt: Option<&str>) -> u64 {
    let mut hasher = DefaultHasher::new();
    prompt.unwrap_or("").hash(&mut hasher);
    hasher.finish()
}

enum CacheSlot {
    InFlight,
    Done(String),
}

/// Outcome of claiming a fingerprint before computing it.
#[derive(Debug, PartialEq, Eq)]
pub enum CacheClaim {
    /// Result already cached.
    Hit(String),
    /// Caller owns the computation and must call `complete` or `abandon`.
    Claimed,
    /// Another worker is already computing this fingerprint.
    Busy,
}

/// Transcript cache guaranteeing at most one concurrent computation per
/// fingerprint.
#[derive(Default)]
pub struct TranscriptCache {
    slots: Mutex<HashMap<u64, CacheSlot>>,
}

impl TranscriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, fp: u64) -> CacheClaim {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slots.get(&fp) {
            Some(CacheSlot::Done(text)) => CacheClaim::Hit(text.clone()),
            Some(CacheSlot::InFlight) => CacheClaim::Busy,
            None => {
                slots.insert(fp, CacheSlot::InFlight);
                CacheClaim::Claimed
            }
        }
    }

    pub fn complete(&self, fp: u64, text: String) {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.insert(fp, CacheSlot::Done(text));
    }

    /// Release a claim without storing a result (errors, cancellation).
    pub fn abandon(&self, fp: u64) {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        if matches!(slots.get(&fp), Some(CacheSlot::InFlight)) {
            slots.remove(&fp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_segment_inserts_spaces_for_sentence_boundaries() {
        let mut transcript = String::new();
        append_segment(&mut transcript, "The wound is healing well.");
        append_segment(&mut transcript, "No sign of infection.");
        assert_eq!(
            transcript,
            "The wound is healing well. No sign of infection."
        );
    }

    #[test]
    fn append_segment_avoids_extra_space_before_punctuation() {
        let mut transcript = String::new();
        append_segment(&mut transcript, "hello");
        append_segment(&mut transcript, "!");
        append_segment(&mut transcript, "?");
        assert_eq!(transcript, "hello!?");
    }

    #[test]
    fn append_segment_keeps_contractions_attached() {
        let mut transcript = String::new();
        append_segment(&mut transcript, "I");
        append_segment(&mut transcript, "'m");
        append_segment(&mut transcript, "ready");
        assert_eq!(transcript, "I'm ready");
    }

    #[test]
    fn append_segment_trims_and_skips_empty_segments() {
        let mut transcript = String::from("hello");
        append_segment(&mut transcript, "   ");
        append_segment(&mut transcript, "  world  ");
        append_segment(&mut transcript, ".");
        assert_eq!(transcript, "hello world.");
    }

    #[test]
    fn sample_conversion_maps_full_scale() {
        let converted = samples_to_f32(&[i16::MIN, 0, i16::MAX]);
        assert!((converted[0] + 1.0).abs() < 1e-4);
        assert_eq!(converted[1], 0.0);
        assert!((converted[2] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn model_kind_classification_by_identifier() {
        assert_eq!(
            AsrModelKind::classify("ggml-base.en.bin"),
            AsrModelKind::WhisperLike
        );
        assert_eq!(
            AsrModelKind::classify("parakeet-tdt-0.6b"),
            AsrModelKind::Parakeet
        );
    }

    #[test]
    fn fingerprint_varies_with_pcm_mode_and_prompt() {
        let pcm_a = vec![1i16, 2, 3];
        let pcm_b = vec![1i16, 2, 4];
        let digest = prompt_digest(Some("fix grammar"));
        let base = fingerprint(&pcm_a, Mode::Dictate, digest);
        assert_ne!(base, fingerprint(&pcm_b, Mode::Dictate, digest));
        assert_ne!(base, fingerprint(&pcm_a, Mode::Proofread, digest));
        assert_ne!(base, fingerprint(&pcm_a, Mode::Dictate, prompt_digest(None)));
    }

    #[test]
    fn cache_allows_one_computation_per_fingerprint() {
        let cache = TranscriptCache::new();
        assert_eq!(cache.claim(7), CacheClaim::Claimed);
        assert_eq!(cache.claim(7), CacheClaim::Busy);
        cache.complete(7, "hello world".to_string());
        assert_eq!(cache.claim(7), CacheClaim::Hit("hello world".to_string()));
    }

    #[test]
    fn abandoned_claims_can_be_retried() {
        let cache = TranscriptCache::new();
        assert_eq!(cache.claim(9), CacheClaim::Claimed);
        cache.abandon(9);
        assert_eq!(cache.claim(9), CacheClaim::Claimed);
    }

    #[cfg(unix)]
    #[test]
    fn transcriber_rejects_missing_model() {
        assert!(Transcriber::new("/no/such/model.bin").is_err());
    }
}
