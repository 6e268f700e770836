//! Earshot adapter so VAD engine selection stays behind one stable interface.

use crate::audio::{VadDecision, VadEngine, FRAME_SAMPLES};
use earshot::{VoiceActivityDetector, VoiceActivityProfile};

/// Thin wrapper that adapts `earshot` to the crate's `VadEngine` trait.
pub struct EarshotVad {
    detector: VoiceActivityDetector,
    scratch: Vec<i16>,
}

fn profile_for_aggressiveness(aggressiveness: u8) -> VoiceActivityProfile {
    match aggressiveness {
        0 => VoiceActivityProfile::QUALITY,
        1 => VoiceActivityProfile::LBR,
        2 => VoiceActivityProfile::AGGRESSIVE,
        _ => VoiceActivityProfile::VERY_AGGRESSIVE,
    }
}

impl EarshotVad {
    /// Build an Earshot-backed VAD for the given aggressiveness (0..=3).
    #[must_use]
    pub fn new(aggressiveness: u8) -> Self {
        Self {
            detector: VoiceActivityDetector::new(profile_for_aggressiveness(aggressiveness)),
            scratch: Vec::new(),
        }
    }
}

impl VadEngine for EarshotVad {
    fn process_frame(&mut self, samples: &[i16]) -> VadDecision {
        if samples.is_empty() {
            return VadDecision::Uncertain;
        }
        // Earshot only accepts exact 10/20/30 ms windows at 16 kHz, so pad
        // or truncate to the pipeline's 20 ms frame.
        self.scratch.clear();
        self.scratch.extend_from_slice(samples);
        if self.scratch.len() < FRAME_SAMPLES {
            self.scratch.resize(FRAME_SAMPLES, 0);
        } else if self.scratch.len() > FRAME_SAMPLES {
            self.scratch.truncate(FRAME_SAMPLES);
        }
        match self.detector.predict_16khz(&self.scratch) {
            Ok(true) => VadDecision::Speech,
            Ok(false) => VadDecision::Silence,
            Err(_) => VadDecision::Error,
        }
    }

    fn reset(&mut self) {
        self.detector.reset();
    }

    fn name(&self) -> &'static str {
        "earshot_vad"
    }
}
