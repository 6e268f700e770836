//! VAD engine trait so detector selection stays behind one stable interface.

use crate::audio::peak_amplitude;

/// Per-frame classification from a VAD backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
    /// Backend could not decide (empty or short frame). Treated as not
    /// voiced by the classifier.
    Uncertain,
    /// Backend failed outright. Treated as not voiced, but the failure is
    /// surfaced so the controller can emit an error status.
    Error,
}

/// One voice-activity backend. Implementations must not block.
pub trait VadEngine {
    fn process_frame(&mut self, samples: &[i16]) -> VadDecision;
    fn reset(&mut self);
    fn name(&self) -> &'static str;
}

/// Amplitude-gate fallback used when no model-based VAD is compiled in.
///
/// Aggressiveness raises the gate: quiet rooms pass at 0, only firm speech
/// passes at 3.
pub struct ThresholdVad {
    threshold: i16,
}

const THRESHOLD_BY_AGGRESSIVENESS: [i16; 4] = [180, 320, 520, 900];

impl ThresholdVad {
    #[must_use]
    pub fn new(aggressiveness: u8) -> Self {
        let idx = (aggressiveness as usize).min(THRESHOLD_BY_AGGRESSIVENESS.len() - 1);
        Self {
            threshold: THRESHOLD_BY_AGGRESSIVENESS[idx],
        }
    }
}

impl VadEngine for ThresholdVad {
    fn process_frame(&mut self, samples: &[i16]) -> VadDecision {
        if samples.is_empty() {
            return VadDecision::Uncertain;
        }
        if peak_amplitude(samples) >= self.threshold {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "threshold_vad"
    }
}

/// Build the configured VAD backend for the given aggressiveness (0..=3).
pub fn create_vad_engine(aggressiveness: u8) -> Box<dyn VadEngine + Send> {
    #[cfg(feature = "vad_earshot")]
    {
        Box::new(crate::vad_earshot::EarshotVad::new(aggressiveness))
    }
    #[cfg(not(feature = "vad_earshot"))]
    {
        Box::new(ThresholdVad::new(aggressiveness))
    }
}
