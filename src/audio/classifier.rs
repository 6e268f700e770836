//! Per-frame amplitude and voicing classification with a near-silence
//! short-circuit.
//!
//! Querying the VAD on every frame is wasted work in a quiet room. After
//! enough consecutive near-silent frames the classifier answers "not
//! voiced" directly; any frame above the amplitude gate resets the streak
//! and resumes normal VAD queries.

use super::frame::peak_amplitude;
use super::vad::{VadDecision, VadEngine};

/// Frames at or below this peak count toward the short-circuit streak.
pub const VAD_SKIP_AMPLITUDE_THRESHOLD: i16 = 5;

/// Quiet frames required before the VAD stops being queried. The first
/// frame past the streak is the one that skips.
pub const VAD_SKIP_CONSECUTIVE_FRAMES: u32 = 10;

/// Classification output for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub peak: i16,
    pub is_voiced: bool,
    /// The VAD backend failed on this frame. The frame still counts as
    /// not voiced; the controller surfaces the failure as an error status.
    pub vad_error: bool,
}

/// Stateful per-frame classifier. The only state it mutates is its own
/// quiet-streak counter; it never blocks.
pub struct FrameClassifier {
    vad: Box<dyn VadEngine + Send>,
    quiet_streak: u32,
}

impl FrameClassifier {
    pub fn new(vad: Box<dyn VadEngine + Send>) -> Self {
        Self {
            vad,
            quiet_streak: 0,
        }
    }

    pub fn classify(&mut self, samples: &[i16]) -> Classified {
        let peak = peak_amplitude(samples);

        if peak < VAD_SKIP_AMPLITUDE_THRESHOLD {
            self.quiet_streak = self.quiet_streak.saturating_add(1);
            if self.quiet_streak > VAD_SKIP_CONSECUTIVE_FRAMES {
                return Classified {
                    peak,
                    is_voiced: false,
                    vad_error: false,
                };
            }
        } else {
            self.quiet_streak = 0;
        }

        let decision = self.vad.process_frame(samples);
        Classified {
            peak,
            is_voiced: matches!(decision, VadDecision::Speech),
            vad_error: matches!(decision, VadDecision::Error),
        }
    }

    pub fn reset(&mut self) {
        self.quiet_streak = 0;
        self.vad.reset();
    }

    pub fn vad_name(&self) -> &'static str {
        self.vad.name()
    }
}
