//! Session phase machine and the UI-facing state snapshot.

use std::time::Instant;

use crate::config::Mode;
use crate::ipc::protocol::{AudioState, StateSnapshot};

/// Where the session currently is. Only the controller mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Inactive,
    Preparing,
    Listening,
    Capturing(Mode),
    Transcribing(Mode),
    Processing(Mode),
    Delivering(Mode),
}

impl Phase {
    pub fn mode(&self) -> Option<Mode> {
        match self {
            Phase::Capturing(mode)
            | Phase::Transcribing(mode)
            | Phase::Processing(mode)
            | Phase::Delivering(mode) => Some(*mode),
            Phase::Inactive | Phase::Preparing | Phase::Listening => None,
        }
    }

    pub fn audio_state(&self) -> AudioState {
        match self {
            Phase::Inactive | Phase::Preparing => AudioState::Inactive,
            Phase::Listening => AudioState::Activation,
            Phase::Capturing(_) => AudioState::Dictation,
            Phase::Transcribing(_) | Phase::Processing(_) | Phase::Delivering(_) => {
                AudioState::Processing
            }
        }
    }

    /// A session phase that must be exclusive: at most one of these is
    /// ever active.
    pub fn is_session_active(&self) -> bool {
        matches!(
            self,
            Phase::Capturing(_) | Phase::Transcribing(_) | Phase::Processing(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Inactive => "inactive",
            Phase::Preparing => "preparing",
            Phase::Listening => "listening",
            Phase::Capturing(_) => "capturing",
            Phase::Transcribing(_) => "transcribing",
            Phase::Processing(_) => "processing",
            Phase::Delivering(_) => "delivering",
        }
    }
}

/// Whether `from → to` appears in the transition table.
///
/// Shutdown and fatal audio failure may force `Inactive` from anywhere, so
/// every `to == Inactive` pair is allowed.
pub fn transition_allowed(from: Phase, to: Phase) -> bool {
    use Phase::*;
    if matches!(to, Inactive) {
        return true;
    }
    match (from, to) {
        (Inactive, Preparing) => true,
        (Preparing, Listening) => true,
        (Listening, Capturing(_)) => true,
        (Capturing(a), Transcribing(b)) => a == b,
        (Capturing(_), Listening) => true,
        (Transcribing(Mode::Dictate), Delivering(Mode::Dictate)) => true,
        (Transcribing(a), Processing(b)) => a == b && a.uses_llm(),
        (Transcribing(_), Listening) => true,
        (Processing(a), Delivering(b)) => a == b,
        (Processing(_), Listening) => true,
        (Delivering(_), Listening) => true,
        _ => false,
    }
}

/// Build the snapshot published with `STATE:`.
pub fn build_snapshot(phase: Phase, program_active: bool, asr_loaded: bool) -> StateSnapshot {
    StateSnapshot {
        program_active,
        audio_state: phase.audio_state(),
        is_dictating: matches!(phase, Phase::Capturing(_) | Phase::Transcribing(_)),
        is_proofing_active: matches!(phase, Phase::Processing(_)),
        can_dictate: program_active && asr_loaded && matches!(phase, Phase::Listening),
        current_mode: phase.mode().map(|mode| mode.as_str()),
    }
}

/// Minimum spacing between `AUDIO_AMP` lines (≤30 Hz on the wire).
pub const AMP_MIN_INTERVAL_MS: u64 = 34;

/// Rate limiter for the amplitude stream.
pub struct AmpThrottle {
    last_emit: Option<Instant>,
}

impl AmpThrottle {
    pub fn new() -> Self {
        Self { last_emit: None }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        let allowed = self
            .last_emit
            .map_or(true, |last| {
                now.duration_since(last).as_millis() as u64 >= AMP_MIN_INTERVAL_MS
            });
        if allowed {
            self.last_emit = Some(now);
        }
        allowed
    }
}

impl Default for AmpThrottle {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale a peak sample to the 0..=100 meter range.
pub fn amp_level(peak: i16) -> u8 {
    ((u32::from(peak.unsigned_abs()) * 100) / u32::from(i16::MAX as u16)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn documented_transitions_are_allowed() {
        use Phase::*;
        let allowed = [
            (Inactive, Preparing),
            (Preparing, Listening),
            (Listening, Capturing(Mode::Dictate)),
            (Capturing(Mode::Dictate), Transcribing(Mode::Dictate)),
            (Capturing(Mode::Letter), Listening),
            (Transcribing(Mode::Dictate), Delivering(Mode::Dictate)),
            (Transcribing(Mode::Proofread), Processing(Mode::Proofread)),
            (Transcribing(Mode::Letter), Processing(Mode::Letter)),
            (Processing(Mode::Letter), Delivering(Mode::Letter)),
            (Processing(Mode::Proofread), Listening),
            (Delivering(Mode::Dictate), Listening),
            (Listening, Inactive),
            (Processing(Mode::Letter), Inactive),
        ];
        for (from, to) in allowed {
            assert!(transition_allowed(from, to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn undocumented_transitions_are_rejected() {
        use Phase::*;
        let rejected = [
            (Inactive, Listening),
            (Listening, Transcribing(Mode::Dictate)),
            (Capturing(Mode::Dictate), Transcribing(Mode::Letter)),
            (Transcribing(Mode::Dictate), Processing(Mode::Dictate)),
            (Transcribing(Mode::Letter), Delivering(Mode::Letter)),
            (Delivering(Mode::Dictate), Capturing(Mode::Dictate)),
            (Preparing, Capturing(Mode::Dictate)),
        ];
        for (from, to) in rejected {
            assert!(!transition_allowed(from, to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn snapshot_reflects_phase_and_capabilities() {
        let listening = build_snapshot(Phase::Listening, true, true);
        assert!(listening.can_dictate);
        assert!(!listening.is_dictating);
        assert_eq!(listening.audio_state, AudioState::Activation);

        let capturing = build_snapshot(Phase::Capturing(Mode::Proofread), true, true);
        assert!(capturing.is_dictating);
        assert!(!capturing.can_dictate);
        assert_eq!(capturing.current_mode, Some("proofread"));

        let processing = build_snapshot(Phase::Processing(Mode::Letter), true, true);
        assert!(processing.is_proofing_active);
        assert!(!processing.is_dictating);

        let no_asr = build_snapshot(Phase::Listening, true, false);
        assert!(!no_asr.can_dictate);
    }

    #[test]
    fn session_exclusivity_holds_per_phase() {
        for mode in Mode::ALL {
            let snapshot = build_snapshot(Phase::Processing(mode), true, true);
            assert!(!(snapshot.is_dictating && snapshot.is_proofing_active));
            let snapshot = build_snapshot(Phase::Capturing(mode), true, true);
            assert!(!(snapshot.is_dictating && snapshot.is_proofing_active));
        }
    }

    #[test]
    fn amp_throttle_caps_the_rate() {
        let mut throttle = AmpThrottle::new();
        let start = Instant::now();
        assert!(throttle.allow(start));
        assert!(!throttle.allow(start + Duration::from_millis(10)));
        assert!(!throttle.allow(start + Duration::from_millis(33)));
        assert!(throttle.allow(start + Duration::from_millis(34)));
    }

    #[test]
    fn amp_throttle_allows_at_most_thirty_per_second() {
        let mut throttle = AmpThrottle::new();
        let start = Instant::now();
        let mut emitted = 0;
        for ms in 0..1000u64 {
            if throttle.allow(start + Duration::from_millis(ms)) {
                emitted += 1;
            }
        }
        assert!(emitted <= 30, "emitted {emitted} amps in one second");
    }

    #[test]
    fn amp_level_scales_full_range() {
        assert_eq!(amp_level(0), 0);
        assert_eq!(amp_level(i16::MAX), 100);
        assert!(amp_level(i16::MAX / 2) >= 49);
    }
}
