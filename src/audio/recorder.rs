//! Bounded utterance recorder with trailing-silence auto-stop.
//!
//! The recorder is the policy layer between frame labels and the
//! transcription request. It keeps inter-word pauses (silence below the
//! auto-stop threshold is retained), enforces the frame cap by dropping
//! oldest frames, and stops the session outright at the hard duration cap.

use std::collections::VecDeque;

use super::FRAME_MS;

/// Silence retained at the end of a silence-stopped capture so trailing
/// consonants are not clipped at frame boundaries.
const TRAILING_SILENCE_KEEP_MS: u64 = 200;

/// Recorder limits, derived from [`crate::config::EngineSettings`].
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub max_frames: usize,
    pub auto_stop_silence_ms: u64,
    pub progressive_cleanup_ms: u64,
    pub hard_cap_ms: u64,
}

impl RecorderConfig {
    fn progressive_window_frames(&self) -> usize {
        (self.progressive_cleanup_ms / FRAME_MS).max(1) as usize
    }
}

/// Outcome of pushing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderVerdict {
    Continue,
    /// Trailing silence reached the configured threshold.
    AutoStop,
    /// Total capture duration hit the hard cap; the session is stopped
    /// with a warning rather than dropping further audio.
    HardStop,
}

/// Counters reported at the end of a capture session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtteranceMetrics {
    pub capture_ms: u64,
    pub speech_ms: u64,
    pub silence_tail_ms: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
}

struct FrameRecord {
    samples: Vec<i16>,
    is_voiced: bool,
}

/// Frame buffer captured since the last transition into capturing.
///
/// Owned by the controller during capture and moved into the transcription
/// request on stop.
pub struct UtteranceRecorder {
    config: RecorderConfig,
    frames: VecDeque<FrameRecord>,
    frames_seen: u64,
    frames_dropped: u64,
    overflow_warning_pending: bool,
    overflow_warned: bool,
    speech_ms: u64,
    silence_streak_ms: u64,
    total_ms: u64,
}

impl UtteranceRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            frames: VecDeque::new(),
            frames_seen: 0,
            frames_dropped: 0,
            overflow_warning_pending: false,
            overflow_warned: false,
            speech_ms: 0,
            silence_streak_ms: 0,
            total_ms: 0,
        }
    }

    /// Append one classified frame and report whether capture should stop.
    pub fn push(&mut self, samples: Vec<i16>, is_voiced: bool) -> RecorderVerdict {
        self.frames_seen = self.frames_seen.saturating_add(1);
        self.total_ms = self.total_ms.saturating_add(FRAME_MS);

        if is_voiced {
            self.speech_ms = self.speech_ms.saturating_add(FRAME_MS);
            self.silence_streak_ms = 0;
        } else {
            self.silence_streak_ms = self.silence_streak_ms.saturating_add(FRAME_MS);
        }

        self.frames.push_back(FrameRecord { samples, is_voiced });
        self.enforce_bounds();

        if self.total_ms >= self.config.hard_cap_ms {
            return RecorderVerdict::HardStop;
        }
        if self.speech_ms > 0 && self.silence_streak_ms >= self.config.auto_stop_silence_ms {
            return RecorderVerdict::AutoStop;
        }
        RecorderVerdict::Continue
    }

    fn enforce_bounds(&mut self) {
        let mut cap = self.config.max_frames.max(1);
        if self.total_ms >= self.config.progressive_cleanup_ms {
            // Past the progressive-cleanup point, tighten to the newest
            // window so long sessions cannot grow the buffer back.
            cap = cap.min(self.config.progressive_window_frames());
        }
        while self.frames.len() > cap {
            if self.frames.pop_front().is_none() {
                break;
            }
            self.frames_dropped = self.frames_dropped.saturating_add(1);
            if !self.overflow_warned {
                self.overflow_warned = true;
                self.overflow_warning_pending = true;
            }
        }
    }

    /// True exactly once per session, the first time frames were dropped.
    pub fn take_overflow_warning(&mut self) -> bool {
        std::mem::take(&mut self.overflow_warning_pending)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn speech_ms(&self) -> u64 {
        self.speech_ms
    }

    pub fn metrics(&self) -> UtteranceMetrics {
        UtteranceMetrics {
            capture_ms: self.total_ms,
            speech_ms: self.speech_ms,
            silence_tail_ms: self.silence_streak_ms,
            frames_processed: self.frames_seen,
            frames_dropped: self.frames_dropped,
        }
    }

    /// Consume the buffer into contiguous PCM for transcription.
    ///
    /// When the capture ended on silence, the trailing silent span is
    /// trimmed down to a short keep-window; inter-word pauses earlier in
    /// the utterance are untouched.
    pub fn into_pcm(mut self, stopped_on_silence: bool) -> Vec<i16> {
        if stopped_on_silence {
            self.trim_trailing_silence();
        }
        let total: usize = self.frames.iter().map(|f| f.samples.len()).sum();
        let mut pcm = Vec::with_capacity(total);
        for record in self.frames {
            pcm.extend(record.samples);
        }
        pcm
    }

    fn trim_trailing_silence(&mut self) {
        let keep_frames = (TRAILING_SILENCE_KEEP_MS / FRAME_MS) as usize;
        let trailing_silent = self
            .frames
            .iter()
            .rev()
            .take_while(|record| !record.is_voiced)
            .count();
        let excess = trailing_silent.saturating_sub(keep_frames);
        for _ in 0..excess {
            self.frames.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RecorderConfig {
        RecorderConfig {
            max_frames: 600,
            auto_stop_silence_ms: 1500,
            progressive_cleanup_ms: 60_000,
            hard_cap_ms: 150_000,
        }
    }

    fn frame() -> Vec<i16> {
        vec![100i16; 320]
    }

    #[test]
    fn auto_stop_fires_after_sustained_trailing_silence() {
        let mut recorder = UtteranceRecorder::new(config());
        for _ in 0..50 {
            assert_eq!(recorder.push(frame(), true), RecorderVerdict::Continue);
        }
        // 1.5 s of silence is 75 frames at 20 ms.
        for _ in 0..74 {
            assert_eq!(recorder.push(frame(), false), RecorderVerdict::Continue);
        }
        assert_eq!(recorder.push(frame(), false), RecorderVerdict::AutoStop);
    }

    #[test]
    fn voiced_frame_resets_the_silence_timer() {
        let mut recorder = UtteranceRecorder::new(config());
        recorder.push(frame(), true);
        for _ in 0..70 {
            recorder.push(frame(), false);
        }
        recorder.push(frame(), true);
        assert_eq!(recorder.metrics().silence_tail_ms, 0);
        for _ in 0..74 {
            assert_eq!(recorder.push(frame(), false), RecorderVerdict::Continue);
        }
        assert_eq!(recorder.push(frame(), false), RecorderVerdict::AutoStop);
    }

    #[test]
    fn silence_alone_never_stops_a_capture_without_speech() {
        let mut recorder = UtteranceRecorder::new(config());
        for _ in 0..200 {
            assert_eq!(recorder.push(frame(), false), RecorderVerdict::Continue);
        }
    }

    #[test]
    fn frame_cap_drops_oldest_and_warns_once() {
        let mut cfg = config();
        cfg.max_frames = 10;
        let mut recorder = UtteranceRecorder::new(cfg);
        for _ in 0..25 {
            recorder.push(frame(), true);
        }
        assert_eq!(recorder.len_frames(), 10);
        assert!(recorder.take_overflow_warning());
        assert!(!recorder.take_overflow_warning(), "warning is once per session");
        assert_eq!(recorder.metrics().frames_dropped, 15);
    }

    #[test]
    fn buffer_stays_bounded_at_all_times() {
        let mut cfg = config();
        cfg.max_frames = 32;
        let mut recorder = UtteranceRecorder::new(cfg);
        for _ in 0..500 {
            recorder.push(frame(), true);
            assert!(recorder.len_frames() <= 32);
        }
    }

    #[test]
    fn hard_cap_stops_with_auto_stop_semantics_not_overflow() {
        let mut cfg = config();
        cfg.hard_cap_ms = 1000; // 50 frames
        cfg.max_frames = 600;
        let mut recorder = UtteranceRecorder::new(cfg);
        let mut verdict = RecorderVerdict::Continue;
        let mut pushes = 0;
        while verdict == RecorderVerdict::Continue {
            verdict = recorder.push(frame(), true);
            pushes += 1;
        }
        assert_eq!(verdict, RecorderVerdict::HardStop);
        assert_eq!(pushes, 50);
        assert!(!recorder.take_overflow_warning(), "no frames were dropped");
    }

    #[test]
    fn silence_stop_trims_tail_but_keeps_lookback() {
        let mut recorder = UtteranceRecorder::new(config());
        for _ in 0..20 {
            recorder.push(frame(), true);
        }
        for _ in 0..75 {
            recorder.push(frame(), false);
        }
        let pcm = recorder.into_pcm(true);
        // 20 voiced frames + 10 lookback frames (200 ms at 20 ms/frame).
        assert_eq!(pcm.len(), 30 * 320);
    }

    #[test]
    fn manual_stop_keeps_the_full_buffer() {
        let mut recorder = UtteranceRecorder::new(config());
        for _ in 0..20 {
            recorder.push(frame(), true);
        }
        for _ in 0..30 {
            recorder.push(frame(), false);
        }
        let pcm = recorder.into_pcm(false);
        assert_eq!(pcm.len(), 50 * 320);
    }

    #[test]
    fn progressive_cleanup_tightens_cap_after_the_window() {
        let mut cfg = config();
        cfg.max_frames = 5000;
        cfg.progressive_cleanup_ms = 1000; // 50 frames
        cfg.hard_cap_ms = 10_000;
        let mut recorder = UtteranceRecorder::new(cfg);
        for _ in 0..200 {
            recorder.push(frame(), true);
        }
        assert!(recorder.len_frames() <= 50);
    }
}
