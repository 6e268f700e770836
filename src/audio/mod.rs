//! Real-time audio pipeline: capture, per-frame classification, and
//! utterance recording.

pub const TARGET_RATE: u32 = 16_000;
pub const TARGET_CHANNELS: u16 = 1;

/// Frame duration used across the pipeline.
pub const FRAME_MS: u64 = 20;

/// Samples per frame at the target rate.
pub const FRAME_SAMPLES: usize = (TARGET_RATE as usize * FRAME_MS as usize) / 1000;

mod capture;
mod classifier;
mod frame;
mod recorder;
mod resample;
mod vad;

pub use capture::{
    spawn_capture_thread, CaptureEvent, CaptureHandle, CAPTURE_CHANNEL_CAPACITY,
};
pub use classifier::{
    Classified, FrameClassifier, VAD_SKIP_AMPLITUDE_THRESHOLD, VAD_SKIP_CONSECUTIVE_FRAMES,
};
pub use frame::{peak_amplitude, AudioFrame};
pub use recorder::{RecorderConfig, RecorderVerdict, UtteranceMetrics, UtteranceRecorder};
pub use resample::Resampler;
pub use vad::{create_vad_engine, ThresholdVad, VadDecision, VadEngine};
