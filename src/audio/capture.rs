//! Microphone capture thread that owns the cpal device exclusively.
//!
//! The device callback downmixes to mono, resamples to 16 kHz, slices the
//! stream into fixed 20 ms frames, and pushes them into a small bounded
//! channel. When the consumer falls behind, the oldest queued frame is
//! dropped so capture stays real-time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::log_debug;
use crate::CoreError;

use super::frame::AudioFrame;
use super::resample::Resampler;
use super::{FRAME_SAMPLES, TARGET_RATE};

/// Queue depth between capture and the classifier. Small on purpose: a
/// slow consumer loses old audio rather than delaying new audio.
pub const CAPTURE_CHANNEL_CAPACITY: usize = 4;

const READY_TIMEOUT_MS: u64 = 3000;
const STOP_POLL_MS: u64 = 50;
const JOIN_TIMEOUT_MS: u64 = 1000;
const JOIN_POLL_MS: u64 = 5;

/// Messages produced by the capture thread.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Frame(AudioFrame),
    /// Device read failed mid-stream. Capture is over until re-init.
    DeviceError(String),
}

/// Owner handle for the capture thread lifecycle.
pub struct CaptureHandle {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    device_name: String,
}

impl CaptureHandle {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + Duration::from_millis(JOIN_TIMEOUT_MS);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(JOIN_POLL_MS));
        }
        if handle.is_finished() {
            if let Err(err) = handle.join() {
                log_debug(&format!("capture thread panicked during shutdown: {err:?}"));
            }
        } else {
            log_debug("capture thread did not exit in time; detaching");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the capture thread and wait for the device to open.
///
/// The receiver clone is used by the producer side to drop the oldest
/// queued frame when the channel is full.
///
/// # Errors
///
/// Returns [`CoreError::AudioUnavailable`] when no input device matches or
/// the stream cannot be opened.
pub fn spawn_capture_thread(
    device_hint: Option<String>,
    tx: Sender<CaptureEvent>,
    rx: Receiver<CaptureEvent>,
) -> Result<CaptureHandle, CoreError> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop_flag);
    let (ready_tx, ready_rx) = mpsc::channel::<Result<String, String>>();

    let handle = thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || run_capture(device_hint, tx, rx, thread_stop, ready_tx))
        .map_err(|err| CoreError::AudioUnavailable(format!("capture thread spawn: {err}")))?;

    match ready_rx.recv_timeout(Duration::from_millis(READY_TIMEOUT_MS)) {
        Ok(Ok(device_name)) => Ok(CaptureHandle {
            stop_flag,
            handle: Some(handle),
            device_name,
        }),
        Ok(Err(message)) => {
            let _ = handle.join();
            Err(CoreError::AudioUnavailable(message))
        }
        Err(_) => {
            stop_flag.store(true, Ordering::Relaxed);
            Err(CoreError::AudioUnavailable(
                "audio device did not open in time".to_string(),
            ))
        }
    }
}

fn run_capture(
    device_hint: Option<String>,
    tx: Sender<CaptureEvent>,
    rx: Receiver<CaptureEvent>,
    stop_flag: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<String, String>>,
) {
    let host = cpal::default_host();
    let device = match select_device(&host, device_hint.as_deref()) {
        Ok(device) => device,
        Err(message) => {
            let _ = ready_tx.send(Err(message));
            return;
        }
    };
    let device_name = device
        .name()
        .unwrap_or_else(|_| "Unknown Device".to_string());

    let supported = match device.default_input_config() {
        Ok(config) => config,
        Err(err) => {
            let _ = ready_tx.send(Err(format!("no usable input config: {err}")));
            return;
        }
    };
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels;
    let input_rate = config.sample_rate.0;

    let mut assembler = FrameAssembler::new(input_rate, channels);
    let frame_tx = tx.clone();
    let frame_rx = rx.clone();
    let err_tx = tx.clone();

    let stream_result = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                assembler.push_f32(data, &frame_tx, &frame_rx);
            },
            move |err| {
                let _ = err_tx.try_send(CaptureEvent::DeviceError(err.to_string()));
            },
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                assembler.push_i16(data, &frame_tx, &frame_rx);
            },
            move |err| {
                let _ = err_tx.try_send(CaptureEvent::DeviceError(err.to_string()));
            },
            None,
        ),
        other => {
            let _ = ready_tx.send(Err(format!("unsupported sample format {other:?}")));
            return;
        }
    };

    let stream = match stream_result {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(format!("failed to open input stream: {err}")));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(format!("failed to start input stream: {err}")));
        return;
    }

    log_debug(&format!(
        "capture running on '{device_name}' at {input_rate} Hz, {channels} ch"
    ));
    let _ = ready_tx.send(Ok(device_name));

    // The stream lives on this thread; keep it alive until asked to stop.
    while !stop_flag.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(STOP_POLL_MS));
    }
    drop(stream);
    log_debug("capture thread exiting");
}

fn select_device(host: &cpal::Host, hint: Option<&str>) -> Result<cpal::Device, String> {
    if let Some(hint) = hint {
        let needle = hint.to_lowercase();
        let devices = host
            .input_devices()
            .map_err(|err| format!("cannot enumerate input devices: {err}"))?;
        for device in devices {
            if let Ok(name) = device.name() {
                if name.to_lowercase().contains(&needle) {
                    return Ok(device);
                }
            }
        }
        return Err(format!("no input device matching '{hint}'"));
    }
    host.default_input_device()
        .ok_or_else(|| "no default input device".to_string())
}

/// Accumulates device samples into fixed pipeline frames.
struct FrameAssembler {
    channels: u16,
    resampler: Resampler,
    mono: Vec<f32>,
    resampled: Vec<f32>,
    pending: Vec<i16>,
    seq: u64,
}

impl FrameAssembler {
    fn new(input_rate: u32, channels: u16) -> Self {
        Self {
            channels: channels.max(1),
            resampler: Resampler::new(input_rate, TARGET_RATE),
            mono: Vec::new(),
            resampled: Vec::new(),
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            seq: 0,
        }
    }

    fn push_f32(
        &mut self,
        data: &[f32],
        tx: &Sender<CaptureEvent>,
        rx: &Receiver<CaptureEvent>,
    ) {
        self.downmix(data);
        self.emit_frames(tx, rx);
    }

    fn push_i16(
        &mut self,
        data: &[i16],
        tx: &Sender<CaptureEvent>,
        rx: &Receiver<CaptureEvent>,
    ) {
        self.mono.clear();
        let channels = usize::from(self.channels);
        for interleaved in data.chunks(channels) {
            let sum: f32 = interleaved
                .iter()
                .map(|&s| f32::from(s) / 32_768.0)
                .sum();
            self.mono.push(sum / interleaved.len() as f32);
        }
        self.emit_frames(tx, rx);
    }

    fn downmix(&mut self, data: &[f32]) {
        self.mono.clear();
        let channels = usize::from(self.channels);
        for interleaved in data.chunks(channels) {
            let sum: f32 = interleaved.iter().sum();
            self.mono.push(sum / interleaved.len() as f32);
        }
    }

    fn emit_frames(&mut self, tx: &Sender<CaptureEvent>, rx: &Receiver<CaptureEvent>) {
        self.resampled.clear();
        let mono = std::mem::take(&mut self.mono);
        self.resampler.process(&mono, &mut self.resampled);
        self.mono = mono;

        for &sample in &self.resampled {
            let clamped = sample.clamp(-1.0, 1.0);
            let quantized = if clamped >= 0.0 {
                (clamped * f32::from(i16::MAX)).round() as i16
            } else {
                (clamped * 32_768.0).round() as i16
            };
            self.pending.push(quantized);
        }

        while self.pending.len() >= FRAME_SAMPLES {
            let samples: Vec<i16> = self.pending.drain(..FRAME_SAMPLES).collect();
            let seq = self.seq;
            self.seq = self.seq.wrapping_add(1);
            send_frame_drop_oldest(tx, rx, AudioFrame::new(seq, samples));
        }
    }
}

fn send_frame_drop_oldest(
    tx: &Sender<CaptureEvent>,
    rx: &Receiver<CaptureEvent>,
    frame: AudioFrame,
) {
    match tx.try_send(CaptureEvent::Frame(frame)) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            // Consumer is behind: sacrifice the oldest queued frame.
            let _ = rx.try_recv();
            let _ = tx.try_send(event);
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}
