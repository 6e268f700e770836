//! Capture + classifier plumbing owned by the controller.
//!
//! Two threads feed the controller: the capture thread (device callback)
//! and the classifier thread, which turns raw frames into amplitude and
//! voicing labels. Both channels are bounded and drop oldest entries so
//! the audio path never blocks behind a slow consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::audio::{
    create_vad_engine, spawn_capture_thread, AudioFrame, CaptureEvent, CaptureHandle,
    FrameClassifier, CAPTURE_CHANNEL_CAPACITY,
};
use crate::log_debug;
use crate::CoreError;

/// Queue depth between the classifier and the controller.
const EVENT_CHANNEL_CAPACITY: usize = 64;

const CLASSIFIER_RECV_TIMEOUT_MS: u64 = 100;
const JOIN_TIMEOUT_MS: u64 = 1000;
const JOIN_POLL_MS: u64 = 5;

/// Classified audio delivered to the controller loop.
#[derive(Debug, Clone)]
pub enum AudioEvent {
    Frame {
        frame: AudioFrame,
        peak: i16,
        is_voiced: bool,
        /// The VAD backend failed on this frame; the controller reports
        /// it on the status channel without stopping the pipeline.
        vad_error: bool,
    },
    DeviceError(String),
}

/// Running capture + classifier pair.
pub struct AudioPipeline {
    capture: CaptureHandle,
    classifier_stop: Arc<AtomicBool>,
    classifier_handle: Option<JoinHandle<()>>,
    events: Receiver<AudioEvent>,
}

impl AudioPipeline {
    /// Open the device and start both threads.
    ///
    /// # Errors
    ///
    /// [`CoreError::AudioUnavailable`] when the device cannot be opened.
    pub fn start(
        device_hint: Option<String>,
        vad_aggressiveness: u8,
    ) -> Result<Self, CoreError> {
        let (frame_tx, frame_rx) = bounded(CAPTURE_CHANNEL_CAPACITY);
        let capture = spawn_capture_thread(device_hint, frame_tx, frame_rx.clone())?;

        let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let classifier_stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&classifier_stop);
        let thread_event_rx = event_rx.clone();
        let classifier_handle = thread::Builder::new()
            .name("frame-classifier".to_string())
            .spawn(move || {
                run_classifier(
                    frame_rx,
                    event_tx,
                    thread_event_rx,
                    thread_stop,
                    vad_aggressiveness,
                );
            })
            .map_err(|err| {
                CoreError::AudioUnavailable(format!("classifier thread spawn: {err}"))
            })?;

        Ok(Self {
            capture,
            classifier_stop,
            classifier_handle: Some(classifier_handle),
            events: event_rx,
        })
    }

    pub fn events(&self) -> &Receiver<AudioEvent> {
        &self.events
    }

    pub fn device_name(&self) -> &str {
        self.capture.device_name()
    }

    pub fn shutdown(&mut self) {
        self.capture.stop();
        self.classifier_stop.store(true, Ordering::Relaxed);
        let Some(handle) = self.classifier_handle.take() else {
            return;
        };
        let deadline = Instant::now() + Duration::from_millis(JOIN_TIMEOUT_MS);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(JOIN_POLL_MS));
        }
        if handle.is_finished() {
            if let Err(err) = handle.join() {
                log_debug(&format!("classifier thread panicked: {err:?}"));
            }
        } else {
            log_debug("classifier thread did not exit in time; detaching");
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_classifier(
    frame_rx: Receiver<CaptureEvent>,
    event_tx: Sender<AudioEvent>,
    event_rx: Receiver<AudioEvent>,
    stop_flag: Arc<AtomicBool>,
    vad_aggressiveness: u8,
) {
    let mut classifier = FrameClassifier::new(create_vad_engine(vad_aggressiveness));
    log_debug(&format!(
        "classifier running with {} (aggressiveness {vad_aggressiveness})",
        classifier.vad_name()
    ));

    while !stop_flag.load(Ordering::Relaxed) {
        let event = match frame_rx.recv_timeout(Duration::from_millis(CLASSIFIER_RECV_TIMEOUT_MS))
        {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let outgoing = match event {
            CaptureEvent::Frame(frame) => {
                let classified = classifier.classify(&frame.samples);
                AudioEvent::Frame {
                    frame,
                    peak: classified.peak,
                    is_voiced: classified.is_voiced,
                    vad_error: classified.vad_error,
                }
            }
            CaptureEvent::DeviceError(message) => AudioEvent::DeviceError(message),
        };
        send_drop_oldest(&event_tx, &event_rx, outgoing);
    }
    log_debug("classifier thread exiting");
}

fn send_drop_oldest(tx: &Sender<AudioEvent>, rx: &Receiver<AudioEvent>, event: AudioEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            let _ = rx.try_recv();
            let _ = tx.try_send(event);
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}
