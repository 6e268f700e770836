//! Background workers for the heavy-compute phases.
//!
//! Each job is a worker thread plus an mpsc receiver the controller polls
//! from its event loop. Workers never touch the transport directly; every
//! observable effect goes through a message the controller forwards.

use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::config::Mode;
use crate::llm::{self, LlmClient, LlmRequest, RepetitionGuard, StreamEvent, StreamOutcome};
use crate::log_debug;
use crate::stt::{self, CacheClaim, DecodeOptions, Transcriber, TranscriptCache};
use crate::wake::{match_wake, WakeMatch, WakePhraseSets};
use crate::CoreError;

// ============================================================================
// Transcription
// ============================================================================

#[derive(Debug)]
pub enum TranscriptionMessage {
    Done(String),
    Failed(String),
}

pub struct TranscriptionJob {
    pub receiver: Receiver<TranscriptionMessage>,
    pub started_at: Instant,
    pub mode: Mode,
}

pub fn spawn_transcription_job(
    transcriber: Arc<Mutex<Transcriber>>,
    cache: Arc<TranscriptCache>,
    pcm: Vec<i16>,
    mode: Mode,
    prompt_digest: u64,
    options: DecodeOptions,
) -> TranscriptionJob {
    let (tx, rx) = mpsc::channel();
    let started_at = Instant::now();
    thread::spawn(move || {
        let fp = stt::fingerprint(&pcm, mode, prompt_digest);
        let message = match cache.claim(fp) {
            CacheClaim::Hit(text) => {
                log_debug("transcription cache hit");
                TranscriptionMessage::Done(text)
            }
            CacheClaim::Busy => {
                TranscriptionMessage::Failed("transcription already in progress".to_string())
            }
            CacheClaim::Claimed => match run_transcription(&transcriber, &pcm, &options) {
                Ok(text) => {
                    cache.complete(fp, text.clone());
                    TranscriptionMessage::Done(text)
                }
                Err(err) => {
                    cache.abandon(fp);
                    TranscriptionMessage::Failed(err)
                }
            },
        };
        let _ = tx.send(message);
    });
    TranscriptionJob {
        receiver: rx,
        started_at,
        mode,
    }
}

fn run_transcription(
    transcriber: &Arc<Mutex<Transcriber>>,
    pcm: &[i16],
    options: &DecodeOptions,
) -> Result<String, String> {
    let guard = transcriber
        .lock()
        .map_err(|_| "transcriber lock poisoned".to_string())?;
    guard
        .transcribe(pcm, options)
        .map_err(|err| format!("{err:#}"))
}

// ============================================================================
// Wake-word recognition
// ============================================================================

#[derive(Debug)]
pub enum WakeMessage {
    Detected(WakeMatch),
    NoMatch,
    Failed(String),
}

pub struct WakeJob {
    pub receiver: Receiver<WakeMessage>,
    pub started_at: Instant,
}

pub fn spawn_wake_job(
    transcriber: Arc<Mutex<Transcriber>>,
    pcm: Vec<i16>,
    options: DecodeOptions,
    sets: WakePhraseSets,
) -> WakeJob {
    let (tx, rx) = mpsc::channel();
    let started_at = Instant::now();
    thread::spawn(move || {
        let message = match run_transcription(&transcriber, &pcm, &options) {
            Ok(transcript) => match match_wake(&transcript, &sets) {
                Some(matched) => WakeMessage::Detected(matched),
                None => WakeMessage::NoMatch,
            },
            Err(err) => WakeMessage::Failed(err),
        };
        let _ = tx.send(message);
    });
    WakeJob {
        receiver: rx,
        started_at,
    }
}

// ============================================================================
// LLM streaming
// ============================================================================

#[derive(Debug)]
pub enum LlmMessage {
    Thinking(String),
    Chunk(String),
    Done(StreamOutcome),
    Failed(CoreError),
}

pub struct LlmJob {
    pub receiver: Receiver<LlmMessage>,
    pub started_at: Instant,
    pub mode: Mode,
}

pub fn spawn_llm_job(
    client: Arc<LlmClient>,
    request: LlmRequest,
    cancel: Arc<AtomicBool>,
    mode: Mode,
) -> LlmJob {
    let (tx, rx) = mpsc::channel();
    let started_at = Instant::now();
    thread::spawn(move || {
        let mut source = match client.stream_generate(&request) {
            Ok(source) => source,
            Err(err) => {
                let _ = tx.send(LlmMessage::Failed(err));
                return;
            }
        };
        let mut guard = RepetitionGuard::new(llm::seeds_for_model(&request.model_id));
        let stream_tx = tx.clone();
        let result = llm::run_stream(&mut source, &mut guard, &cancel, |event| {
            let message = match event {
                StreamEvent::Thinking(text) => LlmMessage::Thinking(text.clone()),
                StreamEvent::Response(text) => LlmMessage::Chunk(text.clone()),
            };
            let _ = stream_tx.send(message);
        });
        let _ = match result {
            Ok(outcome) => tx.send(LlmMessage::Done(outcome)),
            Err(err) => tx.send(LlmMessage::Failed(err)),
        };
    });
    LlmJob {
        receiver: rx,
        started_at,
        mode,
    }
}
