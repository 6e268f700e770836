//! Contract tests for the transport boundary and the streaming engine,
//! exercised through the public crate API.

use std::sync::atomic::AtomicBool;

use scribecore::config::{Mode, ModeTable};
use scribecore::ipc::escape::{escape_payload, unescape_payload};
use scribecore::ipc::protocol::{
    ArtifactKind, InboundCommand, OutboundMessage, ProofStreamKind, StatusColor,
};
use scribecore::llm::{run_stream, RepetitionGuard, StreamEvent, TokenSource};
use scribecore::wake::{match_wake, WakePhraseSets};
use scribecore::CoreError;

struct ScriptedSource(Vec<String>);

impl TokenSource for ScriptedSource {
    fn next_token(&mut self) -> Result<Option<String>, CoreError> {
        if self.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.0.remove(0)))
        }
    }
}

fn stream(tokens: &[&str]) -> (scribecore::llm::StreamOutcome, Vec<String>) {
    let mut source = ScriptedSource(tokens.iter().map(|t| t.to_string()).collect());
    let mut guard = RepetitionGuard::with_default_seeds();
    let cancel = AtomicBool::new(false);
    let mut wire_lines = Vec::new();
    let outcome = run_stream(&mut source, &mut guard, &cancel, |event| {
        let (kind, payload) = match event {
            StreamEvent::Thinking(text) => (ProofStreamKind::Thinking, text.clone()),
            StreamEvent::Response(text) => (ProofStreamKind::Chunk, text.clone()),
        };
        wire_lines.push(
            OutboundMessage::ProofStream {
                color: StatusColor::Blue,
                kind,
                payload,
            }
            .encode(),
        );
    })
    .expect("stream completes");
    (outcome, wire_lines)
}

#[test]
fn newline_fidelity_end_to_end() {
    let (outcome, wire_lines) = stream(&["- A.\n", "- B.\n"]);

    assert_eq!(
        wire_lines,
        vec![
            "STATUS:blue:PROOF_STREAM:chunk:- A.\\n",
            "STATUS:blue:PROOF_STREAM:chunk:- B.\\n",
        ]
    );

    // The UI recovers the exact chunk after unescaping.
    for (line, original) in wire_lines.iter().zip(["- A.\n", "- B.\n"]) {
        let payload = line
            .strip_prefix("STATUS:blue:PROOF_STREAM:chunk:")
            .expect("chunk line");
        assert_eq!(unescape_payload(payload), original);
    }

    assert_eq!(outcome.response, "- A.\n- B.");
}

#[test]
fn escape_round_trip_covers_quotes_unicode_and_mixed_content() {
    let samples = [
        "plain",
        "line\nbreak",
        "回车\r\n换行",
        "quote \" and ' inside",
        "tabs\tstay\tliteral",
        "backslash \\n literal and real\nbreak",
    ];
    for sample in samples {
        assert_eq!(unescape_payload(&escape_payload(sample)), sample);
        assert!(!escape_payload(sample).contains('\n'));
    }
}

#[test]
fn chunk_boundary_join_produces_hyphenated_compound() {
    let (outcome, _) = stream(&["21", "-year", "-old"]);
    assert_eq!(outcome.response, "21-year-old");
}

#[test]
fn loop_detection_terminates_after_three_occurrences() {
    let (outcome, _) = stream(&[
        "The correct term is X. ",
        "The correct term is X. ",
        "The correct term is X. ",
        "The correct term is X. ",
    ]);
    assert!(outcome.stopped_by_repetition);
    assert_eq!(outcome.response.matches("The correct term is").count(), 3);
}

#[test]
fn channel_tag_model_stream_keeps_markers_off_the_wire() {
    let (outcome, wire_lines) = stream(&[
        "<|channel|>analysis<|message|>Thinking A.<|end|><|start|>assistant<|channel|>final<|message|>- Result.\n",
    ]);
    assert_eq!(outcome.thinking, "Thinking A.");
    assert_eq!(outcome.response, "- Result.");
    for line in wire_lines {
        assert!(!line.contains("<|"), "marker leaked onto the wire: {line}");
    }
}

#[test]
fn every_outbound_line_uses_a_known_prefix() {
    let lines = [
        OutboundMessage::BackendReady.encode(),
        OutboundMessage::GetConfig.encode(),
        OutboundMessage::Models("{}".to_string()).encode(),
        OutboundMessage::ModelSelected {
            mode: Mode::Letter,
            model_id: "qwen3:4b".to_string(),
        }
        .encode(),
        OutboundMessage::State("{}".to_string()).encode(),
        OutboundMessage::Status {
            color: StatusColor::Red,
            text: "mic".to_string(),
        }
        .encode(),
        OutboundMessage::AudioAmp(3).encode(),
        OutboundMessage::FinalTranscript("hi".to_string()).encode(),
        OutboundMessage::DictationPreview("hi".to_string()).encode(),
        OutboundMessage::Transcription {
            kind: ArtifactKind::Letter,
            text: "hi".to_string(),
        }
        .encode(),
        OutboundMessage::TranscriptionError("x".to_string()).encode(),
        OutboundMessage::VocabResponse {
            id: "1".to_string(),
            payload: "{}".to_string(),
        }
        .encode(),
        OutboundMessage::Error("x".to_string()).encode(),
    ];
    let prefixes = [
        "PYTHON_BACKEND_READY",
        "GET_CONFIG",
        "MODELS:",
        "MODEL_SELECTED:",
        "STATE:",
        "STATUS:",
        "AUDIO_AMP:",
        "FINAL_TRANSCRIPT:",
        "DICTATION_PREVIEW:",
        "TRANSCRIPTION:",
        "VOCAB_RESPONSE:",
        "ERROR:",
    ];
    for line in &lines {
        assert!(
            prefixes.iter().any(|prefix| line.starts_with(prefix)),
            "unexpected line {line}"
        );
        assert!(!line.contains('\n'));
    }
}

#[test]
fn inbound_commands_parse_the_documented_set() {
    let cases = [
        ("start_dictate", InboundCommand::StartDictate),
        ("start_proofread", InboundCommand::StartProofread),
        ("start_letter", InboundCommand::StartLetter),
        ("STOP_DICTATION", InboundCommand::StopDictation),
        ("ABORT_DICTATION", InboundCommand::AbortDictation),
        ("TOGGLE_ACTIVE", InboundCommand::ToggleActive),
        ("RESTART", InboundCommand::Restart),
        ("SHUTDOWN", InboundCommand::Shutdown),
        ("MODELS_REQUEST", InboundCommand::ModelsRequest),
    ];
    for (line, expected) in cases {
        assert_eq!(InboundCommand::parse(line).unwrap(), expected);
    }
}

#[test]
fn wake_precedence_is_proofread_over_letter_over_dictate() {
    let mut modes = ModeTable::default();
    modes.dictate.wake_phrases = vec!["go".to_string()];
    modes.letter.wake_phrases = vec!["go".to_string()];
    modes.proofread.wake_phrases = vec!["go".to_string()];
    let sets = WakePhraseSets::from_modes(&modes);
    assert_eq!(match_wake("go", &sets).unwrap().mode, Mode::Proofread);
}
