//! Streaming demultiplexer for thinking and response channels.
//!
//! Tokens arrive in arbitrary slices, so a marker may span two chunks. The
//! parser keeps a tail buffer holding any unresolved marker prefix and
//! re-prepends it to the next chunk; the tail never exceeds the longest
//! marker, which bounds parser memory regardless of stream length.

use super::markers::{families, longest_marker_len, MarkerFamily};

/// Which channel the parser is currently routing to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Pre,
    Thinking,
    Response,
}

/// Channel-routed text produced from a fed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Thinking(String),
    Response(String),
}

/// Incremental parser state. Created on LLM invocation, destroyed on
/// stream end or cancel.
pub struct StreamParser {
    section: Section,
    family: Option<&'static MarkerFamily>,
    tail: String,
    expect_final_preamble: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            section: Section::Pre,
            family: None,
            tail: String::new(),
            expect_final_preamble: false,
        }
    }

    pub fn section(&self) -> Section {
        self.section
    }

    /// Feed one chunk, returning the channel-routed text it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut buf = std::mem::take(&mut self.tail);
        buf.push_str(chunk);
        let mut events = Vec::new();

        loop {
            match self.section {
                Section::Pre => {
                    if !self.step_pre(&mut buf, &mut events) {
                        break;
                    }
                }
                Section::Thinking => {
                    if !self.step_thinking(&mut buf, &mut events) {
                        break;
                    }
                }
                Section::Response => {
                    if !self.step_response(&mut buf, &mut events) {
                        break;
                    }
                }
            }
        }
        debug_assert!(self.tail.len() <= longest_marker_len());
        events
    }

    /// Flush any held tail at end of stream. A held prefix that never grew
    /// into a marker was ordinary text after all.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let tail = std::mem::take(&mut self.tail);
        if tail.is_empty() {
            return Vec::new();
        }
        match self.section {
            Section::Thinking => vec![StreamEvent::Thinking(tail)],
            Section::Pre | Section::Response => {
                if tail.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![StreamEvent::Response(tail)]
                }
            }
        }
    }

    /// Returns `true` when the caller should loop again on the remaining buffer.
    fn step_pre(&mut self, buf: &mut String, events: &mut Vec<StreamEvent>) -> bool {
        let mut earliest: Option<(usize, &'static MarkerFamily, bool)> = None;
        for family in families() {
            if let Some(idx) = buf.find(family.open) {
                if earliest.map_or(true, |(best, _, _)| idx < best) {
                    earliest = Some((idx, family, false));
                }
            }
            if let Some(preamble) = family.final_preamble {
                if let Some(idx) = buf.find(preamble) {
                    if earliest.map_or(true, |(best, _, _)| idx < best) {
                        earliest = Some((idx, family, true));
                    }
                }
            }
        }

        if let Some((idx, family, is_preamble)) = earliest {
            let before = &buf[..idx];
            if !before.trim().is_empty() {
                events.push(StreamEvent::Response(before.to_string()));
            }
            let marker = if is_preamble {
                family.final_preamble.unwrap_or(family.open)
            } else {
                family.open
            };
            *buf = buf[idx + marker.len()..].to_string();
            self.family = Some(family);
            self.section = if is_preamble {
                Section::Response
            } else {
                Section::Thinking
            };
            return true;
        }

        let mut candidates: Vec<&str> = Vec::new();
        for family in families() {
            candidates.push(family.open);
            if let Some(preamble) = family.final_preamble {
                candidates.push(preamble);
            }
        }
        let held = held_prefix_len(buf, &candidates);
        let emit = &buf[..buf.len() - held];
        if !emit.is_empty() {
            // Leading whitespace before a possible thinking block carries no
            // content; anything else means this stream has no thinking
            // section and the parser commits to the response channel.
            if !emit.trim().is_empty() {
                events.push(StreamEvent::Response(emit.to_string()));
                self.section = Section::Response;
            }
        }
        self.tail = buf[buf.len() - held..].to_string();
        buf.clear();
        false
    }

    fn step_thinking(&mut self, buf: &mut String, events: &mut Vec<StreamEvent>) -> bool {
        let family = self
            .family
            .expect("thinking section always has an active family");
        if let Some(idx) = buf.find(family.close) {
            if idx > 0 {
                events.push(StreamEvent::Thinking(buf[..idx].to_string()));
            }
            *buf = buf[idx + family.close.len()..].to_string();
            self.section = Section::Response;
            self.expect_final_preamble = family.final_preamble.is_some();
            return true;
        }
        let held = held_prefix_len(buf, &[family.close]);
        let emit = &buf[..buf.len() - held];
        if !emit.is_empty() {
            events.push(StreamEvent::Thinking(emit.to_string()));
        }
        self.tail = buf[buf.len() - held..].to_string();
        buf.clear();
        false
    }

    fn step_response(&mut self, buf: &mut String, events: &mut Vec<StreamEvent>) -> bool {
        if self.expect_final_preamble {
            if let Some(preamble) = self.family.and_then(|family| family.final_preamble) {
                let trimmed = buf.trim_start().to_string();
                if trimmed.is_empty() || preamble.starts_with(trimmed.as_str()) {
                    // Could still grow into the preamble; wait for more.
                    // Boundary whitespace is dropped either way.
                    self.tail = trimmed;
                    buf.clear();
                    return false;
                }
                match trimmed.strip_prefix(preamble) {
                    Some(rest) => *buf = rest.to_string(),
                    None => *buf = trimmed,
                }
            }
            self.expect_final_preamble = false;
            return true;
        }

        // Stray markers of the active family are stripped from the
        // response so they never reach the UI or the final artifact.
        let drop_markers: Vec<&str> = self
            .family
            .map(|family| {
                let mut markers = vec![family.close];
                if let Some(preamble) = family.final_preamble {
                    markers.push(preamble);
                }
                markers
            })
            .unwrap_or_default();

        for marker in &drop_markers {
            if let Some(idx) = buf.find(marker) {
                if idx > 0 {
                    events.push(StreamEvent::Response(buf[..idx].to_string()));
                }
                *buf = buf[idx + marker.len()..].to_string();
                return true;
            }
        }

        let held = held_prefix_len(buf, &drop_markers);
        let emit = &buf[..buf.len() - held];
        if !emit.is_empty() {
            events.push(StreamEvent::Response(emit.to_string()));
        }
        self.tail = buf[buf.len() - held..].to_string();
        buf.clear();
        false
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest proper prefix of any marker that the buffer currently ends
/// with. Marker prefixes are taken at char boundaries so multi-byte
/// markers split safely.
fn held_prefix_len(buf: &str, markers: &[&str]) -> usize {
    let mut best = 0;
    for marker in markers {
        for (boundary, _) in marker.char_indices().skip(1) {
            if boundary <= buf.len() && boundary > best && buf.ends_with(&marker[..boundary]) {
                best = boundary;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn feed_all(parser: &mut StreamParser, chunks: &[&str]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        events
    }

    fn thinking_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Thinking(text) => Some(text.as_str()),
                StreamEvent::Response(_) => None,
            })
            .collect()
    }

    fn response_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Response(text) => Some(text.as_str()),
                StreamEvent::Thinking(_) => None,
            })
            .collect()
    }

    #[rstest]
    #[case("<think>", "</think>")]
    #[case("<思考过程>", "</思考过程>")]
    fn single_thinking_region_splits_cleanly(#[case] open: &str, #[case] close: &str) {
        let mut parser = StreamParser::new();
        let stream = format!("{open}step one, step two{close}final answer");
        let events = feed_all(&mut parser, &[&stream]);
        assert_eq!(thinking_text(&events), "step one, step two");
        assert_eq!(response_text(&events), "final answer");
    }

    #[test]
    fn markers_spanning_chunk_boundaries_are_reassembled() {
        let mut parser = StreamParser::new();
        let events = feed_all(
            &mut parser,
            &["<thi", "nk>reason", "ing</th", "ink>answer"],
        );
        assert_eq!(thinking_text(&events), "reasoning");
        assert_eq!(response_text(&events), "answer");
    }

    #[test]
    fn cjk_marker_split_at_multibyte_boundary_is_safe() {
        let open = "<思考过程>";
        let mut parser = StreamParser::new();
        let events = feed_all(
            &mut parser,
            &["<思考", "过程>深呼吸</思考过", "程>答案"],
        );
        assert_eq!(thinking_text(&events), "深呼吸");
        assert_eq!(response_text(&events), "答案");
        assert!(!response_text(&events).contains(open));
    }

    #[test]
    fn channel_tag_stream_strips_all_markers() {
        let mut parser = StreamParser::new();
        let events = feed_all(
            &mut parser,
            &["<|channel|>analysis<|message|>Thinking A.<|end|><|start|>assistant<|channel|>final<|message|>- Result.\n"],
        );
        assert_eq!(thinking_text(&events), "Thinking A.");
        assert_eq!(response_text(&events), "- Result.\n");
    }

    #[test]
    fn final_preamble_split_across_chunks_is_stripped() {
        let mut parser = StreamParser::new();
        let events = feed_all(
            &mut parser,
            &[
                "<|channel|>analysis<|message|>hm<|end|>",
                "<|start|>assistant",
                "<|channel|>final<|message|>done",
            ],
        );
        assert_eq!(thinking_text(&events), "hm");
        assert_eq!(response_text(&events), "done");
    }

    #[test]
    fn chunk_equal_to_raw_marker_is_filtered_not_streamed() {
        let mut parser = StreamParser::new();
        assert!(parser.feed("<think>").is_empty());
        assert_eq!(parser.feed("a"), vec![StreamEvent::Thinking("a".into())]);
        assert!(parser.feed("</think>").is_empty());
        assert_eq!(parser.feed("b"), vec![StreamEvent::Response("b".into())]);
    }

    #[test]
    fn stream_without_thinking_passes_through() {
        let mut parser = StreamParser::new();
        let events = feed_all(&mut parser, &["Plain ", "answer ", "text."]);
        assert_eq!(thinking_text(&events), "");
        assert_eq!(response_text(&events), "Plain answer text.");
    }

    #[test]
    fn leading_whitespace_before_thinking_is_dropped() {
        let mut parser = StreamParser::new();
        let events = feed_all(&mut parser, &["\n\n", "<think>x</think>y"]);
        assert_eq!(thinking_text(&events), "x");
        assert_eq!(response_text(&events), "y");
    }

    #[test]
    fn held_tail_that_never_becomes_a_marker_is_flushed_as_text() {
        let mut parser = StreamParser::new();
        let events = feed_all(&mut parser, &["answer <th"]);
        assert_eq!(response_text(&events), "answer <th");
    }

    #[test]
    fn tail_buffer_stays_within_longest_marker_bound() {
        let mut parser = StreamParser::new();
        for _ in 0..50 {
            let _ = parser.feed("<|start|>assistant<|channel|>fina");
            assert!(parser.tail.len() <= super::longest_marker_len());
            let _ = parser.feed("continue ");
        }
    }

    #[test]
    fn response_only_preamble_at_start_is_stripped() {
        let mut parser = StreamParser::new();
        let events = feed_all(
            &mut parser,
            &["<|start|>assistant<|channel|>final<|message|>Hello"],
        );
        assert_eq!(response_text(&events), "Hello");
        assert_eq!(thinking_text(&events), "");
    }

    #[test]
    fn held_prefix_len_respects_char_boundaries() {
        assert_eq!(held_prefix_len("abc<思", &["<思考过程>"]), "<思".len());
        assert_eq!(held_prefix_len("abc", &["<think>"]), 0);
        assert_eq!(held_prefix_len("x<think", &["<think>"]), "<think".len());
    }
}
