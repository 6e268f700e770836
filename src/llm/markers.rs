//! Channel marker families for thinking/response demultiplexing.
//!
//! Each supported model family wraps its reasoning in a distinct marker
//! tuple. The set is closed: adding a family means adding a row here, and
//! nothing else changes in the parser.

/// Marker tuple for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerFamily {
    pub name: &'static str,
    /// Opens the thinking block.
    pub open: &'static str,
    /// Closes the thinking block.
    pub close: &'static str,
    /// Optional preamble before the response channel; stripped at the
    /// thinking→response boundary or at the start of the response.
    pub final_preamble: Option<&'static str>,
}

pub const THINK_TAG: MarkerFamily = MarkerFamily {
    name: "think_tag",
    open: "<think>",
    close: "</think>",
    final_preamble: None,
};

pub const CJK_THINK_TAG: MarkerFamily = MarkerFamily {
    name: "cjk_think_tag",
    open: "<思考过程>",
    close: "</思考过程>",
    final_preamble: None,
};

pub const ANALYSIS_CHANNEL: MarkerFamily = MarkerFamily {
    name: "analysis_channel",
    open: "<|channel|>analysis<|message|>",
    close: "<|end|>",
    final_preamble: Some("<|start|>assistant<|channel|>final<|message|>"),
};

const FAMILIES: [MarkerFamily; 3] = [THINK_TAG, CJK_THINK_TAG, ANALYSIS_CHANNEL];

pub fn families() -> &'static [MarkerFamily] {
    &FAMILIES
}

/// Longest marker across all families; bounds the parser's tail buffer.
pub fn longest_marker_len() -> usize {
    FAMILIES
        .iter()
        .flat_map(|family| {
            [
                family.open.len(),
                family.close.len(),
                family.final_preamble.map(str::len).unwrap_or(0),
            ]
        })
        .max()
        .unwrap_or(0)
}

/// True when the chunk is exactly one raw marker and should never be
/// streamed to the UI.
pub fn is_raw_marker(chunk: &str) -> bool {
    FAMILIES.iter().any(|family| {
        chunk == family.open
            || chunk == family.close
            || family.final_preamble == Some(chunk)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn longest_marker_is_the_final_channel_preamble() {
        assert_eq!(
            longest_marker_len(),
            "<|start|>assistant<|channel|>final<|message|>".len()
        );
    }

    #[rstest]
    #[case("<think>")]
    #[case("</think>")]
    #[case("<思考过程>")]
    #[case("</思考过程>")]
    #[case("<|channel|>analysis<|message|>")]
    #[case("<|end|>")]
    #[case("<|start|>assistant<|channel|>final<|message|>")]
    fn raw_markers_are_recognized(#[case] chunk: &str) {
        assert!(is_raw_marker(chunk));
    }

    #[rstest]
    #[case("<think")]
    #[case("think>")]
    #[case("hello")]
    #[case("<think> extra")]
    fn partial_or_mixed_chunks_are_not_raw_markers(#[case] chunk: &str) {
        assert!(!is_raw_marker(chunk));
    }
}
