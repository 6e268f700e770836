//! Newline escaping for the line-delimited transport.
//!
//! Stdout delivery is one logical message per line, so a payload that
//! contains `\n` or `\r` would be split (or silently swallowed) in transit.
//! Escaping turns them into literal two-character sequences; the backslash
//! itself is escaped first so the round trip is unambiguous for payloads
//! that already contain `\\n` as text.

/// Escape a payload for single-line transport.
pub fn escape_payload(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Invert [`escape_payload`]. Unknown escapes are preserved verbatim.
pub fn unescape_payload(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn escapes_newlines_to_literal_sequences() {
        assert_eq!(escape_payload("- A.\n"), "- A.\\n");
        assert_eq!(escape_payload("a\r\nb"), "a\\r\\nb");
    }

    #[test]
    fn round_trips_payloads_that_already_contain_escapes() {
        let raw = "literal \\n stays literal\nreal break";
        assert_eq!(unescape_payload(&escape_payload(raw)), raw);
    }

    #[test]
    fn unescape_preserves_unknown_sequences() {
        assert_eq!(unescape_payload("a\\tb"), "a\\tb");
        assert_eq!(unescape_payload("trailing\\"), "trailing\\");
    }

    #[test]
    fn escaped_output_never_spans_lines() {
        let escaped = escape_payload("multi\nline\rpayload");
        assert!(!escaped.contains('\n'));
        assert!(!escaped.contains('\r'));
    }

    proptest! {
        #[test]
        fn escape_unescape_round_trip(raw in "\\PC*") {
            prop_assert_eq!(unescape_payload(&escape_payload(&raw)), raw);
        }

        #[test]
        fn escape_unescape_round_trip_with_breaks(
            parts in proptest::collection::vec("[a-zA-Z\"'\\\\中文 ]{0,8}", 1..6)
        ) {
            let raw = parts.join("\n");
            prop_assert_eq!(unescape_payload(&escape_payload(&raw)), raw);
        }
    }
}
