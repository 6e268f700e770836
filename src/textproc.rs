//! Transcript post-processing applied before delivery.

use regex::RegexBuilder;

use crate::vocab::VocabularyStore;

/// Remove configured filler words from a transcript.
///
/// Matching is whole-word and case-insensitive; surrounding whitespace is
/// collapsed so the result reads naturally. An empty filler list returns
/// the input unchanged.
pub fn filter_filler_words(text: &str, fillers: &[String]) -> String {
    let mut out = text.to_string();
    for filler in fillers {
        let trimmed = filler.trim();
        if trimmed.is_empty() {
            continue;
        }
        let pattern = format!(r"\b{}\b[,]?\s*", regex::escape(trimmed));
        let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
            continue;
        };
        out = re.replace_all(&out, "").into_owned();
    }
    collapse_spaces(&out)
}

/// Apply spoken→written vocabulary replacements.
pub fn apply_vocabulary(text: &str, store: &VocabularyStore) -> String {
    let mut out = text.to_string();
    for entry in store.entries() {
        let spoken = entry.spoken.trim();
        if spoken.is_empty() {
            continue;
        }
        let pattern = format!(r"\b{}\b", regex::escape(spoken));
        let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
            continue;
        };
        out = re.replace_all(&out, entry.written.as_str()).into_owned();
    }
    out
}

fn collapse_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_was_space = false;
    for ch in text.chars() {
        if ch == ' ' {
            if !previous_was_space {
                out.push(ch);
            }
            previous_was_space = true;
        } else {
            previous_was_space = ch == '\n';
            out.push(ch);
        }
    }
    // Collapsing can leave a dangling space before punctuation.
    let out = out.replace(" .", ".").replace(" ,", ",");
    out.trim().to_string()
}
