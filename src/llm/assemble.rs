//! Chunk concatenation and cleanup for the streamed response buffer.
//!
//! LLM tokens carry their own spacing most of the time, so the join rule
//! only inserts a space when the boundary clearly needs one: never inside
//! numbers, hyphenated words, mid-word splits, or before closing
//! punctuation.

/// Punctuation that attaches to the preceding word.
const NO_SPACE_BEFORE: [char; 7] = ['.', ',', ';', ':', '/', '(', ')'];

#[inline]
fn needs_joining_space(prev: char, next: char) -> bool {
    if prev.is_whitespace() || next.is_whitespace() {
        return false;
    }
    if prev.is_ascii_digit() && next.is_ascii_digit() {
        return false;
    }
    if prev == '-' || next == '-' {
        return false;
    }
    if NO_SPACE_BEFORE.contains(&next) {
        return false;
    }
    if prev.is_alphabetic() && next.is_alphabetic() {
        // Mid-word token split.
        return false;
    }
    true
}

/// Append a chunk to the running buffer, applying the join rule at the
/// single new boundary.
pub fn append_chunk(buffer: &mut String, chunk: &str) {
    if chunk.is_empty() {
        return;
    }
    if let (Some(prev), Some(next)) = (buffer.chars().last(), chunk.chars().next()) {
        if needs_joining_space(prev, next) {
            buffer.push(' ');
        }
    }
    buffer.push_str(chunk);
}

/// Collapse `word-word` and `word word` repeats (case-insensitive) to a
/// single `word`. Idempotent.
pub fn dedup_word_pairs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_word: Option<String> = None;
    let mut pending_sep = String::new();
    let mut current_word = String::new();

    let mut flush_word = |word: &mut String,
                          sep: &mut String,
                          last: &mut Option<String>,
                          out: &mut String| {
        if word.is_empty() {
            return;
        }
        let lowered = word.to_lowercase();
        let is_repeat = last
            .as_ref()
            .map(|prev| *prev == lowered && (sep == "-" || sep == " "))
            .unwrap_or(false);
        if is_repeat {
            word.clear();
            sep.clear();
            return;
        }
        out.push_str(sep);
        sep.clear();
        out.push_str(word);
        *last = Some(lowered);
        word.clear();
    };

    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '\'' {
            current_word.push(ch);
        } else {
            flush_word(
                &mut current_word,
                &mut pending_sep,
                &mut last_word,
                &mut out,
            );
            pending_sep.push(ch);
        }
    }
    flush_word(
        &mut current_word,
        &mut pending_sep,
        &mut last_word,
        &mut out,
    );
    out.push_str(&pending_sep);
    out
}

/// Turn inline ` - ` bullet separators into proper list line breaks.
pub fn normalize_bullets(text: &str) -> String {
    let mut out = text.replace(" - ", "\n- ");
    // A list that starts right after a sentence end may arrive without the
    // surrounding spaces once chunks are joined.
    out = out.replace(".- ", ".\n- ");
    out
}

/// Final-artifact cleanup: dedup repeats, normalize bullet breaks, trim.
pub fn clean_artifact(text: &str) -> String {
    let deduped = dedup_word_pairs(text);
    let bulleted = normalize_bullets(&deduped);
    bulleted.trim().to_string()
}
