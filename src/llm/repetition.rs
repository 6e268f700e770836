//! Runaway-loop detection over the response stream.
//!
//! Small local models occasionally lock onto a phrase and repeat it until
//! the token budget runs out. The guard watches a fixed window of recent
//! response text for known seed phrases and trips once a seed shows up
//! `MAX_REPETITIONS` times, letting the engine end the stream early with
//! whatever has been accumulated.

/// Recent-response window size in characters.
pub const REPETITION_WINDOW_CHARS: usize = 100;

/// Seed occurrences that terminate the stream.
pub const MAX_REPETITIONS: usize = 3;

/// Default seeds applied to every model family.
pub const DEFAULT_SEED_PHRASES: &[&str] = &["The correct term is", "I apologize, but"];

/// Ring of recent response characters plus the seed phrases to watch.
pub struct RepetitionGuard {
    window: Vec<char>,
    seeds: Vec<String>,
    max_repetitions: usize,
}

impl RepetitionGuard {
    pub fn new(seeds: Vec<String>) -> Self {
        Self {
            window: Vec::with_capacity(REPETITION_WINDOW_CHARS),
            seeds,
            max_repetitions: MAX_REPETITIONS,
        }
    }

    pub fn with_default_seeds() -> Self {
        Self::new(
            DEFAULT_SEED_PHRASES
                .iter()
                .map(|seed| seed.to_string())
                .collect(),
        )
    }

    /// Feed response text. Returns `true` when the loop threshold is hit.
    pub fn push_text(&mut self, text: &str) -> bool {
        for ch in text.chars() {
            self.window.push(ch);
        }
        let overflow = self.window.len().saturating_sub(REPETITION_WINDOW_CHARS);
        if overflow > 0 {
            self.window.drain(..overflow);
        }
        self.tripped()
    }

    fn tripped(&self) -> bool {
        if self.seeds.is_empty() {
            return false;
        }
        let haystack: String = self.window.iter().collect();
        self.seeds
            .iter()
            .filter(|seed| !seed.is_empty())
            .any(|seed| count_occurrences(&haystack, seed) >= self.max_repetitions)
    }
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut rest = haystack;
    while let Some(idx) = rest.find(needle) {
        count += 1;
        rest = &rest[idx + needle.len()..];
    }
    count
}
