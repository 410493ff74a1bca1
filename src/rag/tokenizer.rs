//! Token counting used for chunking, summary thresholds and context budgets.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\w+|[^\w\s]").expect("token regex is valid")
});

/// Splits text into tokens addressed by byte ranges of the original string.
pub trait Tokenizer: Send + Sync {
    /// Byte ranges of every token, in order.
    fn encode(&self, text: &str) -> Vec<Range<usize>>;

    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    /// Longest prefix of `text` holding at most `max_tokens` tokens.
    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        let spans = self.encode(text);
        if spans.len() <= max_tokens {
            return text;
        }
        match max_tokens.checked_sub(1).and_then(|last| spans.get(last)) {
            Some(last) => &text[..last.end],
            None => "",
        }
    }
}

/// Word runs and individual punctuation marks each count as one token.
///
/// Close enough to BPE counts for budgeting while staying dependency free
/// and deterministic across platforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexTokenizer;

impl RegexTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for RegexTokenizer {
    fn encode(&self, text: &str) -> Vec<Range<usize>> {
        TOKEN_RE.find_iter(text).map(|m| m.range()).collect()
    }

    fn count_tokens(&self, text: &str) -> usize {
        TOKEN_RE.find_iter(text).count()
    }
}
