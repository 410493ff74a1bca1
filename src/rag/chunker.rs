use std::sync::Arc;

use super::tokenizer::{RegexTokenizer, Tokenizer};
use super::types::{compute_mdhash_id, TextChunk};

/// Default window size in tokens.
pub const DEFAULT_CHUNK_TOKEN_SIZE: usize = 1024;
/// Default overlap between consecutive windows in tokens.
pub const DEFAULT_CHUNK_OVERLAP_TOKEN_SIZE: usize = 128;

/// Token-window chunker with overlap.
#[derive(Clone)]
pub struct Chunker {
    size: usize,
    overlap: usize,
    tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("size", &self.size)
            .field("overlap", &self.overlap)
            .finish()
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_TOKEN_SIZE, DEFAULT_CHUNK_OVERLAP_TOKEN_SIZE)
    }
}

impl Chunker {
    /// Create a new chunker using the default tokenizer.
    pub fn new(size: usize, overlap: usize) -> Self {
        Self::with_tokenizer(size, overlap, Arc::new(RegexTokenizer::new()))
    }

    /// Create with a custom tokenizer.
    pub fn with_tokenizer(size: usize, overlap: usize, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            size: size.max(1),
            overlap: overlap.min(size.saturating_sub(1)),
            tokenizer,
        }
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Split a document into overlapping, content-addressed chunks.
    ///
    /// Each chunk is the slice of `content` spanning its tokens, so the
    /// original spacing and punctuation survive.
    pub fn chunk(&self, content: &str, full_doc_id: &str) -> Vec<TextChunk> {
        let spans = self.tokenizer.encode(content);
        if spans.is_empty() {
            return Vec::new();
        }

        let step = self.size.saturating_sub(self.overlap).max(1);
        let mut chunks = Vec::new();
        let mut idx = 0;

        while idx < spans.len() {
            let end = (idx + self.size).min(spans.len());
            let text = content[spans[idx].start..spans[end - 1].end].trim();
            chunks.push(TextChunk {
                id: compute_mdhash_id(text, "chunk-"),
                content: text.to_string(),
                tokens: end - idx,
                chunk_order_index: chunks.len(),
                full_doc_id: full_doc_id.to_string(),
            });

            if end == spans.len() {
                break;
            }
            idx += step;
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_respects_overlap() {
        let chunker = Chunker::new(4, 1);
        let text = "one two three four five six seven";
        let chunks = chunker.chunk(text, "doc-1");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "one two three four");
        assert_eq!(chunks[1].content, "four five six seven");
        assert_eq!(chunks[0].tokens, 4);
    }

    #[test]
    fn chunker_empty_text_returns_empty() {
        let chunker = Chunker::new(4, 1);
        assert!(chunker.chunk("", "doc").is_empty());
        assert!(chunker.chunk("   \t\n  ", "doc").is_empty());
    }

    #[test]
    fn chunker_single_word() {
        let chunker = Chunker::new(4, 1);
        let chunks = chunker.chunk("hello", "doc");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "hello");
        assert_eq!(chunks[0].tokens, 1);
        assert_eq!(chunks[0].chunk_order_index, 0);
    }

    #[test]
    fn chunker_no_overlap() {
        let chunker = Chunker::new(2, 0);
        let chunks = chunker.chunk("a b c d e f", "doc");
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["a b", "c d", "e f"]);
        let orders: Vec<usize> = chunks.iter().map(|c| c.chunk_order_index).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn chunker_large_overlap_is_clamped() {
        let chunker = Chunker::new(3, 10);
        let chunks = chunker.chunk("a b c d e f g", "doc");
        // overlap clamped to 2, step 1
        assert_eq!(chunks.len(), 5);
    }

    #[test]
    fn chunker_zero_size_uses_minimum() {
        let chunker = Chunker::new(0, 0);
        assert_eq!(chunker.chunk("word", "doc").len(), 1);
    }

    #[test]
    fn chunk_ids_are_content_addressed() {
        let chunker = Chunker::new(2, 0);
        let first = chunker.chunk("alpha beta alpha beta", "doc-a");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, first[1].id);
        assert!(first[0].id.starts_with("chunk-"));

        let other_doc = chunker.chunk("alpha beta", "doc-b");
        assert_eq!(other_doc[0].id, first[0].id);
        assert_eq!(other_doc[0].full_doc_id, "doc-b");
    }

    #[test]
    fn chunker_preserves_original_punctuation() {
        let chunker = Chunker::new(5, 0);
        let chunks = chunker.chunk("Apple Inc. hired Tim.", "doc");
        assert_eq!(chunks[0].content, "Apple Inc. hired Tim");
        assert_eq!(chunks[1].content, ".");
    }

    #[test]
    fn chunker_unicode_text() {
        let chunker = Chunker::new(3, 1);
        let text = "Привет мир тест";
        let chunks = chunker.chunk(text, "doc");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, text);
    }

    #[test]
    fn chunker_debug() {
        let chunker = Chunker::new(10, 2);
        let debug_str = format!("{:?}", chunker);
        assert!(debug_str.contains("Chunker"));
        assert!(debug_str.contains("10"));
    }
}
