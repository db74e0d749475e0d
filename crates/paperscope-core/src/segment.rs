//! Text segmentation and query tokenization.
//!
//! Segments are the unit shared by both index backends: non-overlapping
//! byte ranges of the source text, split on natural boundaries with a
//! bounded size. Offsets are byte offsets at UTF-8 boundaries, and every
//! consumer (FTS segment encoding, vector entry metadata, highlighting)
//! uses the same convention.

use text_splitter::{Characters, TextSplitter};

/// Upper bound on segment size, in characters.
const MAX_SEGMENT_SIZE: usize = 512;

/// Tokens that collide with the FTS query grammar and are never indexed
/// or searched.
const RESERVED_TOKENS: [&str; 4] = ["near", "and", "or", "not"];

/// A half-open byte range `[start, end)` within a source text, plus the
/// text slice itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

pub struct Segmentation {
    splitter: TextSplitter<Characters>,
}

impl Default for Segmentation {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmentation {
    pub fn new() -> Self {
        Self {
            splitter: TextSplitter::new(MAX_SEGMENT_SIZE),
        }
    }

    /// Split `text` into bounded segments on sentence/whitespace
    /// boundaries. Whitespace-only stretches produce no segment.
    pub fn split(&self, text: &str) -> Vec<Segment> {
        self.splitter
            .chunk_indices(text)
            .filter(|(_, chunk)| !chunk.trim().is_empty())
            .map(|(start, chunk)| Segment {
                start,
                end: start + chunk.len(),
                text: chunk.to_string(),
            })
            .collect()
    }

    /// Keyword list for a user query, produced with the same tokenizer the
    /// lexical index uses. Surfaced to the caller and to the highlighter.
    pub fn to_keywords(&self, query: &str) -> Vec<String> {
        tokenize(query)
    }
}

/// Characters collapsed to a separator before tokenizing: a small
/// punctuation class plus C0/C1 control characters.
fn is_separator(c: char) -> bool {
    matches!(
        c,
        '-' | '+' | ':' | '!' | '"' | '\'' | '{' | '}' | ',' | '.'
    ) || matches!(c, '\u{00}'..='\u{1f}' | '\u{7f}'..='\u{9f}')
        || c == ' '
}

/// Tokenize text for the lexical index: collapse separators, lowercase,
/// drop empties and the reserved FTS grammar words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(is_separator)
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .filter(|token| !RESERVED_TOKENS.contains(&token.as_str()))
        .collect()
}
