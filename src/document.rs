//! Document model: input, canonical text, chunks, and the sentence index.

use serde::{Deserialize, Serialize};

use crate::annotation::Span;

/// Source format of a submitted document.
///
/// Format-specific ingestion lives outside the core; the core receives raw
/// text plus the format tag for provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Html,
    Pdf,
    Word,
}

impl Default for DocumentFormat {
    fn default() -> Self {
        DocumentFormat::PlainText
    }
}

/// A document submitted for enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInput {
    /// Raw text content (already decoded by the ingestion collaborator).
    pub content: String,
    /// Source format tag.
    #[serde(default)]
    pub format: DocumentFormat,
    /// Original filename, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl DocumentInput {
    /// Create a plain-text input.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            format: DocumentFormat::PlainText,
            filename: None,
        }
    }
}

/// A chunk of the normalized text handed to per-chunk stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Position of the chunk in the normalized text.
    pub span: Span,
    /// Characters shared with the following chunk.
    pub overlap_with_next: usize,
    /// Zero-based chunk index.
    pub index: usize,
}

impl TextChunk {
    /// The chunk's text.
    #[must_use]
    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        self.span.slice(text)
    }
}

/// Offset-sorted sentence spans with positional lookup.
///
/// Built once during normalization and shared read-only by dependency
/// extraction and context windowing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentenceIndex {
    sentences: Vec<Span>,
}

impl SentenceIndex {
    /// Build from already-sorted, non-overlapping sentence spans.
    #[must_use]
    pub fn new(sentences: Vec<Span>) -> Self {
        debug_assert!(sentences.windows(2).all(|w| w[0].end <= w[1].start));
        Self { sentences }
    }

    /// Number of sentences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    /// True when the document has no sentences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// All sentence spans in order.
    #[must_use]
    pub fn spans(&self) -> &[Span] {
        &self.sentences
    }

    /// Index of the sentence containing the given offset, if any.
    #[must_use]
    pub fn containing(&self, offset: usize) -> Option<usize> {
        match self
            .sentences
            .binary_search_by(|s| {
                if offset < s.start {
                    std::cmp::Ordering::Greater
                } else if offset >= s.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            }) {
            Ok(i) => Some(i),
            Err(_) => None,
        }
    }

    /// Index of the sentence containing the span's start, falling back to
    /// the nearest preceding sentence.
    #[must_use]
    pub fn sentence_of(&self, span: &Span) -> Option<usize> {
        if let Some(i) = self.containing(span.start) {
            return Some(i);
        }
        self.sentences
            .iter()
            .rposition(|s| s.start <= span.start)
    }

    /// Span of the sentence at `index`.
    #[must_use]
    pub fn span(&self, index: usize) -> Option<Span> {
        self.sentences.get(index).copied()
    }

    /// Merged span covering `before` sentences before and `after` after the
    /// sentence at `index`. Used for context windows.
    #[must_use]
    pub fn window(&self, index: usize, before: usize, after: usize) -> Option<Span> {
        if self.sentences.is_empty() || index >= self.sentences.len() {
            return None;
        }
        let lo = index.saturating_sub(before);
        let hi = (index + after).min(self.sentences.len() - 1);
        Some(Span::new(self.sentences[lo].start, self.sentences[hi].end))
    }
}

/// Immutable normalized view of a document: the canonical text, its chunked
/// view, the sentence index, and a content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalText {
    /// NFKC-normalized, whitespace-collapsed text. All spans index into
    /// this string.
    pub text: String,
    /// Ordered chunked view with overlap.
    pub chunks: Vec<TextChunk>,
    /// Sentence boundaries.
    pub sentences: SentenceIndex,
    /// Lowercase hex SHA-256 of `text`.
    pub sha256: String,
    /// Source format tag carried from the input.
    pub source_format: DocumentFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> SentenceIndex {
        SentenceIndex::new(vec![
            Span::new(0, 10),
            Span::new(11, 25),
            Span::new(26, 40),
        ])
    }

    #[test]
    fn containing_finds_sentence() {
        let idx = index();
        assert_eq!(idx.containing(0), Some(0));
        assert_eq!(idx.containing(9), Some(0));
        assert_eq!(idx.containing(10), None); // gap between sentences
        assert_eq!(idx.containing(15), Some(1));
        assert_eq!(idx.containing(39), Some(2));
        assert_eq!(idx.containing(40), None);
    }

    #[test]
    fn window_merges_neighbors() {
        let idx = index();
        assert_eq!(idx.window(1, 1, 1), Some(Span::new(0, 40)));
        assert_eq!(idx.window(0, 1, 0), Some(Span::new(0, 10)));
        assert_eq!(idx.window(2, 0, 5), Some(Span::new(26, 40)));
        assert_eq!(idx.window(3, 1, 1), None);
    }

    #[test]
    fn sentence_of_falls_back_to_preceding() {
        let idx = index();
        // Span starting inside the gap maps to the preceding sentence.
        assert_eq!(idx.sentence_of(&Span::new(10, 12)), Some(0));
        assert_eq!(idx.sentence_of(&Span::new(30, 35)), Some(2));
    }
}
