//! Text normalization: NFKC folding, whitespace collapsing, legal-aware
//! sentence splitting, and overlap chunking.
//!
//! The output of [`normalize`] is immutable for the rest of the job: every
//! span in every downstream entity indexes into the canonical text produced
//! here.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::annotation::Span;
use crate::config::EnrichConfig;
use crate::document::{CanonicalText, DocumentInput, SentenceIndex, TextChunk};
use crate::error::{Error, Result};

static RUN_OF_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\S\n]+").expect("valid regex"));
static MANY_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static SPACE_AROUND_NEWLINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" *\n *").expect("valid regex"));

/// Abbreviations that end with a period but do not end a sentence.
/// Tuned for legal text: reporters, procedural abbreviations, honorifics.
const ABBREVIATIONS: &[&str] = &[
    "v", "vs", "no", "nos", "u.s.c", "c.f.r", "f", "f.2d", "f.3d", "f.4th", "u.s", "s.ct",
    "cir", "2d", "3d", "4th", "co", "corp", "inc", "ltd", "llc", "llp", "mr", "mrs", "ms",
    "dr", "hon", "jr", "sr", "esq", "jan", "feb", "mar", "apr", "jun", "jul", "aug", "sep",
    "sept", "oct", "nov", "dec", "art", "sec", "para", "et", "al", "etc", "e.g", "i.e",
    "dist", "div", "dep't", "dept", "stat", "rev", "supp", "ann",
];

/// Collapse whitespace the way the canonical text requires: runs of
/// non-newline whitespace become one space, three or more newlines become
/// two, spaces adjacent to newlines are removed, and the result is trimmed.
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    let text = RUN_OF_SPACES.replace_all(text, " ");
    let text = MANY_NEWLINES.replace_all(&text, "\n\n");
    let text = SPACE_AROUND_NEWLINE.replace_all(&text, "\n");
    text.trim().to_string()
}

/// NFKC-fold, lowercase, and whitespace-collapse a surface string.
///
/// This is the alignment key used to group discoveries from different
/// arms of the pipeline.
#[must_use]
pub fn normalize_surface(s: &str) -> String {
    let folded: String = s.nfkc().flat_map(char::to_lowercase).collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_abbreviation(text: &str, period_pos: usize) -> bool {
    // Walk back to the start of the token that the period terminates.
    let before = &text[..period_pos];
    let token_start = before
        .rfind(|c: char| c.is_whitespace() || c == '(' || c == '"')
        .map_or(0, |i| i + c_len(before, i));
    let token = &text[token_start..period_pos];
    if token.is_empty() {
        return false;
    }
    // Single capital letters ("John Q. Public") and numbered sections.
    if token.chars().count() == 1 && token.chars().all(|c| c.is_alphabetic()) {
        return true;
    }
    let lowered = token.to_lowercase();
    ABBREVIATIONS.contains(&lowered.as_str())
}

fn c_len(s: &str, byte_idx: usize) -> usize {
    s[byte_idx..].chars().next().map_or(1, char::len_utf8)
}

/// Split text into sentence spans without breaking at legal abbreviations.
///
/// A sentence ends at `.`, `!`, or `?` followed by whitespace and an
/// uppercase letter, an opening quote, or a digit, unless the period
/// terminates a known abbreviation. Newlines that end a paragraph also end
/// the sentence.
#[must_use]
pub fn split_sentences(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let boundary = match c {
            '!' | '?' => true,
            '.' => !is_abbreviation(text, i),
            '\n' => true,
            _ => false,
        };

        if boundary {
            // Consume trailing punctuation and closing quotes.
            let mut end = i + 1;
            while end < bytes.len() && matches!(bytes[end] as char, '"' | '\'' | ')' | '.') {
                end += 1;
            }
            // Require the next non-space char to plausibly start a sentence,
            // unless we are at a newline or end of text.
            let mut j = end;
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            let next_starts_sentence = j >= bytes.len()
                || c == '\n'
                || text[j..]
                    .chars()
                    .next()
                    .is_some_and(|n| n.is_uppercase() || n.is_numeric() || n == '"' || n == '(');

            if next_starts_sentence {
                let raw = Span::new(start, end.min(text.len()));
                let trimmed = trim_span(text, raw);
                if !trimmed.is_empty() {
                    spans.push(trimmed);
                }
                start = j;
                i = j;
                continue;
            }
        }
        i += c_len(text, i);
    }

    if start < text.len() {
        let trimmed = trim_span(text, Span::new(start, text.len()));
        if !trimmed.is_empty() {
            spans.push(trimmed);
        }
    }
    spans
}

fn trim_span(text: &str, span: Span) -> Span {
    let slice = &text[span.start..span.end];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    Span::new(span.start + leading, span.end - trailing)
}

/// Chunk the normalized text at sentence boundaries with the configured
/// overlap. Every chunk satisfies `end - start <= max_chunk_chars`; a
/// sentence longer than the budget is hard-split.
#[must_use]
pub fn chunk_text(text: &str, sentences: &[Span], config: &EnrichConfig) -> Vec<TextChunk> {
    let max = config.max_chunk_chars.max(1);
    let overlap = config.chunk_overlap_chars.min(max / 2);

    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max {
        return vec![TextChunk {
            span: Span::new(0, text.len()),
            overlap_with_next: 0,
            index: 0,
        }];
    }

    // Candidate cut points: sentence ends, plus forced cuts inside
    // over-long sentences.
    let mut cuts: Vec<usize> = Vec::new();
    for s in sentences {
        if s.len() > max {
            let mut p = s.start + max;
            while p < s.end {
                cuts.push(floor_char_boundary(text, p));
                p += max;
            }
        }
        cuts.push(s.end);
    }
    if cuts.last() != Some(&text.len()) {
        cuts.push(text.len());
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < text.len() {
        let limit = (start + max).min(text.len());
        // The furthest cut that fits, or a hard split if none does.
        let end = cuts
            .iter()
            .copied()
            .filter(|&c| c > start && c <= limit)
            .max()
            .unwrap_or_else(|| floor_char_boundary(text, limit));

        let at_end = end >= text.len();
        chunks.push(TextChunk {
            span: Span::new(start, end),
            overlap_with_next: if at_end { 0 } else { overlap },
            index: chunks.len(),
        });
        if at_end {
            break;
        }
        let next = floor_char_boundary(text, end.saturating_sub(overlap).max(start + 1));
        start = if next > start { next } else { end };
    }
    chunks
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Normalize a submitted document into its canonical form.
///
/// Rejects oversize input, NFKC-normalizes, collapses whitespace, builds
/// the sentence index and the chunked view, and hashes the result.
pub fn normalize(input: &DocumentInput, config: &EnrichConfig) -> Result<CanonicalText> {
    if input.content.len() > config.max_upload_bytes {
        return Err(Error::input(format!(
            "document is {} bytes; limit is {}",
            input.content.len(),
            config.max_upload_bytes
        )));
    }

    let folded: String = input.content.nfkc().collect();
    let text = collapse_whitespace(&folded);
    let sentences = split_sentences(&text);
    let chunks = chunk_text(&text, &sentences, config);

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let sha256 = format!("{:x}", hasher.finalize());

    Ok(CanonicalText {
        text,
        chunks,
        sentences: SentenceIndex::new(sentences),
        sha256,
        source_format: input.format,
    })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn sentence_spans_are_sorted_and_disjoint(text in ".{0,400}") {
            let text = collapse_whitespace(&text.chars().nfkc().collect::<String>());
            let spans = split_sentences(&text);
            for pair in spans.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start);
            }
            for s in &spans {
                prop_assert!(s.end <= text.len());
                prop_assert!(text.is_char_boundary(s.start));
                prop_assert!(text.is_char_boundary(s.end));
            }
        }

        #[test]
        fn chunks_cover_the_text(text in "[a-zA-Z .]{1,2000}") {
            let text = collapse_whitespace(&text);
            prop_assume!(!text.is_empty());
            let mut config = EnrichConfig::default();
            config.max_chunk_chars = 120;
            config.chunk_overlap_chars = 20;
            let sentences = split_sentences(&text);
            let chunks = chunk_text(&text, &sentences, &config);
            prop_assert!(!chunks.is_empty());
            prop_assert_eq!(chunks[0].span.start, 0);
            prop_assert_eq!(chunks.last().unwrap().span.end, text.len());
            for c in &chunks {
                prop_assert!(c.span.len() <= 120);
            }
            for pair in chunks.windows(2) {
                // No gaps between consecutive chunks.
                prop_assert!(pair[1].span.start <= pair[0].span.end);
            }
        }
    }
}
