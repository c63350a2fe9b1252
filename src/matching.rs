//! Containment-aware multi-pattern string matching.
//!
//! This is the shared matching engine behind the ruler, the property
//! matcher, and the string-match expander. An Aho-Corasick automaton scans
//! the text once in `O(n + z)` where `z` is the total match count; raw
//! matches are then validated at word boundaries and run through the
//! overlap policy:
//!
//! - nested spans (one strictly inside the other) both survive;
//! - partial overlaps keep the longer span, ties keep the earlier start;
//! - identical spans with distinct keys all survive;
//! - identical `(span, key)` pairs collapse into one.
//!
//! Matching is case-insensitive. The canonical text is already
//! NFKC-normalized, so the only fold applied here is lowercasing, done
//! through an offset map so that match spans always point back into the
//! original text.

use aho_corasick::AhoCorasick;

use crate::annotation::Span;
use crate::config::EnrichConfig;

/// Lowercase view of a text with a byte-offset map back to the original.
///
/// Lowercasing can change byte lengths ("İ" becomes two chars), so spans
/// found in the folded text cannot be used directly.
pub struct FoldedText {
    folded: String,
    /// `map[i]` is the original byte offset of the source char that
    /// produced folded byte `i`.
    map: Vec<usize>,
    original_len: usize,
}

impl FoldedText {
    /// Fold `text` to lowercase, keeping the offset map.
    #[must_use]
    pub fn fold(text: &str) -> Self {
        let mut folded = String::with_capacity(text.len());
        let mut map = Vec::with_capacity(text.len());
        for (idx, c) in text.char_indices() {
            for lc in c.to_lowercase() {
                let mut buf = [0u8; 4];
                let s = lc.encode_utf8(&mut buf);
                for _ in 0..s.len() {
                    map.push(idx);
                }
                folded.push_str(s);
            }
        }
        Self {
            folded,
            map,
            original_len: text.len(),
        }
    }

    /// The folded text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.folded
    }

    /// Map a span in the folded text back to the original text.
    #[must_use]
    pub fn to_original(&self, folded_span: Span) -> Span {
        let start = self.map.get(folded_span.start).copied().unwrap_or(self.original_len);
        let end = self
            .map
            .get(folded_span.end)
            .copied()
            .unwrap_or(self.original_len);
        Span::new(start, end)
    }
}

/// Fold a pattern the same way [`FoldedText`] folds the text.
#[must_use]
pub fn fold_pattern(pattern: &str) -> String {
    pattern.chars().flat_map(char::to_lowercase).collect()
}

/// True when `pos` sits at a word boundary of `text`.
///
/// A position is a boundary when it is at either edge of the text or the
/// adjacent character is not a word character. Word characters are
/// alphanumerics, underscore, and the configured extras (hyphen by
/// default), so "e-discovery" yields no interior match for "discovery".
#[must_use]
pub fn is_word_boundary(text: &str, pos: usize, config: &EnrichConfig) -> bool {
    if pos == 0 || pos >= text.len() {
        return true;
    }
    if !text.is_char_boundary(pos) {
        return false;
    }
    let before = text[..pos].chars().next_back();
    let after = text[pos..].chars().next();
    match (before, after) {
        (Some(b), Some(a)) => !config.is_word_char(b) || !config.is_word_char(a),
        _ => true,
    }
}

/// A raw automaton match before overlap resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    /// Span in the original text.
    pub span: Span,
    /// Index of the pattern that matched.
    pub pattern: usize,
}

/// Multi-pattern matcher carrying an arbitrary value per pattern.
///
/// Duplicate pattern strings are allowed; each gets its own value, and the
/// scan reports every one (the ruler relies on this to emit one match per
/// candidate IRI when a label is ambiguous).
pub struct MultiPatternMatcher<V> {
    automaton: AhoCorasick,
    values: Vec<V>,
}

impl<V> MultiPatternMatcher<V> {
    /// Build from `(pattern, value)` pairs. Patterns are folded at build
    /// time. Returns `None` when no patterns were given.
    #[must_use]
    pub fn build(pairs: Vec<(String, V)>) -> Option<Self> {
        if pairs.is_empty() {
            return None;
        }
        let (patterns, values): (Vec<String>, Vec<V>) = pairs
            .into_iter()
            .map(|(p, v)| (fold_pattern(&p), v))
            .unzip();
        let automaton = AhoCorasick::new(&patterns).ok()?;
        Some(Self { automaton, values })
    }

    /// Number of patterns.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.values.len()
    }

    /// The value attached to a pattern index.
    #[must_use]
    pub fn value(&self, pattern: usize) -> &V {
        &self.values[pattern]
    }

    /// Scan `text`, returning every boundary-valid match of every pattern,
    /// including nested and overlapping ones. Spans point into `text`.
    #[must_use]
    pub fn scan(&self, text: &str, config: &EnrichConfig) -> Vec<RawMatch> {
        let folded = FoldedText::fold(text);
        let haystack = folded.as_str();
        let mut out = Vec::new();
        for m in self.automaton.find_overlapping_iter(haystack) {
            if !is_word_boundary(haystack, m.start(), config)
                || !is_word_boundary(haystack, m.end(), config)
            {
                continue;
            }
            let span = folded.to_original(Span::new(m.start(), m.end()));
            if span.is_empty()
                || !text.is_char_boundary(span.start)
                || !text.is_char_boundary(span.end)
            {
                continue;
            }
            out.push(RawMatch {
                span,
                pattern: m.pattern().as_usize(),
            });
        }
        out
    }
}

/// Items that participate in overlap resolution: a span plus a collapse key
/// (the concept or property IRI).
pub trait SpanKeyed {
    /// The item's span.
    fn span(&self) -> Span;
    /// The identity used to collapse exact duplicates.
    fn key(&self) -> &str;
}

enum Verdict {
    Keep,
    Drop,
    MergeInto(usize),
    Replace(usize),
}

/// Resolve overlapping matches with containment awareness.
///
/// `merge_duplicate` is called when an identical `(span, key)` pair
/// collapses, with the kept item and the dropped one.
///
/// Output is sorted by `(start, end, key)`.
pub fn resolve_overlaps<T: SpanKeyed>(
    items: Vec<T>,
    mut merge_duplicate: impl FnMut(&mut T, T),
) -> Vec<T> {
    // A replacement can leave a residual partial overlap against an item
    // the replaced span had already displaced, so resolution runs to a
    // fixpoint. Every pass over a set containing a partial overlap
    // strictly shrinks it, so this terminates.
    let mut out = resolve_pass(items, &mut merge_duplicate);
    while has_partial_overlap(&out) {
        out = resolve_pass(out, &mut merge_duplicate);
    }
    out
}

fn has_partial_overlap<T: SpanKeyed>(items: &[T]) -> bool {
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let (a, b) = (items[i].span(), items[j].span());
            if b.start >= a.end {
                break;
            }
            if a.overlaps(&b) && a != b && !a.contains_strictly(&b) && !b.contains_strictly(&a) {
                return true;
            }
        }
    }
    false
}

fn resolve_pass<T: SpanKeyed>(
    mut items: Vec<T>,
    merge_duplicate: &mut impl FnMut(&mut T, T),
) -> Vec<T> {
    if items.is_empty() {
        return items;
    }

    // Start ascending, longer spans first at the same start, key for
    // determinism.
    items.sort_by(|a, b| {
        a.span()
            .start
            .cmp(&b.span().start)
            .then_with(|| b.span().len().cmp(&a.span().len()))
            .then_with(|| a.key().cmp(b.key()))
    });

    let mut resolved: Vec<T> = Vec::new();

    for item in items {
        let ispan = item.span();
        let mut verdict = Verdict::Keep;

        for (i, kept) in resolved.iter().enumerate() {
            let kspan = kept.span();
            if !ispan.overlaps(&kspan) {
                continue;
            }
            if ispan == kspan {
                if item.key() == kept.key() {
                    verdict = Verdict::MergeInto(i);
                    break;
                }
                // Identical span, distinct key: both survive.
                continue;
            }
            if kspan.contains_strictly(&ispan) || ispan.contains_strictly(&kspan) {
                // Nested spans survive.
                continue;
            }
            // Partial overlap: longer wins; on a tie the earlier start
            // (already kept) wins.
            if ispan.len() > kspan.len() {
                verdict = Verdict::Replace(i);
            } else {
                verdict = Verdict::Drop;
            }
            break;
        }

        match verdict {
            Verdict::Keep => resolved.push(item),
            Verdict::Drop => {}
            Verdict::MergeInto(i) => merge_duplicate(&mut resolved[i], item),
            Verdict::Replace(i) => resolved[i] = item,
        }
    }

    resolved.sort_by(|a, b| {
        a.span()
            .start
            .cmp(&b.span().start)
            .then_with(|| a.span().end.cmp(&b.span().end))
            .then_with(|| a.key().cmp(b.key()))
    });
    resolved
}
