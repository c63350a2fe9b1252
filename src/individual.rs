//! Rule-based extraction of OWL individuals: citations, dates, amounts,
//! parties, and the other typed instances a legal document mentions.
//!
//! No gazetteers beyond a small geographic list and no model calls; every
//! extractor keys off surface format, in the spirit of format-based
//! pattern extraction. Person and organization detection is deliberately
//! conservative (honorifics, corporate suffixes, caption patterns) because
//! contextual NER belongs to the language-model stages.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::annotation::{Individual, IndividualType, LineageEvent, Source, Span};
use crate::config::EnrichConfig;
use crate::types::Confidence;

trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn individual_type(&self) -> IndividualType;
    fn confidence(&self) -> f64;
    fn extract(&self, text: &str, out: &mut Vec<Individual>);

    fn make(
        &self,
        span: Span,
        surface: &str,
        normalized: Option<String>,
        url: Option<String>,
    ) -> Individual {
        Individual {
            id: Uuid::new_v4(),
            span,
            surface_text: surface.to_string(),
            individual_type: self.individual_type(),
            normalized_form: normalized,
            resolved_url: url,
            linked_concept_iri: None,
            confidence: Confidence::saturating(self.confidence()),
            sources: vec![Source::Ruler],
            lineage: vec![
                LineageEvent::now("individual_extraction", "created")
                    .with_reason(format!("pattern: {}", self.name())),
            ],
        }
    }
}

/// Suppress overlaps within one extractor's output: first match wins.
fn push_if_clear(out: &mut Vec<Individual>, candidate: Individual) {
    let same_type_overlap = out.iter().any(|i| {
        i.individual_type == candidate.individual_type && i.span.overlaps(&candidate.span)
    });
    if !same_type_overlap {
        out.push(candidate);
    }
}

// ============================================================================
// Citations and statutes
// ============================================================================

static CASE_CITATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(\d{1,4})\s+(U\.S\.|S\.\s?Ct\.|F\.\s?Supp\.(?:\s?[23]d)?|F\.(?:2d|3d|4th)|N\.[EWY]\.(?:2d|3d)?|P\.(?:2d|3d)?|A\.(?:2d|3d)?|So\.(?:2d|3d)?)\s+(\d{1,5})(?:,\s*\d{1,5})?(\s*\([^)]{1,60}\d{4}\))?",
    )
    .expect("valid regex")
});

struct CitationExtractor;

impl Extractor for CitationExtractor {
    fn name(&self) -> &'static str {
        "case_citation"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Citation
    }
    fn confidence(&self) -> f64 {
        0.92
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for caps in CASE_CITATION.captures_iter(text) {
            let m = caps.get(0).expect("whole match");
            // Canonical short form: volume reporter page.
            let normalized = format!(
                "{} {} {}",
                &caps[1],
                caps[2].split_whitespace().collect::<Vec<_>>().join(" "),
                &caps[3]
            );
            push_if_clear(
                out,
                self.make(
                    Span::new(m.start(), m.end()),
                    m.as_str(),
                    Some(normalized),
                    None,
                ),
            );
        }
    }
}

static STATUTE_CITATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(\d{1,3})\s+(U\.S\.C\.|C\.F\.R\.)\s*(?:§§?\s*)?(\d+[a-z]?(?:\([a-zA-Z0-9]+\))*)",
    )
    .expect("valid regex")
});

struct StatuteExtractor;

impl Extractor for StatuteExtractor {
    fn name(&self) -> &'static str {
        "statute_citation"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Statute
    }
    fn confidence(&self) -> f64 {
        0.93
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for caps in STATUTE_CITATION.captures_iter(text) {
            let m = caps.get(0).expect("whole match");
            let title = &caps[1];
            let code = &caps[2];
            let section = &caps[3];
            let normalized = format!("{title} {code} § {section}");
            let url = if code == "U.S.C." {
                let bare = section.split('(').next().unwrap_or(section);
                Some(format!(
                    "https://www.law.cornell.edu/uscode/text/{title}/{bare}"
                ))
            } else {
                None
            };
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), Some(normalized), url),
            );
        }
    }
}

// ============================================================================
// Dates and durations
// ============================================================================

const MONTHS: &str = "January|February|March|April|May|June|July|August|September|October|November|December|Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec";

static DATE_WRITTEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:the\s+)?(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:day\s+of\s+)?({MONTHS})\.?,?\s+(\d{{4}})\b|\b({MONTHS})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b"
    ))
    .expect("valid regex")
});

static DATE_ISO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("valid regex"));

static DATE_US: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b").expect("valid regex"));

fn month_number(name: &str) -> Option<u32> {
    let lowered = name.trim_end_matches('.').to_lowercase();
    let n = match lowered.as_str() {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sep" | "sept" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(n)
}

struct DateExtractor;

impl Extractor for DateExtractor {
    fn name(&self) -> &'static str {
        "date"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Date
    }
    fn confidence(&self) -> f64 {
        0.92
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for caps in DATE_WRITTEN.captures_iter(text) {
            let m = caps.get(0).expect("whole match");
            let normalized = if let (Some(d), Some(mo), Some(y)) =
                (caps.get(1), caps.get(2), caps.get(3))
            {
                iso_date(y.as_str(), mo.as_str(), d.as_str())
            } else if let (Some(mo), Some(d), Some(y)) = (caps.get(4), caps.get(5), caps.get(6)) {
                iso_date(y.as_str(), mo.as_str(), d.as_str())
            } else {
                None
            };
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), normalized, None),
            );
        }
        for caps in DATE_ISO.captures_iter(text) {
            let m = caps.get(0).expect("whole match");
            push_if_clear(
                out,
                self.make(
                    Span::new(m.start(), m.end()),
                    m.as_str(),
                    Some(m.as_str().to_string()),
                    None,
                ),
            );
        }
        for caps in DATE_US.captures_iter(text) {
            let m = caps.get(0).expect("whole match");
            let (mo, d, y) = (&caps[1], &caps[2], &caps[3]);
            let year = if y.len() == 2 {
                format!("20{y}")
            } else {
                y.to_string()
            };
            let normalized = format!(
                "{}-{:02}-{:02}",
                year,
                mo.parse::<u32>().unwrap_or(0),
                d.parse::<u32>().unwrap_or(0)
            );
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), Some(normalized), None),
            );
        }
    }
}

fn iso_date(year: &str, month_name: &str, day: &str) -> Option<String> {
    let month = month_number(month_name)?;
    let day: u32 = day.parse().ok()?;
    Some(format!("{year}-{month:02}-{day:02}"))
}

static DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:\d+(?:\.\d+)?|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve|fifteen|twenty|thirty|sixty|ninety)(?:\s*\(\d+\))?\s+(?:second|minute|hour|day|week|month|year|decade)s?\b",
    )
    .expect("valid regex")
});

struct DurationExtractor;

impl Extractor for DurationExtractor {
    fn name(&self) -> &'static str {
        "duration"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Duration
    }
    fn confidence(&self) -> f64 {
        0.90
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in DURATION.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

// ============================================================================
// Amounts
// ============================================================================

static MONEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)[$€£¥]\s?[\d,]+(?:\.\d{1,2})?(?:\s*(?:billion|million|trillion|thousand|[KMB]))?|\b[\d,]+(?:\.\d{1,2})?\s*(?:dollars?|cents?|euros?|pounds?|USD|EUR|GBP|JPY)\b|\b\d+(?:\.\d+)?\s*(?:billion|million|trillion)\s+(?:dollars?|euros?|pounds?)\b",
    )
    .expect("valid regex")
});

struct MoneyExtractor;

impl Extractor for MoneyExtractor {
    fn name(&self) -> &'static str {
        "money"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Money
    }
    fn confidence(&self) -> f64 {
        0.93
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in MONEY.find_iter(text) {
            if m.as_str().len() < 2 {
                continue;
            }
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

static PERCENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b\d+(?:\.\d+)?\s*(?:%|percent\b|pct\b)|\b\d+(?:\.\d+)?\s+basis\s+points?\b")
        .expect("valid regex")
});

struct PercentExtractor;

impl Extractor for PercentExtractor {
    fn name(&self) -> &'static str {
        "percent"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Percent
    }
    fn confidence(&self) -> f64 {
        0.93
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in PERCENT.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

// ============================================================================
// Contact details
// ============================================================================

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b").expect("valid regex")
});

struct EmailExtractor;

impl Extractor for EmailExtractor {
    fn name(&self) -> &'static str {
        "email"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Email
    }
    fn confidence(&self) -> f64 {
        0.98
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in EMAIL.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bhttps?://[^\s<>\[\]{}|\\^`]+[^\s<>\[\]{}|\\^`.,;:)]").expect("valid regex")
});

struct UrlExtractor;

impl Extractor for UrlExtractor {
    fn name(&self) -> &'static str {
        "url"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Url
    }
    fn confidence(&self) -> f64 {
        0.98
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in URL.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}\b").expect("valid regex")
});

struct PhoneExtractor;

impl Extractor for PhoneExtractor {
    fn name(&self) -> &'static str {
        "phone"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Phone
    }
    fn confidence(&self) -> f64 {
        0.85
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in PHONE.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

static ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\d{1,5}\s+[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*\s+(?:Street|St|Avenue|Ave|Boulevard|Blvd|Road|Rd|Drive|Dr|Lane|Ln|Way|Court|Ct|Place|Pl|Circle|Cir|Plaza)\.?(?:,?\s+(?:Suite|Ste|Apt|Unit|Floor|Fl)\.?\s*\d+)?(?:,\s+[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*)?(?:,\s+[A-Z]{2})?(?:\s+\d{5}(?:-\d{4})?)?",
    )
    .expect("valid regex")
});

struct AddressExtractor;

impl Extractor for AddressExtractor {
    fn name(&self) -> &'static str {
        "address"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Address
    }
    fn confidence(&self) -> f64 {
        0.87
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in ADDRESS.find_iter(text) {
            if m.as_str().len() < 10 {
                continue;
            }
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

// ============================================================================
// Courts, case numbers, parties
// ============================================================================

static COURT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:Supreme Court of (?:the United States|[A-Z][a-z]+(?: [A-Z][a-z]+)*))|(?:United States (?:District|Circuit|Bankruptcy|Tax) Court(?: for the (?:[A-Z][a-z]+ )?District of [A-Z][a-z]+(?: [A-Z][a-z]+)*)?)|(?:(?:First|Second|Third|Fourth|Fifth|Sixth|Seventh|Eighth|Ninth|Tenth|Eleventh|D\.C\.) Circuit)|(?:Court of (?:Appeals?|Common Pleas|Claims|Chancery)(?: (?:for|of) [A-Z][a-z]+(?: [A-Z][a-z]+){0,4})?)|(?:(?:Superior|District|Circuit|Appellate|Family|Probate|Municipal) Court(?: (?:of|for) [A-Z][a-z]+(?: [A-Z][a-z]+){0,4})?)",
    )
    .expect("valid regex")
});

struct CourtExtractor;

impl Extractor for CourtExtractor {
    fn name(&self) -> &'static str {
        "court"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Court
    }
    fn confidence(&self) -> f64 {
        0.91
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in COURT.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

static CASE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:(?:Case|Civil Action|Docket|Criminal)\s+)?No\.\s*((?:\d{1,2}:)?\d{2,4}-(?:cv|cr|mc|md)-\d{3,6}(?:-[A-Z]{2,4})?|\d{2,4}-\d{3,6})",
    )
    .expect("valid regex")
});

struct CaseNumberExtractor;

impl Extractor for CaseNumberExtractor {
    fn name(&self) -> &'static str {
        "case_number"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::CaseNumber
    }
    fn confidence(&self) -> f64 {
        0.90
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for caps in CASE_NUMBER.captures_iter(text) {
            let m = caps.get(0).expect("whole match");
            push_if_clear(
                out,
                self.make(
                    Span::new(m.start(), m.end()),
                    m.as_str(),
                    Some(caps[1].to_string()),
                    None,
                ),
            );
        }
    }
}

static ORG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b[A-Z][\w&.-]*(?:\s+[A-Z][\w&.-]*){0,4}[,]?\s+(?:Inc|LLC|L\.L\.C|LLP|L\.L\.P|Ltd|Corp|Co|Company|Corporation|Partners|Associates|Group|Holdings)\.?\b",
    )
    .expect("valid regex")
});

struct OrgExtractor;

impl Extractor for OrgExtractor {
    fn name(&self) -> &'static str {
        "organization"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Org
    }
    fn confidence(&self) -> f64 {
        0.80
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in ORG.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

static PERSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:Mr|Mrs|Ms|Dr|Hon|Judge|Justice|Magistrate)\.?\s+[A-Z][a-z]+(?:\s+[A-Z]\.?)?(?:\s+[A-Z][a-z]+)?",
    )
    .expect("valid regex")
});

struct PersonExtractor;

impl Extractor for PersonExtractor {
    fn name(&self) -> &'static str {
        "person"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Person
    }
    fn confidence(&self) -> f64 {
        0.80
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in PERSON.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

static GPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:United States(?: of America)?|New York|California|Texas|Florida|Illinois|Delaware|New Jersey|Pennsylvania|Massachusetts|Washington|Virginia|Georgia|Ohio|Michigan|Nevada|Connecticut|Maryland|Colorado|Arizona|Canada|United Kingdom|Germany|France|Japan|China|Mexico)\b",
    )
    .expect("valid regex")
});

struct GpeExtractor;

impl Extractor for GpeExtractor {
    fn name(&self) -> &'static str {
        "gpe"
    }
    fn individual_type(&self) -> IndividualType {
        IndividualType::Gpe
    }
    fn confidence(&self) -> f64 {
        0.75
    }
    fn extract(&self, text: &str, out: &mut Vec<Individual>) {
        for m in GPE.find_iter(text) {
            push_if_clear(
                out,
                self.make(Span::new(m.start(), m.end()), m.as_str(), None, None),
            );
        }
    }
}

// ============================================================================
// Runner and deduplication
// ============================================================================

fn extractors() -> Vec<Box<dyn Extractor>> {
    vec![
        Box::new(CitationExtractor),
        Box::new(StatuteExtractor),
        Box::new(DateExtractor),
        Box::new(DurationExtractor),
        Box::new(MoneyExtractor),
        Box::new(PercentExtractor),
        Box::new(EmailExtractor),
        Box::new(UrlExtractor),
        Box::new(PhoneExtractor),
        Box::new(AddressExtractor),
        Box::new(CourtExtractor),
        Box::new(CaseNumberExtractor),
        Box::new(OrgExtractor),
        Box::new(PersonExtractor),
        Box::new(GpeExtractor),
    ]
}

/// Run every extractor over the text and deduplicate the results.
///
/// Output is ordered by `(start, end, type)`.
#[must_use]
pub fn extract_individuals(text: &str, config: &EnrichConfig) -> Vec<Individual> {
    if !config.individual_extraction_enabled || text.is_empty() {
        return Vec::new();
    }
    let mut all = Vec::new();
    for extractor in extractors() {
        extractor.extract(text, &mut all);
    }
    let mut deduped = deduplicate(all);
    deduped.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    deduped
}

/// Merge individuals that share `(type, normalized surface, span)`: the
/// highest-confidence one wins and absorbs the others' sources.
#[must_use]
pub fn deduplicate(individuals: Vec<Individual>) -> Vec<Individual> {
    use std::collections::HashMap;

    let mut kept: Vec<Individual> = Vec::new();
    let mut index: HashMap<(IndividualType, String, Span), usize> = HashMap::new();

    for ind in individuals {
        let key = (
            ind.individual_type,
            ind.surface_text.trim().to_lowercase(),
            ind.span,
        );
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut kept[i];
                let folded_sources = ind.sources.clone();
                if ind.confidence.get() > existing.confidence.get() {
                    let mut winner = ind;
                    winner.sources.extend(existing.sources.iter().copied());
                    winner.lineage.push(
                        LineageEvent::now("individual_extraction", "merged")
                            .with_reason("absorbed duplicate extraction"),
                    );
                    *existing = winner;
                } else {
                    existing.sources.extend(folded_sources);
                    existing.lineage.push(
                        LineageEvent::now("individual_extraction", "merged")
                            .with_reason("absorbed duplicate extraction"),
                    );
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(ind);
            }
        }
    }
    kept
}

// ============================================================================
// Class linking
// ============================================================================

/// Link individuals to their nearest class annotations.
///
/// The heuristic picks the closest non-rejected concept annotation in the
/// same sentence (by distance between spans). When a language model is
/// available it validates or overrides the choice among the sentence's
/// candidates; an answer naming an unknown IRI is ignored.
pub async fn link_individuals(
    llm: Option<&std::sync::Arc<dyn crate::llm::LanguageModel>>,
    individuals: &mut [Individual],
    annotations: &[crate::annotation::ConceptMatch],
    doc: &crate::document::CanonicalText,
    config: &EnrichConfig,
    cancel: &crate::pipeline::CancelFlag,
    signals: &mut Vec<crate::job::QualitySignal>,
) {
    use crate::annotation::AnnotationState;
    use crate::llm::{structured_with_retry, LlmBudget};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn sentence_candidates<'a>(
        ind: &Individual,
        annotations: &'a [crate::annotation::ConceptMatch],
        doc: &crate::document::CanonicalText,
    ) -> Vec<&'a crate::annotation::ConceptMatch> {
        let sentence = doc
            .sentences
            .sentence_of(&ind.span)
            .and_then(|i| doc.sentences.span(i));
        let Some(sentence) = sentence else {
            return Vec::new();
        };
        let mut candidates: Vec<&crate::annotation::ConceptMatch> = annotations
            .iter()
            .filter(|a| {
                a.state != AnnotationState::Rejected
                    && a.span.start >= sentence.start
                    && a.span.end <= sentence.end
            })
            .collect();
        // Closest first, by gap between spans.
        candidates.sort_by_key(|a| {
            if a.span.overlaps(&ind.span) {
                0
            } else if a.span.end <= ind.span.start {
                ind.span.start - a.span.end
            } else {
                a.span.start - ind.span.end
            }
        });
        candidates
    }

    for ind in individuals.iter_mut() {
        if cancel.is_cancelled() {
            return;
        }
        if let Some(nearest) = sentence_candidates(ind, annotations, doc).first() {
            ind.linked_concept_iri = Some(nearest.concept_iri.clone());
            ind.record(
                LineageEvent::now("individual_linker", "linked")
                    .with_reason("nearest in-sentence concept"),
            );
        }
    }

    let Some(llm) = llm else {
        return;
    };
    let semaphore = Arc::new(Semaphore::new(config.llm_concurrency.max(1)));
    let budget = LlmBudget::with_timeout(config.llm_call_timeout());
    let schema = crate::prompts::individual_link_schema();

    let mut tasks = Vec::new();
    for (idx, ind) in individuals.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let candidates: Vec<String> = sentence_candidates(ind, annotations, doc)
            .iter()
            .map(|c| c.concept_iri.clone())
            .collect();
        if candidates.is_empty() {
            continue;
        }
        let prompt = crate::prompts::individual_link(
            &ind.surface_text,
            ind.individual_type.as_label(),
            &candidates,
        );
        let llm = Arc::clone(llm);
        let sem = Arc::clone(&semaphore);
        let schema = schema.clone();
        let cancel = cancel.clone();
        let candidates_set: std::collections::HashSet<String> = candidates.into_iter().collect();
        tasks.push(tokio::spawn(async move {
            let _permit = sem.acquire().await;
            if cancel.is_cancelled() {
                return (idx, None);
            }
            match structured_with_retry(llm.as_ref(), &prompt, &schema, &budget).await {
                Ok(value) => {
                    let iri = value
                        .get("concept_iri")
                        .and_then(serde_json::Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty() && candidates_set.contains(*s))
                        .map(str::to_string);
                    (idx, iri)
                }
                Err(e) => {
                    log::warn!("individual link call failed: {e}");
                    (idx, None)
                }
            }
        }));
    }

    let mut failed = 0usize;
    for outcome in futures::future::join_all(tasks).await {
        match outcome {
            Ok((idx, Some(iri))) => {
                let ind = &mut individuals[idx];
                if ind.linked_concept_iri.as_deref() != Some(iri.as_str()) {
                    ind.record(
                        LineageEvent::now("individual_linker", "relinked")
                            .with_change(
                                ind.linked_concept_iri.clone().unwrap_or_default(),
                                iri.clone(),
                            )
                            .with_reason("model override"),
                    );
                }
                ind.linked_concept_iri = Some(iri);
            }
            Ok((_, None)) => {}
            Err(_) => failed += 1,
        }
    }
    if failed > 0 {
        signals.push(crate::job::QualitySignal {
            stage: "individual_linker".to_string(),
            reason: format!("{failed} link tasks failed"),
            span_or_chunk: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> Vec<Individual> {
        extract_individuals(text, &EnrichConfig::default())
    }

    fn of_type(individuals: &[Individual], t: IndividualType) -> Vec<&Individual> {
        individuals
            .iter()
            .filter(|i| i.individual_type == t)
            .collect()
    }

    // ------------------------------------------------------------------
    // Citations
    // ------------------------------------------------------------------

    #[test]
    fn federal_reporter_citation() {
        let inds = extract("See 123 F.3d 456 (9th Cir. 1999) for the standard.");
        let cites = of_type(&inds, IndividualType::Citation);
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].surface_text, "123 F.3d 456 (9th Cir. 1999)");
        assert_eq!(cites[0].normalized_form.as_deref(), Some("123 F.3d 456"));
    }

    #[test]
    fn supreme_court_citation() {
        let inds = extract("Brown v. Board, 347 U.S. 483 (1954), controls.");
        let cites = of_type(&inds, IndividualType::Citation);
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].normalized_form.as_deref(), Some("347 U.S. 483"));
    }

    #[test]
    fn statute_with_resolution_url() {
        let inds = extract("The claim arises under 42 U.S.C. § 1983 as amended.");
        let statutes = of_type(&inds, IndividualType::Statute);
        assert_eq!(statutes.len(), 1);
        assert_eq!(
            statutes[0].normalized_form.as_deref(),
            Some("42 U.S.C. § 1983")
        );
        assert_eq!(
            statutes[0].resolved_url.as_deref(),
            Some("https://www.law.cornell.edu/uscode/text/42/1983")
        );
    }

    #[test]
    fn cfr_statute_no_url() {
        let inds = extract("Compliance with 29 C.F.R. § 1910 is required.");
        let statutes = of_type(&inds, IndividualType::Statute);
        assert_eq!(statutes.len(), 1);
        assert!(statutes[0].resolved_url.is_none());
    }

    // ------------------------------------------------------------------
    // Dates
    // ------------------------------------------------------------------

    #[test]
    fn written_dates_normalize_to_iso() {
        let inds = extract("Signed on January 15, 2024 and amended 3 March 2025.");
        let dates = of_type(&inds, IndividualType::Date);
        assert_eq!(dates.len(), 2);
        let forms: Vec<&str> = dates
            .iter()
            .filter_map(|d| d.normalized_form.as_deref())
            .collect();
        assert!(forms.contains(&"2024-01-15"));
        assert!(forms.contains(&"2025-03-03"));
    }

    #[test]
    fn numeric_dates_normalize() {
        let inds = extract("Due 01/15/2024 or by 2024-02-01 at the latest.");
        let dates = of_type(&inds, IndividualType::Date);
        assert_eq!(dates.len(), 2);
        let forms: Vec<&str> = dates
            .iter()
            .filter_map(|d| d.normalized_form.as_deref())
            .collect();
        assert!(forms.contains(&"2024-01-15"));
        assert!(forms.contains(&"2024-02-01"));
    }

    #[test]
    fn contract_style_date() {
        let inds = extract("Executed the 5th day of June, 2023 by the parties.");
        let dates = of_type(&inds, IndividualType::Date);
        assert_eq!(dates.len(), 1);
        assert_eq!(dates[0].normalized_form.as_deref(), Some("2023-06-05"));
    }

    // ------------------------------------------------------------------
    // Amounts
    // ------------------------------------------------------------------

    #[test]
    fn money_forms() {
        for text in [
            "damages of $5,000,000",
            "a fee of €500",
            "fifty thousand (50,000) dollars? no: 50,000 dollars",
            "$1.5 million",
        ] {
            let inds = extract(text);
            assert!(
                !of_type(&inds, IndividualType::Money).is_empty(),
                "no money found in: {text}"
            );
        }
    }

    #[test]
    fn percents_and_basis_points() {
        let inds = extract("Interest accrues at 4.5% or 50 basis points above prime.");
        assert_eq!(of_type(&inds, IndividualType::Percent).len(), 2);
    }

    #[test]
    fn durations() {
        let inds = extract("The term is five years with a thirty days notice period.");
        assert_eq!(of_type(&inds, IndividualType::Duration).len(), 2);
    }

    // ------------------------------------------------------------------
    // Contact details
    // ------------------------------------------------------------------

    #[test]
    fn email_url_phone() {
        let inds = extract(
            "Contact counsel@firm.com or visit https://example.com/filings; call (555) 123-4567.",
        );
        assert_eq!(of_type(&inds, IndividualType::Email).len(), 1);
        assert_eq!(of_type(&inds, IndividualType::Url).len(), 1);
        assert_eq!(of_type(&inds, IndividualType::Phone).len(), 1);
    }

    #[test]
    fn street_address() {
        let inds = extract("Serve process at 123 Main Street, Suite 400, Springfield, IL 62704.");
        let addrs = of_type(&inds, IndividualType::Address);
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].surface_text.starts_with("123 Main Street"));
    }

    // ------------------------------------------------------------------
    // Courts, case numbers, parties
    // ------------------------------------------------------------------

    #[test]
    fn courts() {
        let inds = extract(
            "Filed in the United States District Court for the Southern District of New York.",
        );
        assert_eq!(of_type(&inds, IndividualType::Court).len(), 1);
    }

    #[test]
    fn case_numbers() {
        let inds = extract("Case No. 1:20-cv-04567 and the older matter No. 19-1234.");
        let nums = of_type(&inds, IndividualType::CaseNumber);
        assert_eq!(nums.len(), 2);
        assert_eq!(nums[0].normalized_form.as_deref(), Some("1:20-cv-04567"));
    }

    #[test]
    fn organizations_and_persons() {
        let inds = extract("Acme Widgets, Inc. retained Mr. John Q. Public as witness.");
        assert_eq!(of_type(&inds, IndividualType::Org).len(), 1);
        assert_eq!(of_type(&inds, IndividualType::Person).len(), 1);
    }

    #[test]
    fn geopolitical_entities() {
        let inds = extract("Incorporated in Delaware and doing business in New York.");
        assert_eq!(of_type(&inds, IndividualType::Gpe).len(), 2);
    }

    // ------------------------------------------------------------------
    // Hygiene
    // ------------------------------------------------------------------

    #[test]
    fn empty_and_plain_text() {
        assert!(extract("").is_empty());
        assert!(extract("the quick brown fox jumps over the lazy dog").is_empty());
    }

    #[test]
    fn output_is_sorted() {
        let inds = extract("Pay $100 by January 15, 2024 or 10% interest accrues.");
        let keys: Vec<_> = inds.iter().map(|i| (i.span.start, i.span.end)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn spans_slice_back_to_surface() {
        let text = "Pay $2,500 on 01/02/2023 to Acme Corp. at 10 Elm Street, Suite 2.";
        for ind in extract(text) {
            assert_eq!(ind.span.slice(text), ind.surface_text);
        }
    }

    #[test]
    fn dedup_folds_sources_and_keeps_highest_confidence() {
        let a = Individual {
            id: Uuid::new_v4(),
            span: Span::new(0, 4),
            surface_text: "Test".to_string(),
            individual_type: IndividualType::Org,
            normalized_form: None,
            resolved_url: None,
            linked_concept_iri: None,
            confidence: Confidence::saturating(0.7),
            sources: vec![Source::Ruler],
            lineage: Vec::new(),
        };
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        b.confidence = Confidence::saturating(0.9);
        b.sources = vec![Source::Llm];

        let out = deduplicate(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence.get() - 0.9).abs() < 1e-9);
        assert!(out[0].sources.contains(&Source::Ruler));
        assert!(out[0].sources.contains(&Source::Llm));
    }
}
