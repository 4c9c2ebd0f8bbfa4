//! PII and secret detection with typed redaction placeholders.
//!
//! A scan runs every enabled detector over the text, keeps candidates that
//! pass their validator, and resolves overlaps: the longest span wins, ties
//! go to the category listed first in the catalog. Accepted spans are
//! replaced with `[REDACTED:<category>]` and detection repeats on the result
//! until nothing new is found. Text that is already a placeholder is never
//! matched again.

mod detectors;

use crate::error::StoreError;
use detectors::{CATALOG, Detector, SECRET_PATTERN, Validator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Upper bound on detection passes per scan.
const MAX_PASSES: usize = 8;

/// Detector categories, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PiiCategory {
    PrivateKey,
    Jwt,
    ApiKey,
    Credential,
    PaymentCard,
    Iban,
    Ssn,
    Email,
    Phone,
    IpAddress,
    StreetAddress,
    Secret,
    Custom,
}

impl PiiCategory {
    /// Every category in catalog order.
    pub const ALL: [Self; 13] = [
        Self::PrivateKey,
        Self::Jwt,
        Self::ApiKey,
        Self::Credential,
        Self::PaymentCard,
        Self::Iban,
        Self::Ssn,
        Self::Email,
        Self::Phone,
        Self::IpAddress,
        Self::StreetAddress,
        Self::Secret,
        Self::Custom,
    ];

    /// Name used in placeholders and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrivateKey => "private-key",
            Self::Jwt => "jwt",
            Self::ApiKey => "api-key",
            Self::Credential => "credential",
            Self::PaymentCard => "payment-card",
            Self::Iban => "iban",
            Self::Ssn => "ssn",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::IpAddress => "ip-address",
            Self::StreetAddress => "street-address",
            Self::Secret => "secret",
            Self::Custom => "custom",
        }
    }

    /// Look up a category by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.as_str() == name)
    }

    /// Replacement text for spans of this category.
    pub fn placeholder(self) -> String {
        format!("[REDACTED:{}]", self.as_str())
    }
}

impl fmt::Display for PiiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One replaced span. `span` indexes the text that was scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionAnnotation {
    pub category: PiiCategory,
    pub span: Range<usize>,
    pub replacement: String,
}

/// Redacted text plus what was replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub text: String,
    pub annotations: Vec<RedactionAnnotation>,
}

impl ScanOutcome {
    /// Whether any span was replaced.
    pub fn is_redacted(&self) -> bool {
        !self.annotations.is_empty()
    }

    /// Replacement counts per category.
    pub fn category_counts(&self) -> BTreeMap<PiiCategory, usize> {
        let mut counts = BTreeMap::new();
        for annotation in &self.annotations {
            *counts.entry(annotation.category).or_insert(0) += 1;
        }
        counts
    }
}

/// Result of scanning raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteScanOutcome {
    /// Input was text and has been scanned.
    Scanned(ScanOutcome),
    /// Input was not UTF-8; returned untouched.
    Unscanned(Vec<u8>),
}

impl ByteScanOutcome {
    pub fn is_scanned(&self) -> bool {
        matches!(self, Self::Scanned(_))
    }
}

/// Scanner settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Enable entropy-based secret detection.
    pub detect_secrets: bool,
    /// Minimum Shannon entropy for a token to count as a secret.
    pub secret_entropy_threshold: f32,
    /// Extra regex patterns redacted as `custom`.
    pub patterns: Vec<String>,
    /// Categories to skip.
    pub disabled: Vec<PiiCategory>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            detect_secrets: true,
            secret_entropy_threshold: 3.7,
            patterns: Vec::new(),
            disabled: Vec::new(),
        }
    }
}

/// Candidate span produced by one detector.
#[derive(Debug)]
struct Candidate {
    rank: usize,
    category: PiiCategory,
    span: Range<usize>,
}

/// Compiled detector catalog. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PiiScanner {
    detectors: Vec<Detector>,
    placeholder: Regex,
}

impl PiiScanner {
    /// Scanner with the default catalog.
    pub fn new() -> Result<Self, StoreError> {
        Self::with_options(ScanOptions::default())
    }

    /// Scanner with custom settings.
    pub fn with_options(options: ScanOptions) -> Result<Self, StoreError> {
        let enabled = |category: PiiCategory| !options.disabled.contains(&category);
        let mut detectors = Vec::new();
        for (category, pattern, validator) in CATALOG {
            if enabled(*category) {
                detectors.push(Detector::compile(*category, pattern, *validator)?);
            }
        }
        if options.detect_secrets && enabled(PiiCategory::Secret) {
            detectors.push(Detector::compile(
                PiiCategory::Secret,
                SECRET_PATTERN,
                Validator::Entropy(options.secret_entropy_threshold),
            )?);
        }
        if enabled(PiiCategory::Custom) {
            for pattern in &options.patterns {
                detectors.push(Detector::compile(
                    PiiCategory::Custom,
                    pattern,
                    Validator::None,
                )?);
            }
        }
        let placeholder = Regex::new(r"\[REDACTED:[a-z]+(?:-[a-z]+)*\]")
            .map_err(|err| StoreError::Regex(err.to_string()))?;
        log::debug!("pii scanner ready (detectors={})", detectors.len());
        Ok(Self {
            detectors,
            placeholder,
        })
    }

    /// Categories this scanner can report.
    pub fn categories(&self) -> Vec<PiiCategory> {
        let mut categories: Vec<_> = self.detectors.iter().map(|d| d.category).collect();
        categories.dedup();
        categories
    }

    /// Redact every detected span in `text`.
    ///
    /// Detection repeats on the redacted text until a pass finds nothing, so
    /// scanning the output again is a no-op. Annotation spans index `text`.
    pub fn scan(&self, text: &str) -> ScanOutcome {
        let mut accepted: BTreeMap<usize, (usize, PiiCategory)> = BTreeMap::new();
        let mut view = RedactedView::build(text, &accepted);
        let mut converged = false;
        for _ in 0..MAX_PASSES {
            let found = self.detect(&view.text);
            let before = accepted.len();
            for candidate in found {
                if let Some(span) = view.to_source(&candidate.span) {
                    accepted.insert(span.start, (span.end, candidate.category));
                }
            }
            if accepted.len() == before {
                converged = true;
                break;
            }
            view = RedactedView::build(text, &accepted);
        }
        if !converged {
            log::warn!(
                "pii scan stopped before converging (passes={MAX_PASSES}, spans={})",
                accepted.len()
            );
        }

        let annotations: Vec<_> = accepted
            .into_iter()
            .map(|(start, (end, category))| RedactionAnnotation {
                category,
                span: start..end,
                replacement: category.placeholder(),
            })
            .collect();
        if !annotations.is_empty() {
            log::trace!("pii scan redacted spans (count={})", annotations.len());
        }
        ScanOutcome {
            text: view.text,
            annotations,
        }
    }

    /// One detection pass: validated, non-overlapping spans of `text` that do
    /// not touch an existing placeholder.
    fn detect(&self, text: &str) -> Vec<Candidate> {
        let existing: Vec<Range<usize>> = self
            .placeholder
            .find_iter(text)
            .map(|found| found.range())
            .collect();

        let mut candidates = Vec::new();
        for (rank, detector) in self.detectors.iter().enumerate() {
            for span in detector.spans(text) {
                if !overlaps_any(&existing, &span) {
                    candidates.push(Candidate {
                        rank,
                        category: detector.category,
                        span,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.span
                .len()
                .cmp(&a.span.len())
                .then(a.rank.cmp(&b.rank))
                .then(a.span.start.cmp(&b.span.start))
        });
        let mut kept: BTreeMap<usize, Candidate> = BTreeMap::new();
        for candidate in candidates {
            let Range { start, end } = candidate.span;
            let clashes = kept
                .range(..end)
                .next_back()
                .is_some_and(|(_, prev)| prev.span.end > start);
            if !clashes {
                kept.insert(start, candidate);
            }
        }
        kept.into_values().collect()
    }

    /// Scan bytes that may or may not be UTF-8 text.
    pub fn scan_bytes(&self, bytes: &[u8]) -> ByteScanOutcome {
        match std::str::from_utf8(bytes) {
            Ok(text) => ByteScanOutcome::Scanned(self.scan(text)),
            Err(_) => ByteScanOutcome::Unscanned(bytes.to_vec()),
        }
    }
}

/// Source text with accepted spans replaced by placeholders.
struct RedactedView {
    text: String,
    /// Unchanged stretches as `(view_start, source_start, len)`, sorted.
    kept: Vec<(usize, usize, usize)>,
}

impl RedactedView {
    fn build(source: &str, accepted: &BTreeMap<usize, (usize, PiiCategory)>) -> Self {
        let mut text = String::with_capacity(source.len());
        let mut kept = Vec::with_capacity(accepted.len() + 1);
        let mut cursor = 0;
        for (start, (end, category)) in accepted {
            kept.push((text.len(), cursor, start - cursor));
            text.push_str(&source[cursor..*start]);
            text.push_str(&category.placeholder());
            cursor = *end;
        }
        kept.push((text.len(), cursor, source.len() - cursor));
        text.push_str(&source[cursor..]);
        Self { text, kept }
    }

    /// Map a span of the view back to the source; `None` if it is not
    /// inside one unchanged stretch.
    fn to_source(&self, span: &Range<usize>) -> Option<Range<usize>> {
        let idx = self
            .kept
            .partition_point(|(view_start, _, _)| *view_start <= span.start)
            .checked_sub(1)?;
        let (view_start, source_start, len) = self.kept[idx];
        if span.end > view_start + len {
            return None;
        }
        let start = source_start + (span.start - view_start);
        Some(start..start + span.len())
    }
}

/// `ranges` must be sorted and non-overlapping.
fn overlaps_any(ranges: &[Range<usize>], span: &Range<usize>) -> bool {
    let idx = ranges.partition_point(|range| range.end <= span.start);
    ranges
        .get(idx)
        .is_some_and(|range| range.start < span.end)
}
