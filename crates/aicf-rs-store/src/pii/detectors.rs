//! Detector catalog: one regex plus a validator per entry.
//!
//! Every pattern is compiled by the `regex` crate, which searches in time
//! linear in the haystack; validators only look at the matched slice.

use super::PiiCategory;
use crate::error::StoreError;
use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::Range;

/// Post-match check applied to a candidate span.
#[derive(Debug, Clone, Copy)]
pub(super) enum Validator {
    None,
    Luhn,
    Iban,
    Ssn,
    Phone,
    Ipv4,
    Ipv6,
    Entropy(f32),
}

impl Validator {
    pub(super) fn accepts(self, candidate: &str) -> bool {
        match self {
            Self::None => true,
            Self::Luhn => luhn_valid(candidate),
            Self::Iban => iban_valid(candidate),
            Self::Ssn => ssn_valid(candidate),
            Self::Phone => phone_valid(candidate),
            Self::Ipv4 => candidate.parse::<Ipv4Addr>().is_ok(),
            Self::Ipv6 => ipv6_valid(candidate),
            Self::Entropy(threshold) => shannon_entropy(candidate) >= threshold,
        }
    }
}

/// A compiled catalog entry.
#[derive(Debug, Clone)]
pub(super) struct Detector {
    pub(super) category: PiiCategory,
    pub(super) regex: Regex,
    pub(super) validator: Validator,
}

impl Detector {
    pub(super) fn compile(
        category: PiiCategory,
        pattern: &str,
        validator: Validator,
    ) -> Result<Self, StoreError> {
        let regex = Regex::new(pattern).map_err(|err| StoreError::Regex(err.to_string()))?;
        Ok(Self {
            category,
            regex,
            validator,
        })
    }

    /// Validated spans of `text`, in match order.
    ///
    /// A digit run that fails the Luhn check is retried on its whole digit
    /// groups, so a card followed or preceded by a short number is still found.
    pub(super) fn spans(&self, text: &str) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        for captures in self.regex.captures_iter(text) {
            let Some(found) = captures.name("value").or_else(|| captures.get(0)) else {
                continue;
            };
            if found.is_empty() {
                continue;
            }
            if self.validator.accepts(found.as_str()) {
                spans.push(found.range());
            } else if matches!(self.validator, Validator::Luhn) {
                spans.extend(card_groups(found.as_str(), found.start()));
            }
        }
        spans
    }
}

/// Catalog entries, most specific first. Patterns with a `value` group
/// redact only that group.
pub(super) const CATALOG: &[(PiiCategory, &str, Validator)] = &[
    (
        PiiCategory::PrivateKey,
        r"-----BEGIN (?:[A-Z0-9]+ )*PRIVATE KEY-----[\s\S]*?-----END (?:[A-Z0-9]+ )*PRIVATE KEY-----",
        Validator::None,
    ),
    (
        PiiCategory::Jwt,
        r"\beyJ[A-Za-z0-9_-]{5,}\.eyJ[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{10,}",
        Validator::None,
    ),
    (
        PiiCategory::ApiKey,
        r"\b(?:sk-(?:proj-|ant-)?[A-Za-z0-9_-]{20,}|AKIA[0-9A-Z]{16}|gh[pousr]_[A-Za-z0-9]{36,}|xox[abposr]-[A-Za-z0-9-]{10,}|AIza[0-9A-Za-z_-]{35})\b",
        Validator::None,
    ),
    (
        PiiCategory::Credential,
        r#"(?i)\b(?:password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key)\b\s*[:=]\s*["']?(?P<value>[^\s"',;]{3,})"#,
        Validator::None,
    ),
    (
        PiiCategory::Credential,
        r"(?i)\bbearer\s+(?P<value>[A-Za-z0-9._~+/=-]{8,})",
        Validator::None,
    ),
    (
        PiiCategory::PaymentCard,
        r"\b\d(?:[ -]?\d){12,18}\b",
        Validator::Luhn,
    ),
    (
        PiiCategory::Iban,
        r"\b[A-Z]{2}\d{2}(?: ?[A-Z0-9]{4}){2,7}(?: ?[A-Z0-9]{1,3})?\b",
        Validator::Iban,
    ),
    (
        PiiCategory::Ssn,
        r"\b\d{3}-\d{2}-\d{4}\b",
        Validator::Ssn,
    ),
    (
        PiiCategory::Email,
        r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b",
        Validator::None,
    ),
    (
        PiiCategory::Phone,
        r"(?:\+1[ .-]?)?(?:\(\d{3}\)\s?|\b\d{3}[ .-])\d{3}[ .-]\d{4}\b",
        Validator::Phone,
    ),
    (
        PiiCategory::IpAddress,
        r"\b(?:\d{1,3}\.){3}\d{1,3}\b",
        Validator::Ipv4,
    ),
    (
        PiiCategory::IpAddress,
        r"(?i)\b[0-9a-f]{0,4}(?::[0-9a-f]{0,4}){2,7}\b",
        Validator::Ipv6,
    ),
    (
        PiiCategory::StreetAddress,
        r"\b\d{1,6}\s+(?:[A-Z][A-Za-z]+\s+){1,4}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way|Place|Pl|Terrace|Parkway|Pkwy)\b\.?",
        Validator::None,
    ),
];

/// Candidate run for the high-entropy secret detector.
pub(super) const SECRET_PATTERN: &str = r"[A-Za-z0-9+/=]{20,}";

fn digits(candidate: &str) -> Vec<u32> {
    candidate.chars().filter_map(|ch| ch.to_digit(10)).collect()
}

/// Payment card numbers carry a Luhn check digit.
fn luhn_valid(candidate: &str) -> bool {
    let digits = digits(candidate);
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, digit)| {
            if idx % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                *digit
            }
        })
        .sum();
    sum % 10 == 0
}

/// Byte ranges of the digit runs in `candidate`.
fn digit_groups(candidate: &str) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = None;
    for (idx, byte) in candidate.bytes().enumerate() {
        match (byte.is_ascii_digit(), start) {
            (true, None) => start = Some(idx),
            (false, Some(begin)) => {
                groups.push(begin..idx);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(begin) = start {
        groups.push(begin..candidate.len());
    }
    groups
}

/// Luhn-valid runs of whole digit groups, longest first from the left.
/// Returned spans are shifted by `offset`.
fn card_groups(candidate: &str, offset: usize) -> Vec<Range<usize>> {
    let groups = digit_groups(candidate);
    let mut spans = Vec::new();
    let mut first = 0;
    while first < groups.len() {
        let valid = (first..groups.len())
            .rev()
            .find(|&last| luhn_valid(&candidate[groups[first].start..groups[last].end]));
        match valid {
            Some(last) => {
                spans.push(offset + groups[first].start..offset + groups[last].end);
                first = last + 1;
            }
            None => first += 1,
        }
    }
    spans
}

/// ISO 13616 mod-97 check.
fn iban_valid(candidate: &str) -> bool {
    let compact: Vec<char> = candidate.chars().filter(|ch| !ch.is_whitespace()).collect();
    if !(15..=34).contains(&compact.len()) {
        return false;
    }
    let rearranged = compact[4..].iter().chain(compact[..4].iter());
    let mut remainder: u32 = 0;
    for ch in rearranged {
        let Some(value) = ch.to_digit(36) else {
            return false;
        };
        let width = if value >= 10 { 100 } else { 10 };
        remainder = (remainder * width + value) % 97;
    }
    remainder == 1
}

/// US SSN allocation rules: area not 000, 666 or 9xx; group and serial non-zero.
fn ssn_valid(candidate: &str) -> bool {
    let mut parts = candidate.split('-');
    let (Some(area), Some(group), Some(serial)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let area_ok = area != "000" && area != "666" && !area.starts_with('9');
    area_ok && group != "00" && serial != "0000"
}

/// NANP numbers: ten digits (or eleven with a leading 1), area code 2-9.
fn phone_valid(candidate: &str) -> bool {
    let digits = digits(candidate);
    let national = match digits.len() {
        10 => &digits[..],
        11 if digits[0] == 1 => &digits[1..],
        _ => return false,
    };
    national[0] >= 2 && national[3] >= 2
}

/// Parses as IPv6 and is not a short `a::b` shape common in source code.
fn ipv6_valid(candidate: &str) -> bool {
    if candidate.parse::<Ipv6Addr>().is_err() {
        return false;
    }
    let colons = candidate.matches(':').count();
    let hex_digits = candidate.chars().filter(char::is_ascii_hexdigit).count();
    colons >= 3 || hex_digits >= 5
}

/// Calculate Shannon entropy for a token string.
pub(super) fn shannon_entropy(token: &str) -> f32 {
    let mut counts = [0usize; 256];
    let bytes = token.as_bytes();
    if bytes.is_empty() {
        return 0.0;
    }
    for byte in bytes {
        counts[*byte as usize] += 1;
    }
    let len = bytes.len() as f32;
    let mut entropy = 0.0;
    for count in counts.iter().copied().filter(|count| *count > 0) {
        let p = count as f32 / len;
        entropy -= p * p.log2();
    }
    entropy
}
