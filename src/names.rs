// 🔤 Name Normalizer - Parse and canonicalize professor names from both feeds
//
// Roster names arrive as "LAST FIRST" or "LAST, FIRST" ("HUANG L", "SMITH, JOHN").
// Ratings names arrive as "First Last" ("Lei Huang", "Dr. John Smith").
// Everything here is pure: no storage, no logging, malformed input never fails.

use serde::{Deserialize, Serialize};
use rapidfuzz::fuzz;

/// Honorifics and degrees dropped before comparing names
const TITLE_TOKENS: [&str; 8] = ["dr", "prof", "professor", "mr", "ms", "mrs", "phd", "md"];

// ============================================================================
// PARSED NAME
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedName {
    /// Lowercased last name
    pub last: String,

    /// Lowercased first name (may hold several tokens, or be empty)
    pub first: String,

    /// True iff `first` is a single alphabetic character
    pub is_initial_only: bool,
}

impl ParsedName {
    fn from_parts(last: String, first: String) -> Self {
        let is_initial_only = is_single_letter(&first);
        ParsedName {
            last,
            first,
            is_initial_only,
        }
    }

    /// Key used by the candidate index: last name with punctuation removed
    pub fn last_key(&self) -> String {
        name_key(&self.last)
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty() && self.first.is_empty()
    }
}

fn is_single_letter(s: &str) -> bool {
    let mut chars = s.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_alphabetic())
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse a roster-format name.
///
/// - "HUANG L"      → last "huang", first "l", initial-only
/// - "SMITH, JOHN"  → last "smith", first "john"
/// - "CHANG SHIYU"  → last "chang", first "shiyu"
/// - "JONES"        → last "jones", first ""
/// - "   "          → all empty
pub fn parse_roster_name(raw: &str) -> ParsedName {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ParsedName::default();
    }

    if let Some((last, first)) = trimmed.split_once(',') {
        return ParsedName::from_parts(last.trim().to_lowercase(), first.trim().to_lowercase());
    }

    let mut tokens = trimmed.split_whitespace();
    let last = tokens.next().unwrap_or_default().to_lowercase();
    let first = tokens.collect::<Vec<_>>().join(" ").to_lowercase();
    ParsedName::from_parts(last, first)
}

/// Parse a ratings-format name ("First [Middle] Last"), ignoring titles.
pub fn parse_ratings_name(raw: &str) -> ParsedName {
    let tokens = comparison_tokens(raw);
    match tokens.split_last() {
        Some((last, rest)) => ParsedName::from_parts(last.clone(), rest.join(" ")),
        None => ParsedName::default(),
    }
}

/// Is this roster name abbreviated to a first initial?
pub fn is_initial_only(raw: &str) -> bool {
    parse_roster_name(raw).is_initial_only
}

/// True iff both sides are non-empty and start with the same letter (case-insensitive)
pub fn initial_matches(initial: &str, candidate_first_name: &str) -> bool {
    match (initial.chars().next(), candidate_first_name.chars().next()) {
        (Some(a), Some(b)) => a.to_lowercase().eq(b.to_lowercase()),
        _ => false,
    }
}

// ============================================================================
// NORMALIZATION FOR COMPARISON
// ============================================================================

/// Comparison form of a free-text name.
///
/// Lowercases, drops apostrophes, turns other punctuation into spaces and
/// strips titles. Only "last, first" is reordered to "first last"; a name
/// without a comma keeps its token order. Roster names go through
/// `normalize_roster_for_compare` instead.
pub fn normalize_for_compare(name: &str) -> String {
    let reordered = match name.split_once(',') {
        Some((last, first)) => format!("{} {}", first.trim(), last.trim()),
        None => name.to_string(),
    };
    comparison_tokens(&reordered).join(" ")
}

/// "first last" form of a roster name in either roster convention
/// ("CHANG SHIYU" and "CHANG, SHIYU" both give "shiyu chang")
pub fn normalize_roster_for_compare(raw: &str) -> String {
    let name = parse_roster_name(raw);
    comparison_tokens(&format!("{} {}", name.first, name.last)).join(" ")
}

fn comparison_tokens(name: &str) -> Vec<String> {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|token| !TITLE_TOKENS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Lowercase alphanumeric-only form of a single name part
pub fn name_key(part: &str) -> String {
    part.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Token-order-invariant similarity on a 0-100 scale.
///
/// Tokens of each side are sorted before an indel ratio
/// `(|a| + |b| - indel) / (|a| + |b|)` is taken, so "smith john" and
/// "john smith" score 100. Symmetric in its arguments.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sorted_a = sorted_tokens(a);
    let sorted_b = sorted_tokens(b);

    if sorted_a.is_empty() || sorted_b.is_empty() {
        return 0.0;
    }

    indel_ratio(&sorted_a, &sorted_b)
}

/// Indel similarity of two strings on a 0-100 scale, rounded
pub fn indel_ratio(a: &str, b: &str) -> f64 {
    (fuzz::ratio(a.chars(), b.chars()) * 100.0).round()
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

// ============================================================================
// TESTS
// ============================================================================
