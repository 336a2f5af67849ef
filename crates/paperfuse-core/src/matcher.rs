//! Pure title matching. Used both for paper-to-source matching and for
//! paper-to-paper deduplication; no I/O, unit-testable in isolation.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Trailing bracketed tag, e.g. "(extended abstract)" or "[J]".
static TRAILING_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[\(\[][^\)\]]*[\)\]]\s*$").expect("valid regex"));

const WEIGHT_TOKEN_SORT: f64 = 0.4;
const WEIGHT_TOKEN_SUBSET: f64 = 0.3;
const WEIGHT_SUBSTRING: f64 = 0.2;
const WEIGHT_EDIT: f64 = 0.1;

const HIGH_THRESHOLD: f64 = 0.95;
const MEDIUM_THRESHOLD: f64 = 0.85;
const LOW_THRESHOLD: f64 = 0.7;

/// Floor of the author penalty at zero overlap; interpolates linearly up to
/// 1.0 at full overlap.
const AUTHOR_PENALTY_FLOOR: f64 = 0.3;

/// Discretized confidence bucket derived from the similarity score.
///
/// Callers treating a match as "same paper" for fully automatic actions
/// should require at least `High`; deduplication merges should additionally
/// require a non-empty author overlap at `Medium` or better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    NoMatch,
    Low,
    Medium,
    High,
    Exact,
}

/// Which safety checks fired while scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchEvidence {
    /// Normalized titles were byte-identical.
    pub normalized_equal: bool,
    /// Years were both known and differed by more than one.
    pub year_penalty: bool,
    /// Author overlap ratio, when the author check was applied.
    pub author_overlap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub score: f64,
    pub tier: MatchTier,
    pub evidence: MatchEvidence,
}

impl MatchResult {
    fn no_match() -> Self {
        Self {
            score: 0.0,
            tier: MatchTier::NoMatch,
            evidence: MatchEvidence::default(),
        }
    }
}

/// One side of a comparison. Years and authors are optional safety signals.
#[derive(Debug, Clone, Copy)]
pub struct MatchCandidate<'a> {
    pub title: &'a str,
    pub year: Option<i32>,
    pub authors: &'a [String],
}

impl<'a> MatchCandidate<'a> {
    pub fn title_only(title: &'a str) -> Self {
        Self {
            title,
            year: None,
            authors: &[],
        }
    }
}

/// Score two candidates. Bounded to [0, 1].
pub fn score(a: &MatchCandidate<'_>, b: &MatchCandidate<'_>) -> MatchResult {
    let title_a = normalize_title(a.title);
    let title_b = normalize_title(b.title);
    if title_a.is_empty() || title_b.is_empty() {
        return MatchResult::no_match();
    }

    let mut evidence = MatchEvidence::default();

    let mut score;
    let mut tier;
    if title_a == title_b {
        evidence.normalized_equal = true;
        score = 1.0;
        tier = MatchTier::Exact;
    } else {
        score = weighted_similarity(&title_a, &title_b);

        // Author check: only worth applying when the titles alone would
        // already claim a match, to bound false-positive merges of distinct
        // papers with generically similar titles.
        if score > LOW_THRESHOLD && !a.authors.is_empty() && !b.authors.is_empty() {
            let overlap = author_overlap(a.authors, b.authors);
            evidence.author_overlap = Some(overlap);
            score *= AUTHOR_PENALTY_FLOOR + (1.0 - AUTHOR_PENALTY_FLOOR) * overlap;
        }

        tier = assign_tier(score);
    }

    // Year check applies even to exact title matches: a five-year gap between
    // otherwise identical titles is a republication or a different paper.
    if let (Some(year_a), Some(year_b)) = (a.year, b.year)
        && (year_a - year_b).abs() > 1
    {
        evidence.year_penalty = true;
        score /= 2.0;
        tier = assign_tier(score).min(MatchTier::Low);
    }

    MatchResult {
        score,
        tier,
        evidence,
    }
}

/// Whether a result is safe to act on without human review when matching a
/// paper against a source lookup.
pub fn is_confident_source_match(result: &MatchResult) -> bool {
    result.tier >= MatchTier::High
}

fn assign_tier(score: f64) -> MatchTier {
    if score >= HIGH_THRESHOLD {
        MatchTier::High
    } else if score >= MEDIUM_THRESHOLD {
        MatchTier::Medium
    } else if score > LOW_THRESHOLD {
        MatchTier::Low
    } else {
        MatchTier::NoMatch
    }
}

/// Lowercase, strip trailing bracketed tags, collapse punctuation and
/// whitespace to single spaces.
pub fn normalize_title(title: &str) -> String {
    let mut lowered = title.to_lowercase();
    loop {
        let stripped = TRAILING_TAG_RE.replace(&lowered, "").to_string();
        if stripped == lowered {
            break;
        }
        lowered = stripped;
    }

    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn weighted_similarity(a: &str, b: &str) -> f64 {
    let combined = WEIGHT_TOKEN_SORT * token_sort_similarity(a, b)
        + WEIGHT_TOKEN_SUBSET * token_subset_similarity(a, b)
        + WEIGHT_SUBSTRING * substring_similarity(a, b)
        + WEIGHT_EDIT * strsim::normalized_levenshtein(a, b);
    combined.clamp(0.0, 1.0)
}

/// Order-insensitive: edit similarity over the sorted token joins.
fn token_sort_similarity(a: &str, b: &str) -> f64 {
    let mut tokens_a: Vec<&str> = a.split_whitespace().collect();
    let mut tokens_b: Vec<&str> = b.split_whitespace().collect();
    tokens_a.sort_unstable();
    tokens_b.sort_unstable();
    strsim::normalized_levenshtein(&tokens_a.join(" "), &tokens_b.join(" "))
}

/// Subset-tolerant: shared tokens over the smaller token multiset, so a title
/// extended with a subtitle still scores well against its base form.
fn token_subset_similarity(a: &str, b: &str) -> f64 {
    let mut counts_a: BTreeMap<&str, usize> = BTreeMap::new();
    for token in a.split_whitespace() {
        *counts_a.entry(token).or_default() += 1;
    }
    let len_a: usize = counts_a.values().sum();
    let len_b = b.split_whitespace().count();
    if len_a == 0 || len_b == 0 {
        return 0.0;
    }

    let mut shared = 0usize;
    for token in b.split_whitespace() {
        if let Some(remaining) = counts_a.get_mut(token)
            && *remaining > 0
        {
            *remaining -= 1;
            shared += 1;
        }
    }
    shared as f64 / len_a.min(len_b) as f64
}

/// Substring-tolerant: full containment scores by length ratio; otherwise the
/// longest common contiguous run scores against the longer string.
fn substring_similarity(a: &str, b: &str) -> f64 {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if longer.is_empty() {
        return 0.0;
    }
    if longer.contains(shorter) {
        return shorter.chars().count() as f64 / longer.chars().count() as f64;
    }
    longest_common_substring(a, b) as f64 / longer.chars().count() as f64
}

fn longest_common_substring(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut previous = vec![0usize; b.len() + 1];
    let mut best = 0usize;
    for &ch_a in &a {
        let mut current = vec![0usize; b.len() + 1];
        for (j, &ch_b) in b.iter().enumerate() {
            if ch_a == ch_b {
                current[j + 1] = previous[j] + 1;
                best = best.max(current[j + 1]);
            }
        }
        previous = current;
    }
    best
}

/// Fraction of overlapping authors between the two lists, over the smaller
/// list. Authors match on last name plus a compatible first initial.
fn author_overlap(authors_a: &[String], authors_b: &[String]) -> f64 {
    let normalized_a: Vec<_> = authors_a.iter().filter_map(|a| normalize_author(a)).collect();
    let mut normalized_b: Vec<_> = authors_b.iter().filter_map(|a| normalize_author(a)).collect();
    if normalized_a.is_empty() || normalized_b.is_empty() {
        return 0.0;
    }

    let smaller = normalized_a.len().min(normalized_b.len());
    let mut matched = 0usize;
    for author in &normalized_a {
        if let Some(pos) = normalized_b.iter().position(|other| authors_match(author, other)) {
            normalized_b.swap_remove(pos);
            matched += 1;
        }
    }
    matched as f64 / smaller as f64
}

fn authors_match(a: &(Option<char>, String), b: &(Option<char>, String)) -> bool {
    if a.1 != b.1 {
        return false;
    }
    match (a.0, b.0) {
        (Some(initial_a), Some(initial_b)) => initial_a == initial_b,
        _ => true,
    }
}

/// Normalize an author name to a (first-initial, last-name) pair. Handles
/// "Last, First", "First Last", and initialed forms like "A. Vaswani".
fn normalize_author(raw: &str) -> Option<(Option<char>, String)> {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == ',' {
                c
            } else {
                ' '
            }
        })
        .collect();

    if let Some((last, first)) = cleaned.split_once(',') {
        let last = last.split_whitespace().last()?.to_string();
        let initial = first.split_whitespace().next().and_then(|t| t.chars().next());
        return Some((initial, last));
    }

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    match tokens.as_slice() {
        [] => None,
        [only] => Some((None, (*only).to_string())),
        [first, .., last] => Some((first.chars().next(), (*last).to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn identical_after_normalization_is_exact() {
        let result = score(
            &MatchCandidate::title_only("Deep Learning"),
            &MatchCandidate::title_only("deep   learning"),
        );
        assert_eq!(result.tier, MatchTier::Exact);
        assert_eq!(result.score, 1.0);
        assert!(result.evidence.normalized_equal);
    }

    #[test]
    fn trailing_bracketed_tags_are_stripped() {
        assert_eq!(
            normalize_title("Attention Is All You Need (Extended Abstract)"),
            "attention is all you need"
        );
        assert_eq!(
            normalize_title("Attention Is All You Need [Preprint] (v2)"),
            "attention is all you need"
        );
    }

    #[test]
    fn empty_title_is_no_match() {
        let result = score(
            &MatchCandidate::title_only(""),
            &MatchCandidate::title_only("Deep Learning"),
        );
        assert_eq!(result.tier, MatchTier::NoMatch);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn year_gap_caps_tier_at_low_even_for_identical_titles() {
        let a = MatchCandidate {
            title: "Neural Machine Translation",
            year: Some(2015),
            authors: &[],
        };
        let b = MatchCandidate {
            title: "Neural Machine Translation",
            year: Some(2020),
            authors: &[],
        };
        let result = score(&a, &b);
        assert!(result.tier <= MatchTier::Low);
        assert!(result.evidence.year_penalty);
        assert_eq!(result.score, 0.5);
    }

    #[test]
    fn adjacent_years_are_not_penalized() {
        let a = MatchCandidate {
            title: "Neural Machine Translation",
            year: Some(2016),
            authors: &[],
        };
        let b = MatchCandidate {
            title: "Neural Machine Translation",
            year: Some(2017),
            authors: &[],
        };
        let result = score(&a, &b);
        assert_eq!(result.tier, MatchTier::Exact);
        assert!(!result.evidence.year_penalty);
    }

    #[test]
    fn disjoint_authors_take_the_floor_penalty() {
        let authors_a = owned(&["Alice Anders", "Bob Brown"]);
        let authors_b = owned(&["Carol Clark", "Dan Drake"]);
        let a = MatchCandidate {
            title: "Efficient Transformers: A Survey",
            year: None,
            authors: &authors_a,
        };
        let b = MatchCandidate {
            title: "Efficient Transformers: A Review",
            year: None,
            authors: &authors_b,
        };
        let with_authors = score(&a, &b);
        let without_authors = score(
            &MatchCandidate::title_only(a.title),
            &MatchCandidate::title_only(b.title),
        );

        assert_eq!(with_authors.evidence.author_overlap, Some(0.0));
        let expected = without_authors.score * AUTHOR_PENALTY_FLOOR;
        assert!((with_authors.score - expected).abs() < 1e-9);
        assert!(with_authors.tier < MatchTier::High);
        assert!(!is_confident_source_match(&with_authors));
    }

    #[test]
    fn full_author_overlap_is_not_penalized() {
        let authors_a = owned(&["Vaswani, Ashish", "Noam Shazeer"]);
        let authors_b = owned(&["A. Vaswani", "N. Shazeer"]);
        let a = MatchCandidate {
            title: "Attention Is All You Need",
            year: Some(2017),
            authors: &authors_a,
        };
        let b = MatchCandidate {
            title: "Attention Is All You Need (Extended Abstract)",
            year: Some(2017),
            authors: &authors_b,
        };
        let result = score(&a, &b);
        assert_eq!(result.tier, MatchTier::Exact);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn subtitle_extension_scores_above_low() {
        let result = score(
            &MatchCandidate::title_only("Generative Adversarial Networks"),
            &MatchCandidate::title_only("Generative Adversarial Networks: An Overview"),
        );
        assert!(result.score > LOW_THRESHOLD, "score {}", result.score);
    }

    #[test]
    fn unrelated_titles_do_not_match() {
        let result = score(
            &MatchCandidate::title_only("Quantum Error Correction Codes"),
            &MatchCandidate::title_only("A Study of Soil Erosion in River Deltas"),
        );
        assert_eq!(result.tier, MatchTier::NoMatch);
    }

    #[test]
    fn author_normalization_handles_comma_and_initial_forms() {
        assert_eq!(
            normalize_author("Vaswani, Ashish"),
            Some((Some('a'), "vaswani".to_string()))
        );
        assert_eq!(
            normalize_author("A. Vaswani"),
            Some((Some('a'), "vaswani".to_string()))
        );
        assert_eq!(
            normalize_author("Ashish Vaswani"),
            Some((Some('a'), "vaswani".to_string()))
        );
        assert_eq!(normalize_author("Cher"), Some((None, "cher".to_string())));
        assert_eq!(normalize_author("  "), None);
    }

    #[test]
    fn identical_candidates_clear_the_confidence_gate() {
        let authors = owned(&["Alice Anders"]);
        let a = MatchCandidate {
            title: "Graph Neural Networks for Molecules",
            year: Some(2021),
            authors: &authors,
        };
        let b = MatchCandidate {
            title: "Graph Neural Networks for Molecules",
            year: Some(2021),
            authors: &authors,
        };
        assert!(is_confident_source_match(&score(&a, &b)));
    }
}
