//! Deterministic text heuristics shared by the consistency checker, the
//! rule verifier, and the reference retriever.

use std::{collections::BTreeSet, sync::OnceLock};

use regex::Regex;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "on", "in", "by", "to", "for", "and", "or", "is", "was", "are",
    "were", "be", "with", "as", "at", "that", "this", "it", "its", "from", "percent",
];

/// Tokens that flip the polarity of a claim. Apostrophes are stripped by
/// `tokenize`, so "doesn't" arrives as "doesn" + "t".
const NEGATIONS: &[&str] = &[
    "not", "no", "never", "cannot", "none", "neither", "nor", "without", "doesn", "didn",
    "isn", "wasn", "aren", "weren", "won",
];

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:percent|%)").expect("percent pattern is valid")
    })
}

/// Lowercase word tokens with punctuation removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

pub fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Tokens that identify what a claim is about: no numbers, stopwords, or
/// negation markers.
pub fn subject_tokens(text: &str) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOPWORDS.contains(&t.as_str()) && !NEGATIONS.contains(&t.as_str()))
        .collect()
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    shared / union
}

pub fn is_negated(text: &str) -> bool {
    tokenize(text)
        .iter()
        .any(|t| NEGATIONS.contains(&t.as_str()))
}

/// Split on `.`, `!`, or `?` followed by whitespace. Whitespace inside each
/// sentence is collapsed; empty sentences are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if boundary {
            push_sentence(&mut sentences, &current);
            current.clear();
        }
    }
    push_sentence(&mut sentences, &current);
    sentences
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if !cleaned.is_empty() {
        out.push(cleaned);
    }
}

/// Every percentage in `text`, in order of appearance.
pub fn percentages(text: &str) -> Vec<f64> {
    percent_pattern()
        .captures_iter(text)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect()
}

pub fn first_percentage(text: &str) -> Option<f64> {
    percentages(text).into_iter().next()
}

/// Fraction of query tokens present in `candidate`, rounded to 3 places.
pub fn keyword_relevance(query: &BTreeSet<String>, candidate: &str) -> (usize, f64) {
    if query.is_empty() {
        return (0, 0.0);
    }
    let overlap = token_set(candidate).intersection(query).count();
    let score = overlap as f64 / query.len() as f64;
    (overlap, (score * 1000.0).round() / 1000.0)
}
