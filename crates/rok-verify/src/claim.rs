//! Claim support: does attached evidence back the figure and subject of a
//! step's output?
//!
//! Percentages are compared first. When the claim states a percentage and an
//! evidence sentence about the same subject states one too:
//!
//! | relation                          | status                |
//! |-----------------------------------|-----------------------|
//! | equal                             | SUPPORTED 0.95        |
//! | within 25% of the evidence figure | PARTIALLY_SUPPORTED 0.78 |
//! | further apart, or polarity flips  | CONTRADICTED 0.3      |
//!
//! Without comparable figures, subject-token overlap decides: at least 0.6 is
//! SUPPORTED 0.85, at least 0.3 is PARTIALLY_SUPPORTED 0.6, anything less is
//! WEAK 0.3. Evidence limited to "in the X setting" that the claim does not
//! repeat caps a SUPPORTED verdict at PARTIALLY_SUPPORTED.

use std::sync::OnceLock;

use regex::Regex;

use rok_contracts::{evidence::Evidence, verify::VerificationStatus};
use rok_core::text::{
    first_percentage, is_negated, jaccard, keyword_relevance, percentages, split_sentences,
    subject_tokens,
};

/// Relative gap between claimed and evidenced figures still read as partial
/// support.
pub const PARTIAL_FIGURE_TOLERANCE: f64 = 0.25;

const FIGURE_EPSILON: f64 = 1e-9;

fn scope_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bin the ([a-z][a-z\- ]*?) (?:setting|population|cohort)\b")
            .expect("scope pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimSupport {
    pub status: VerificationStatus,
    pub confidence: f64,
    pub issues: Vec<String>,
}

impl ClaimSupport {
    fn new(status: VerificationStatus, confidence: f64) -> Self {
        Self {
            status,
            confidence,
            issues: Vec::new(),
        }
    }

    fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }
}

/// Every sentence of every evidence item, in attachment order.
fn evidence_sentences(evidence: &[Evidence]) -> Vec<String> {
    evidence
        .iter()
        .flat_map(|e| {
            let sentences = split_sentences(&e.content);
            if sentences.is_empty() && !e.content.trim().is_empty() {
                vec![e.content.trim().to_string()]
            } else {
                sentences
            }
        })
        .collect()
}

/// Judge how well `evidence` supports `claim`.
pub fn assess(claim: &str, evidence: &[Evidence]) -> ClaimSupport {
    let sentences = evidence_sentences(evidence);
    if sentences.is_empty() {
        return ClaimSupport::new(VerificationStatus::Unknown, 0.0)
            .with_issue("no evidence text to compare against");
    }
    let subject = subject_tokens(claim);

    let figure = first_percentage(claim).and_then(|claimed| {
        best_by_subject(&subject, sentences.iter().filter(|s| !percentages(s).is_empty()))
            .map(|sentence| (claimed, sentence))
    });

    let (support, anchor) = match figure {
        Some((claimed, sentence)) => (compare_figures(claim, claimed, sentence), sentence.as_str()),
        None => {
            let (support, sentence) = overlap_support(&subject, &sentences);
            let support = if first_percentage(claim).is_some() && support.status == VerificationStatus::Supported {
                ClaimSupport::new(VerificationStatus::PartiallySupported, 0.6)
                    .with_issue("evidence states no figure to confirm the claimed percentage")
            } else {
                support
            };
            (support, sentence)
        }
    };

    apply_scope(support, claim, anchor)
}

/// The sentence sharing the most subject tokens with the claim. Ties go to
/// the earlier sentence.
fn best_by_subject<'a>(
    subject: &std::collections::BTreeSet<String>,
    candidates: impl Iterator<Item = &'a String>,
) -> Option<&'a String> {
    let mut best: Option<(&String, f64)> = None;
    for sentence in candidates {
        let score = jaccard(subject, &subject_tokens(sentence));
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((sentence, score));
        }
    }
    best.map(|(s, _)| s)
}

fn compare_figures(claim: &str, claimed: f64, sentence: &str) -> ClaimSupport {
    let Some(shown) = first_percentage(sentence) else {
        return ClaimSupport::new(VerificationStatus::Weak, 0.3);
    };
    if is_negated(claim) != is_negated(sentence) {
        return ClaimSupport::new(VerificationStatus::Contradicted, 0.3)
            .with_issue(format!("claim polarity differs from evidence: '{sentence}'"));
    }
    let gap = (claimed - shown).abs();
    if gap < FIGURE_EPSILON {
        return ClaimSupport::new(VerificationStatus::Supported, 0.95);
    }
    let relative = gap / shown.abs().max(FIGURE_EPSILON);
    let issue = format!("claim states {claimed}% but evidence shows {shown}%");
    if relative <= PARTIAL_FIGURE_TOLERANCE {
        ClaimSupport::new(VerificationStatus::PartiallySupported, 0.78).with_issue(issue)
    } else {
        ClaimSupport::new(VerificationStatus::Contradicted, 0.3).with_issue(issue)
    }
}

fn overlap_support<'a>(
    subject: &std::collections::BTreeSet<String>,
    sentences: &'a [String],
) -> (ClaimSupport, &'a str) {
    let mut best = (0.0, sentences[0].as_str());
    for sentence in sentences {
        let (_, score) = keyword_relevance(subject, sentence);
        if score > best.0 {
            best = (score, sentence.as_str());
        }
    }
    let (overlap, sentence) = best;
    let support = if overlap >= 0.6 {
        ClaimSupport::new(VerificationStatus::Supported, 0.85)
    } else if overlap >= 0.3 {
        ClaimSupport::new(VerificationStatus::PartiallySupported, 0.6)
            .with_issue(format!("evidence only partly addresses the claim (overlap {overlap:.2})"))
    } else {
        ClaimSupport::new(VerificationStatus::Weak, 0.3)
            .with_issue(format!("evidence does not address the claim (overlap {overlap:.2})"))
    };
    (support, sentence)
}

fn apply_scope(mut support: ClaimSupport, claim: &str, sentence: &str) -> ClaimSupport {
    let Some(scope) = scope_pattern().find(sentence) else {
        return support;
    };
    let phrase = scope.as_str();
    let qualifier = phrase.to_lowercase();
    let qualifier = qualifier.trim_start_matches("in the ").trim();
    if claim.to_lowercase().contains(qualifier) {
        return support;
    }
    support.issues.push(format!("Scope limitation: '{phrase}'"));
    if support.status == VerificationStatus::Supported {
        support.status = VerificationStatus::PartiallySupported;
        support.confidence = support.confidence.min(0.78);
    }
    support
}
