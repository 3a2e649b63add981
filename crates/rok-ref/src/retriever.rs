//! Keyword retriever over the task's source documents.

use async_trait::async_trait;
use tracing::debug;

use rok_contracts::{
    error::RokResult,
    evidence::{Evidence, SourceRef, SourceType},
};
use rok_core::{
    text::{keyword_relevance, split_sentences, token_set},
    traits::{EvidenceSource, StepView},
};

/// Ranks source sentences by keyword overlap with the step's query and
/// returns the top `k`. Round `n` returns the next `k` after the first
/// `n * k`, so a refetch always offers new sentences.
#[derive(Debug, Clone)]
pub struct SentenceRetriever {
    k: usize,
}

impl Default for SentenceRetriever {
    fn default() -> Self {
        Self { k: 3 }
    }
}

impl SentenceRetriever {
    pub fn new(k: usize) -> Self {
        Self { k: k.max(1) }
    }

    /// What the step is about: its dependency results, else the
    /// `paragraph` input, else the objective and step title.
    pub fn query(step: &StepView) -> String {
        if !step.dependency_outputs.is_empty() {
            return step
                .dependency_outputs
                .iter()
                .map(|(_, out)| out.as_str())
                .collect::<Vec<_>>()
                .join(" ");
        }
        if let Some(paragraph) = step.inputs.get("paragraph").and_then(|p| p.as_str()) {
            return paragraph.to_string();
        }
        format!("{} {}", step.objective, step.title)
    }
}

#[async_trait]
impl EvidenceSource for SentenceRetriever {
    async fn gather(&self, step: &StepView, round: u32) -> RokResult<Vec<Evidence>> {
        let query = token_set(&Self::query(step));

        // (overlap, score, position, source index, sentence)
        let mut ranked = Vec::new();
        let mut position = 0usize;
        for (source_index, source) in step.sources.iter().enumerate() {
            for sentence in split_sentences(&source.content) {
                let (overlap, score) = keyword_relevance(&query, &sentence);
                if overlap > 0 {
                    ranked.push((overlap, score, position, source_index, sentence));
                }
                position += 1;
            }
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.2.cmp(&b.2)));

        let skip = (round as usize).saturating_mul(self.k);
        let mut out = Vec::new();
        for (_, score, _, source_index, sentence) in ranked.into_iter().skip(skip).take(self.k) {
            let source = &step.sources[source_index];
            out.push(Evidence::new(
                SourceRef {
                    source_type: SourceType::Document,
                    source_id: source.source_id.clone(),
                    uri: source.uri.clone(),
                },
                sentence,
                score,
            )?);
        }
        debug!(step_id = %step.step_id, round, candidates = out.len(), "sentences retrieved");
        Ok(out)
    }
}
