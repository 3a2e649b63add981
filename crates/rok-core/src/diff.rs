//! Run diff.
//!
//! Compares two run documents step by step (matched on `step_index`) and
//! conclusion against conclusion. Ids, timestamps, and audit events are
//! metadata and never compared.

use serde::Serialize;

use rok_contracts::{
    conclusion::FinalConclusion,
    document::RunDocument,
    step::{Step, StepStatus},
    task::{RunStatus, TaskStatus},
    verify::VerificationStatus,
};

pub const EQUIVALENT_SUMMARY: &str = "Runs are equivalent except for metadata.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange<T> {
    pub before: T,
    pub after: T,
}

fn change<T: PartialEq + Clone>(before: &T, after: &T) -> Option<FieldChange<T>> {
    (before != after).then(|| FieldChange {
        before: before.clone(),
        after: after.clone(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepDiff {
    pub step_index: usize,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FieldChange<Option<StepStatus>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<FieldChange<Option<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<FieldChange<Option<VerificationStatus>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_confidence: Option<FieldChange<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_count: Option<FieldChange<usize>>,
}

impl StepDiff {
    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.output.is_none()
            && self.verification_status.is_none()
            && self.verification_confidence.is_none()
            && self.revision_count.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConclusionDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub present: Option<FieldChange<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<FieldChange<Option<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<FieldChange<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_steps: Option<FieldChange<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_status: Option<FieldChange<TaskStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_status: Option<FieldChange<RunStatus>>,
    pub steps: Vec<StepDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<ConclusionDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contradiction_count: Option<FieldChange<usize>>,
    pub summary: String,
}

impl RunDiff {
    pub fn is_equivalent(&self) -> bool {
        self.task_status.is_none()
            && self.run_status.is_none()
            && self.steps.is_empty()
            && self.conclusion.is_none()
            && self.contradiction_count.is_none()
    }
}

fn diff_step(index: usize, before: Option<&Step>, after: Option<&Step>) -> StepDiff {
    let title = after
        .or(before)
        .map(|s| s.title().to_string())
        .unwrap_or_default();
    let status = |s: Option<&Step>| s.map(Step::status);
    let output = |s: Option<&Step>| s.and_then(|s| s.current_output().map(str::to_string));
    let v_status = |s: Option<&Step>| s.and_then(|s| s.current_verification().map(|v| v.status));
    let v_conf = |s: Option<&Step>| s.and_then(|s| s.current_verification().map(|v| v.confidence));
    let revisions = |s: Option<&Step>| s.map_or(0, |s| s.revisions().len());

    StepDiff {
        step_index: index,
        title,
        status: change(&status(before), &status(after)),
        output: change(&output(before), &output(after)),
        verification_status: change(&v_status(before), &v_status(after)),
        verification_confidence: change(&v_conf(before), &v_conf(after)),
        revision_count: change(&revisions(before), &revisions(after)),
    }
}

fn diff_conclusion(before: Option<&FinalConclusion>, after: Option<&FinalConclusion>) -> Option<ConclusionDiff> {
    let content = |c: Option<&FinalConclusion>| c.map(|c| c.content.clone());
    let confidence = |c: Option<&FinalConclusion>| c.map(|c| c.confidence);
    let supported = |c: Option<&FinalConclusion>| c.map_or(0, |c| c.supported_step_ids.len());
    let diff = ConclusionDiff {
        present: change(&before.is_some(), &after.is_some()),
        content: change(&content(before), &content(after)),
        confidence: change(&confidence(before), &confidence(after)),
        supported_steps: change(&supported(before), &supported(after)),
    };
    let empty = diff.present.is_none()
        && diff.content.is_none()
        && diff.confidence.is_none()
        && diff.supported_steps.is_none();
    (!empty).then_some(diff)
}

/// Diff `after` against `before`.
pub fn diff_runs(before: &RunDocument, after: &RunDocument) -> RunDiff {
    let find = |doc: &RunDocument, i: usize| doc.steps().iter().find(|s| s.step_index() == i).cloned();
    let count = before.steps().len().max(after.steps().len());
    let steps: Vec<StepDiff> = (0..count)
        .filter_map(|i| {
            let (b, a) = (find(before, i), find(after, i));
            let d = diff_step(i, b.as_ref(), a.as_ref());
            (!d.is_empty()).then_some(d)
        })
        .collect();

    let mut diff = RunDiff {
        task_status: change(&before.task().status(), &after.task().status()),
        run_status: change(&before.run().status(), &after.run().status()),
        steps,
        conclusion: diff_conclusion(before.final_conclusion(), after.final_conclusion()),
        contradiction_count: change(&before.contradictions().len(), &after.contradictions().len()),
        summary: String::new(),
    };
    diff.summary = if diff.is_equivalent() {
        EQUIVALENT_SUMMARY.to_string()
    } else {
        let mut parts = Vec::new();
        if !diff.steps.is_empty() {
            parts.push(format!("{} step(s) differ", diff.steps.len()));
        }
        if diff.conclusion.is_some() {
            parts.push("conclusion differs".to_string());
        }
        if diff.task_status.is_some() || diff.run_status.is_some() {
            parts.push("outcome differs".to_string());
        }
        if diff.contradiction_count.is_some() {
            parts.push("contradictions differ".to_string());
        }
        format!("Runs differ: {}.", parts.join("; "))
    };
    diff
}
