//! Task, run, and accounting records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{RokError, RokResult},
    ids::{ContradictionId, RunId, TaskId},
    step::StepPlan,
};

// ── Task ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Decomposed,
    Running,
    ConsistencyChecked,
    Finalized,
    NeedsClarification,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finalized | TaskStatus::NeedsClarification | TaskStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed) => true,
            (Created, Decomposed)
            | (Decomposed, Running)
            | (Running, ConsistencyChecked)
            | (ConsistencyChecked, Finalized | NeedsClarification) => true,
            _ => false,
        }
    }
}

/// A caller-provided source document (paper, report, transcript).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub content: String,
}

impl SourceDocument {
    pub fn new(source_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            uri: None,
            content: content.into(),
        }
    }
}

/// Everything a caller submits to start a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub objective: String,
    pub domain: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceDocument>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    pub steps: Vec<StepPlan>,
    /// Set when this request replays an earlier run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
}

impl TaskRequest {
    pub fn new(objective: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, plan: StepPlan) -> Self {
        self.steps.push(plan);
        self
    }

    pub fn with_source(mut self, source: SourceDocument) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    task_id: TaskId,
    objective: String,
    domain: String,
    #[serde(default)]
    context: serde_json::Value,
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    sources: Vec<SourceDocument>,
    #[serde(default)]
    inputs: serde_json::Value,
    status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    consistency_checked_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task in CREATED status from the descriptive part of a request.
    pub fn from_request(request: &TaskRequest) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            objective: request.objective.clone(),
            domain: request.domain.clone(),
            context: request.context.clone(),
            constraints: request.constraints.clone(),
            sources: request.sources.clone(),
            inputs: request.inputs.clone(),
            status: TaskStatus::Created,
            status_reason: None,
            created_at: now,
            updated_at: now,
            consistency_checked_at: None,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn context(&self) -> &serde_json::Value {
        &self.context
    }

    pub fn constraints(&self) -> &[String] {
        &self.constraints
    }

    pub fn sources(&self) -> &[SourceDocument] {
        &self.sources
    }

    pub fn inputs(&self) -> &serde_json::Value {
        &self.inputs
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn consistency_checked_at(&self) -> Option<DateTime<Utc>> {
        self.consistency_checked_at
    }

    /// Move to `next`, recording an optional reason.
    pub fn advance(&mut self, next: TaskStatus, reason: Option<String>) -> RokResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(RokError::state(format!(
                "task '{}': illegal transition {:?} -> {:?}",
                self.task_id, self.status, next
            )));
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next == TaskStatus::ConsistencyChecked {
            self.consistency_checked_at = Some(now);
        }
        if reason.is_some() {
            self.status_reason = reason;
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> RokResult<()> {
        self.advance(TaskStatus::Failed, Some(reason.into()))
    }
}

// ── Run ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finalized,
    ClarificationRequested,
    Failed,
    Cancelled,
}

/// Why the kernel declined to answer and what it would need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub reason: String,
    pub aggregate_confidence: f64,
    #[serde(default)]
    pub blocking_contradiction_ids: Vec<ContradictionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAdjustment {
    pub source: String,
    pub delta: f64,
    pub reason: String,
}

/// Cost, risk, and confidence ledger for one run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Accounting {
    pub total_cost: f64,
    pub total_risk: f64,
    pub base_confidence: f64,
    #[serde(default)]
    pub confidence_adjustments: Vec<ConfidenceAdjustment>,
    pub final_confidence: f64,
    #[serde(default)]
    pub blocked: bool,
}

impl Accounting {
    pub fn with_base(base_confidence: f64) -> Self {
        let mut ledger = Self::default();
        ledger.set_base(base_confidence);
        ledger
    }

    pub fn add_cost(&mut self, amount: f64) {
        self.total_cost += amount;
    }

    pub fn add_risk(&mut self, amount: f64) {
        self.total_risk = (self.total_risk + amount).clamp(0.0, 1.0);
    }

    pub fn set_base(&mut self, confidence: f64) {
        self.base_confidence = confidence;
        self.recompute();
    }

    pub fn adjust(&mut self, delta: f64, source: impl Into<String>, reason: impl Into<String>) {
        self.confidence_adjustments.push(ConfidenceAdjustment {
            source: source.into(),
            delta,
            reason: reason.into(),
        });
        self.recompute();
    }

    /// A blocked run carries full risk and zero confidence.
    pub fn force_block(&mut self, reason: impl Into<String>) {
        if self.final_confidence > 0.0 {
            self.confidence_adjustments.push(ConfidenceAdjustment {
                source: "policy_block".to_string(),
                delta: -self.final_confidence,
                reason: reason.into(),
            });
        }
        self.blocked = true;
        self.total_risk = 1.0;
        self.final_confidence = 0.0;
    }

    fn recompute(&mut self) {
        if self.blocked {
            self.final_confidence = 0.0;
            return;
        }
        let sum: f64 = self.confidence_adjustments.iter().map(|a| a.delta).sum();
        self.final_confidence = (self.base_confidence + sum).clamp(0.0, 1.0);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub policy_id: String,
    /// The settings the run actually used, serialized at intake.
    #[serde(default)]
    pub policy_snapshot: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationRequest>,
    #[serde(default)]
    pub accounting: Accounting,
    #[serde(default)]
    pub revision_count: u32,
}

impl Run {
    pub fn start(
        run_id: RunId,
        parent_run_id: Option<RunId>,
        policy_id: impl Into<String>,
        policy_snapshot: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            parent_run_id,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            policy_id: policy_id.into(),
            policy_snapshot,
            clarification: None,
            accounting: Accounting::default(),
            revision_count: 0,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// RUNNING → any terminal run status. A run finishes exactly once.
    pub fn finish(&mut self, status: RunStatus) -> RokResult<()> {
        if self.status != RunStatus::Running || status == RunStatus::Running {
            return Err(RokError::state(format!(
                "run '{}': illegal transition {:?} -> {:?}",
                self.run_id, self.status, status
            )));
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_walks_happy_path_and_stamps_consistency_time() {
        let mut task = Task::from_request(&TaskRequest::new("compute payment", "finance"));
        task.advance(TaskStatus::Decomposed, None).unwrap();
        task.advance(TaskStatus::Running, None).unwrap();
        assert!(task.consistency_checked_at().is_none());
        task.advance(TaskStatus::ConsistencyChecked, None).unwrap();
        assert!(task.consistency_checked_at().is_some());
        task.advance(TaskStatus::Finalized, None).unwrap();
        assert!(task.fail("late").is_err(), "terminal task must not fail again");
    }

    #[test]
    fn task_cannot_skip_consistency_check() {
        let mut task = Task::from_request(&TaskRequest::new("x", "general"));
        task.advance(TaskStatus::Decomposed, None).unwrap();
        task.advance(TaskStatus::Running, None).unwrap();
        let err = task.advance(TaskStatus::Finalized, None).unwrap_err();
        assert!(matches!(err, RokError::StateMachine { .. }));
        assert_eq!(task.status(), TaskStatus::Running);
    }

    #[test]
    fn run_finishes_once() {
        let mut run = Run::start(RunId::new(), None, "default", serde_json::Value::Null);
        run.finish(RunStatus::Cancelled).unwrap();
        assert!(run.ended_at.is_some());
        assert!(run.finish(RunStatus::Finalized).is_err());
    }

    #[test]
    fn accounting_clamps_and_blocks() {
        let mut ledger = Accounting::with_base(0.9);
        ledger.adjust(-0.2, "contradiction", "MEDIUM");
        assert!((ledger.final_confidence - 0.7).abs() < 1e-9);
        ledger.adjust(-5.0, "revision", "many");
        assert_eq!(ledger.final_confidence, 0.0);

        let mut blocked = Accounting::with_base(0.8);
        blocked.force_block("below threshold");
        assert_eq!(blocked.final_confidence, 0.0);
        assert_eq!(blocked.total_risk, 1.0);
        assert_eq!(blocked.confidence_adjustments.last().unwrap().source, "policy_block");
    }
}
