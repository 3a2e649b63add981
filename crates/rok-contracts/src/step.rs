//! Steps and the transition functions that guard them.
//!
//! A `Step` has private fields. The only way to change one is through the
//! transition methods below, each of which checks the status table and the
//! run invariants before touching any field. A method that returns `Err`
//! leaves the step exactly as it was.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{RokError, RokResult},
    evidence::{check_unit_interval, Evidence},
    ids::{EvidenceId, ExecutionId, RevisionId, StepId},
    revision::{RevisionAction, RevisionRecord},
    verify::{Verification, VerifierSpec},
};

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Created,
    Scheduled,
    EvidenceAttached,
    Executed,
    Verified,
    NeedsRevision,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Verified | StepStatus::Failed)
    }

    /// The per-step status table.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (self, next) {
            (Verified, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Created, Scheduled) => true,
            (Scheduled, EvidenceAttached | Executed | NeedsRevision) => true,
            (EvidenceAttached, EvidenceAttached | Executed | NeedsRevision) => true,
            (Executed, Verified | NeedsRevision) => true,
            (NeedsRevision, EvidenceAttached | Executed | NeedsRevision) => true,
            _ => false,
        }
    }
}

// ── Executor specification ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorKind {
    Model,
    Tool,
}

/// Reference to a prompt template. Raw prompt text is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplateRef {
    pub template_id: String,
    pub version: String,
}

impl PromptTemplateRef {
    pub fn new(template_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub kind: ExecutorKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<PromptTemplateRef>,
}

impl ExecutorSpec {
    pub fn model(name: impl Into<String>, template: PromptTemplateRef) -> Self {
        Self {
            kind: ExecutorKind::Model,
            name: name.into(),
            config: serde_json::Value::Null,
            prompt_template: Some(template),
        }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self {
            kind: ExecutorKind::Tool,
            name: name.into(),
            config: serde_json::Value::Null,
            prompt_template: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

// ── Execution record ─────────────────────────────────────────────────────────

/// One attempt at running a step's executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub execution_id: ExecutionId,
    /// 1-based attempt number within the step.
    pub attempt: u32,
    pub executor: ExecutorSpec,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<PromptTemplateRef>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_ref: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<RevisionId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

// ── Plan and dependency gate ─────────────────────────────────────────────────

/// A step as declared at task intake, before it becomes a `Step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPlan {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub step_id: Option<StepId>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    pub executor: ExecutorSpec,
    #[serde(default)]
    pub verifier: Option<VerifierSpec>,
    #[serde(default)]
    pub evidence_required: bool,
}

impl StepPlan {
    pub fn new(title: impl Into<String>, executor: ExecutorSpec) -> Self {
        Self {
            step_id: None,
            title: title.into(),
            description: String::new(),
            depends_on: Vec::new(),
            executor,
            verifier: None,
            evidence_required: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<StepId>) -> Self {
        self.step_id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| StepId::from(*s)).collect();
        self
    }

    pub fn requires_evidence(mut self) -> Self {
        self.evidence_required = true;
        self
    }

    pub fn with_verifier(mut self, verifier: VerifierSpec) -> Self {
        self.verifier = Some(verifier);
        self
    }
}

/// The set of dependency ids that currently permit execution: VERIFIED
/// steps plus any dependencies waived by policy.
#[derive(Debug, Clone, Default)]
pub struct DependencyGate {
    satisfied: BTreeSet<StepId>,
}

impl DependencyGate {
    pub fn new(satisfied: BTreeSet<StepId>) -> Self {
        Self { satisfied }
    }

    pub fn allows(&self, dependency: &StepId) -> bool {
        self.satisfied.contains(dependency)
    }
}

// ── Step ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    step_id: StepId,
    step_index: usize,
    title: String,
    #[serde(default)]
    description: String,
    depends_on: Vec<StepId>,
    executor: ExecutorSpec,
    #[serde(default)]
    verifier: VerifierSpec,
    evidence_required: bool,
    #[serde(default)]
    evidence: Vec<Evidence>,
    #[serde(default)]
    executions: Vec<StepExecution>,
    #[serde(default)]
    verifications: Vec<Verification>,
    #[serde(default)]
    revisions: Vec<RevisionRecord>,
    status: StepStatus,
    #[serde(default)]
    uncertain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ended_at: Option<DateTime<Utc>>,
}

impl Step {
    /// Materialize a plan at its declaration position. Status starts CREATED.
    pub fn from_plan(plan: StepPlan, step_index: usize) -> Self {
        Self {
            step_id: plan.step_id.unwrap_or_default(),
            step_index,
            title: plan.title,
            description: plan.description,
            depends_on: plan.depends_on,
            executor: plan.executor,
            verifier: plan.verifier.unwrap_or_default(),
            evidence_required: plan.evidence_required,
            evidence: Vec::new(),
            executions: Vec::new(),
            verifications: Vec::new(),
            revisions: Vec::new(),
            status: StepStatus::Created,
            uncertain: false,
            failure_reason: None,
            started_at: None,
            ended_at: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// `S<n>`, the 1-based logical name policies use to address steps.
    pub fn logical_id(&self) -> String {
        format!("S{}", self.step_index + 1)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn depends_on(&self) -> &[StepId] {
        &self.depends_on
    }

    pub fn executor(&self) -> &ExecutorSpec {
        &self.executor
    }

    pub fn verifier(&self) -> &VerifierSpec {
        &self.verifier
    }

    pub fn evidence_required(&self) -> bool {
        self.evidence_required
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn executions(&self) -> &[StepExecution] {
        &self.executions
    }

    pub fn verifications(&self) -> &[Verification] {
        &self.verifications
    }

    pub fn revisions(&self) -> &[RevisionRecord] {
        &self.revisions
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn is_uncertain(&self) -> bool {
        self.uncertain
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn current_execution(&self) -> Option<&StepExecution> {
        self.executions.last()
    }

    pub fn current_verification(&self) -> Option<&Verification> {
        self.verifications.last()
    }

    pub fn current_output(&self) -> Option<&str> {
        self.current_execution().map(|e| e.output.as_str())
    }

    /// Revisions that retry the step (every action except escalation).
    pub fn retry_count(&self) -> u32 {
        self.revisions.iter().filter(|r| r.action.is_retry()).count() as u32
    }

    pub fn latest_revision(&self) -> Option<&RevisionRecord> {
        self.revisions.last()
    }

    /// Constraints added by every revision so far, in the order they were added.
    pub fn accumulated_constraints(&self) -> Vec<String> {
        self.revisions
            .iter()
            .flat_map(|r| r.added_constraints.iter().cloned())
            .collect()
    }

    pub fn evidence_ids(&self) -> BTreeSet<EvidenceId> {
        self.evidence.iter().map(|e| e.evidence_id.clone()).collect()
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    fn transition(&mut self, next: StepStatus) -> RokResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(RokError::state(format!(
                "step '{}': illegal transition {:?} -> {:?}",
                self.step_id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    fn require_status(&self, allowed: &[StepStatus], operation: &str) -> RokResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(RokError::state(format!(
                "step '{}': cannot {} while {:?}",
                self.step_id, operation, self.status
            )))
        }
    }

    /// CREATED → SCHEDULED.
    pub fn schedule(&mut self) -> RokResult<()> {
        self.transition(StepStatus::Scheduled)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Attach evidence entries. Entries whose id is already on the step are
    /// skipped. Returns the number attached; the step moves to
    /// EVIDENCE_ATTACHED only when at least one entry was attached.
    pub fn attach_evidence(&mut self, items: Vec<Evidence>) -> RokResult<usize> {
        self.require_status(
            &[
                StepStatus::Scheduled,
                StepStatus::EvidenceAttached,
                StepStatus::NeedsRevision,
            ],
            "attach evidence",
        )?;
        for item in &items {
            check_unit_interval("relevance", item.relevance)?;
        }

        let mut known = self.evidence_ids();
        let fresh: Vec<Evidence> = items
            .into_iter()
            .filter(|e| known.insert(e.evidence_id.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        self.transition(StepStatus::EvidenceAttached)?;
        let count = fresh.len();
        self.evidence.extend(fresh);
        Ok(count)
    }

    /// Record an executor attempt and move to EXECUTED.
    ///
    /// `produced` is evidence the executor itself generated (tool output);
    /// it is attached in the same mutation. Fails unless every dependency is
    /// allowed by `gate`.
    pub fn record_execution(
        &mut self,
        execution: StepExecution,
        produced: Vec<Evidence>,
        gate: &DependencyGate,
    ) -> RokResult<()> {
        self.require_status(
            &[
                StepStatus::Scheduled,
                StepStatus::EvidenceAttached,
                StepStatus::NeedsRevision,
            ],
            "record execution",
        )?;
        if let Some(blocked) = self.depends_on.iter().find(|d| !gate.allows(d)) {
            return Err(RokError::state(format!(
                "step '{}': dependency '{}' is not verified",
                self.step_id, blocked
            )));
        }
        for item in &produced {
            check_unit_interval("relevance", item.relevance)?;
        }

        self.transition(StepStatus::Executed)?;
        let mut known = self.evidence_ids();
        self.evidence
            .extend(produced.into_iter().filter(|e| known.insert(e.evidence_id.clone())));
        self.executions.push(execution);
        Ok(())
    }

    /// Record a verification.
    ///
    /// `passed` moves an EXECUTED step to VERIFIED and requires a supportive
    /// status; otherwise the step moves to NEEDS_REVISION. Supportive
    /// verifications on evidence-required steps must name the evidence they
    /// checked, and every checked id must belong to this step.
    pub fn record_verification(
        &mut self,
        verification: Verification,
        passed: bool,
    ) -> RokResult<()> {
        check_unit_interval("confidence", verification.confidence)?;

        if verification.status.is_supportive()
            && self.evidence_required
            && verification.checked_evidence_ids.is_empty()
        {
            return Err(RokError::state(format!(
                "step '{}': {:?} verification requires checked evidence",
                self.step_id, verification.status
            )));
        }
        let known = self.evidence_ids();
        if let Some(stray) = verification
            .checked_evidence_ids
            .iter()
            .find(|id| !known.contains(*id))
        {
            return Err(RokError::state(format!(
                "step '{}': verification references unknown evidence '{}'",
                self.step_id, stray
            )));
        }

        if passed {
            if !verification.status.is_supportive() {
                return Err(RokError::state(format!(
                    "step '{}': {:?} cannot pass verification",
                    self.step_id, verification.status
                )));
            }
            self.require_status(&[StepStatus::Executed], "pass verification")?;
            self.transition(StepStatus::Verified)?;
        } else {
            self.transition(StepStatus::NeedsRevision)?;
        }
        self.verifications.push(verification);
        Ok(())
    }

    /// Append a revision record.
    ///
    /// Requires NEEDS_REVISION with a current, non-passing verification.
    /// A retry beyond `retry_ceiling` is refused. CHANGE_EXECUTOR swaps the
    /// executor in the same mutation; ESCALATE_UNCERTAINTY fails the step
    /// with the uncertainty flag set.
    pub fn record_revision(
        &mut self,
        record: RevisionRecord,
        retry_ceiling: u32,
    ) -> RokResult<()> {
        self.require_status(&[StepStatus::NeedsRevision], "record revision")?;
        if self.current_verification().is_none() {
            return Err(RokError::state(format!(
                "step '{}': revision without a prior verification",
                self.step_id
            )));
        }
        if record.action.is_retry() && self.retry_count() >= retry_ceiling {
            return Err(RokError::RevisionExhausted {
                step_id: self.step_id.to_string(),
                reason: format!("retry ceiling {retry_ceiling} reached"),
            });
        }

        match record.action {
            RevisionAction::ChangeExecutor => {
                let executor = record.new_executor.clone().ok_or_else(|| {
                    RokError::state(format!(
                        "step '{}': CHANGE_EXECUTOR without a new executor",
                        self.step_id
                    ))
                })?;
                self.executor = executor;
            }
            RevisionAction::EscalateUncertainty => {
                self.transition(StepStatus::Failed)?;
                self.uncertain = true;
                self.failure_reason = Some(format!("uncertainty escalated: {}", record.reason));
            }
            RevisionAction::FetchMoreEvidence | RevisionAction::ReexecuteStep => {}
        }

        self.revisions.push(record);
        Ok(())
    }

    /// Fail a non-terminal step with `reason`.
    pub fn fail(&mut self, reason: impl Into<String>) -> RokResult<()> {
        self.transition(StepStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
