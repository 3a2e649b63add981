//! The run document: the single interchange artifact for one run.
//!
//! `RunDocument` owns every entity of a run. Its fields are private and its
//! mutators apply whole-entity changes, so a caller holding the document
//! behind a lock can never observe a half-applied update.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    audit::{Audit, AuditEventType, LogEvent},
    conclusion::{Contradiction, FinalConclusion, MemoryWrite},
    error::{RokError, RokResult},
    evidence::check_unit_interval,
    ids::{EventId, StepId},
    step::{DependencyGate, Step, StepStatus},
    task::{ClarificationRequest, Run, RunStatus, Task, TaskStatus},
    RSL_VERSION,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDocument {
    rsl_version: String,
    task: Task,
    run: Run,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    contradictions: Vec<Contradiction>,
    #[serde(default)]
    final_conclusion: Option<FinalConclusion>,
    #[serde(default)]
    memory_writes: Vec<MemoryWrite>,
    #[serde(default)]
    audit: Audit,
}

impl RunDocument {
    /// Assemble a document. `steps` must already be in declaration order.
    pub fn new(task: Task, run: Run, steps: Vec<Step>) -> Self {
        Self {
            rsl_version: RSL_VERSION.to_string(),
            task,
            run,
            steps,
            contradictions: Vec::new(),
            final_conclusion: None,
            memory_writes: Vec::new(),
            audit: Audit::default(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn rsl_version(&self) -> &str {
        &self.rsl_version
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id() == id)
    }

    pub fn contradictions(&self) -> &[Contradiction] {
        &self.contradictions
    }

    pub fn final_conclusion(&self) -> Option<&FinalConclusion> {
        self.final_conclusion.as_ref()
    }

    pub fn memory_writes(&self) -> &[MemoryWrite] {
        &self.memory_writes
    }

    pub fn audit(&self) -> &Audit {
        &self.audit
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.audit.events
    }

    pub fn verified_step_ids(&self) -> BTreeSet<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status() == StepStatus::Verified)
            .map(|s| s.step_id().clone())
            .collect()
    }

    /// The dependencies that currently allow execution.
    pub fn dependency_gate(&self, waived: &BTreeSet<StepId>) -> DependencyGate {
        let mut satisfied = self.verified_step_ids();
        satisfied.extend(waived.iter().cloned());
        DependencyGate::new(satisfied)
    }

    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status().is_terminal())
    }

    // ── Mutators ─────────────────────────────────────────────────────────────

    /// Apply a transition to one step.
    pub fn with_step<R>(
        &mut self,
        id: &StepId,
        f: impl FnOnce(&mut Step) -> RokResult<R>,
    ) -> RokResult<R> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.step_id() == id)
            .ok_or_else(|| RokError::state(format!("unknown step '{id}'")))?;
        f(step)
    }

    pub fn advance_task(&mut self, next: TaskStatus, reason: Option<String>) -> RokResult<()> {
        self.task.advance(next, reason)
    }

    pub fn set_accounting(&mut self, accounting: crate::task::Accounting) {
        self.run.accounting = accounting;
    }

    pub fn set_revision_count(&mut self, count: u32) {
        self.run.revision_count = count;
    }

    /// Append an audit event, assigning the next sequence number.
    pub fn append_event(
        &mut self,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> LogEvent {
        let event = LogEvent {
            event_id: EventId::new(),
            sequence: self.audit.events.len() as u64,
            event_type,
            timestamp: chrono::Utc::now(),
            payload,
        };
        self.audit.events.push(event.clone());
        event
    }

    /// Append a contradiction. Every implicated step must exist.
    pub fn add_contradiction(&mut self, contradiction: Contradiction) -> RokResult<()> {
        if let Some(missing) = contradiction
            .step_ids
            .iter()
            .find(|id| self.step(id).is_none())
        {
            return Err(RokError::state(format!(
                "contradiction references unknown step '{missing}'"
            )));
        }
        self.contradictions.push(contradiction);
        Ok(())
    }

    /// Emit the one final conclusion and finalize task and run together.
    pub fn finalize(&mut self, conclusion: FinalConclusion) -> RokResult<()> {
        if self.final_conclusion.is_some() {
            return Err(RokError::state("final conclusion already emitted"));
        }
        check_unit_interval("confidence", conclusion.confidence)?;
        let verified = self.verified_step_ids();
        if let Some(stray) = conclusion
            .supported_step_ids
            .iter()
            .find(|id| !verified.contains(*id))
        {
            return Err(RokError::state(format!(
                "conclusion cites step '{stray}' which is not VERIFIED"
            )));
        }
        if !self.task.status().can_transition_to(TaskStatus::Finalized)
            || self.run.status() != RunStatus::Running
        {
            return Err(RokError::state(format!(
                "cannot finalize from task status {:?}",
                self.task.status()
            )));
        }

        self.task.advance(TaskStatus::Finalized, None)?;
        self.run.finish(RunStatus::Finalized)?;
        self.final_conclusion = Some(conclusion);
        Ok(())
    }

    /// End the run with a clarification request instead of an answer.
    pub fn request_clarification(&mut self, request: ClarificationRequest) -> RokResult<()> {
        if !self.task.status().can_transition_to(TaskStatus::NeedsClarification)
            || self.run.status() != RunStatus::Running
        {
            return Err(RokError::state(format!(
                "cannot request clarification from task status {:?}",
                self.task.status()
            )));
        }
        self.task
            .advance(TaskStatus::NeedsClarification, Some(request.reason.clone()))?;
        self.run.finish(RunStatus::ClarificationRequested)?;
        self.run.clarification = Some(request);
        Ok(())
    }

    /// Fail task and run. `run_status` is FAILED or CANCELLED.
    pub fn fail(&mut self, reason: impl Into<String>, run_status: RunStatus) -> RokResult<()> {
        if !matches!(run_status, RunStatus::Failed | RunStatus::Cancelled) {
            return Err(RokError::state(format!(
                "{run_status:?} is not a failure status"
            )));
        }
        if self.task.status().is_terminal() || self.run.status() != RunStatus::Running {
            return Err(RokError::state("run already finished"));
        }
        self.task.fail(reason)?;
        self.run.finish(run_status)
    }

    /// Fail every non-terminal step with `reason`. Returns the ids failed.
    pub fn fail_open_steps(&mut self, reason: &str) -> Vec<StepId> {
        let mut failed = Vec::new();
        for step in self.steps.iter_mut().filter(|s| !s.status().is_terminal()) {
            if step.fail(reason).is_ok() {
                failed.push(step.step_id().clone());
            }
        }
        failed
    }

    pub fn record_memory_writes(&mut self, writes: Vec<MemoryWrite>) {
        self.memory_writes.extend(writes);
    }

    // ── Serialization ────────────────────────────────────────────────────────

    pub fn to_json_pretty(&self) -> RokResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| RokError::Storage {
            reason: format!("failed to serialize run document: {e}"),
        })
    }

    pub fn to_value(&self) -> RokResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| RokError::Storage {
            reason: format!("failed to serialize run document: {e}"),
        })
    }

    pub fn from_json(json: &str) -> RokResult<Self> {
        serde_json::from_str(json).map_err(|e| RokError::SchemaValidation {
            reason: format!("failed to parse run document: {e}"),
        })
    }
}
