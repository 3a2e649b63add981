//! Per-step pipeline.
//!
//! Bind → Execute → Verify, with the revision controller deciding where to
//! re-enter. The loop is an explicit stage machine so the revision depth is
//! bounded by an iteration guard rather than by the call stack.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, warn};

use rok_contracts::{
    audit::AuditEventType,
    error::{RokError, RokResult},
    ids::{RevisionId, StepId},
    policy::RevisionTrigger,
    step::StepStatus,
    verify::Verification,
};

use crate::{
    binder::{self, BindOutcome},
    context::{RunContext, ABSOLUTE_MAX_RETRIES_PER_STEP},
    coordinator::{self, Verifiers},
    dispatcher::{self, Executors},
    revision::{self, Reentry},
    store::RunStore,
    trail::AuditTrail,
    traits::{EvidenceSource, PolicyGate},
};

/// Upper bound on stage transitions for a single step. Each retry walks at
/// most four stages, so this is never reached while the ceilings hold.
pub const MAX_STAGE_ITERATIONS: u32 = (ABSOLUTE_MAX_RETRIES_PER_STEP + 1) * 4 + 4;

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Bind { revision_id: Option<RevisionId> },
    Execute { revision_id: Option<RevisionId> },
    Verify { revision_id: Option<RevisionId> },
    Revise { trigger: RevisionTrigger },
    Done,
}

/// Everything one step's pipeline needs. Cloned into each spawned worker.
#[derive(Clone)]
pub struct StepWorker {
    pub executors: Executors,
    pub verifiers: Verifiers,
    pub evidence: Option<Arc<dyn EvidenceSource>>,
    pub gate: Arc<dyn PolicyGate>,
    pub ctx: Arc<RunContext>,
    pub store: RunStore,
    pub trail: AuditTrail,
}

impl StepWorker {
    /// Drive `step_id` from SCHEDULED to VERIFIED or FAILED.
    ///
    /// Returns the terminal status. The only error is `Cancelled`; the step
    /// is left for the kernel to fail.
    pub async fn run(&self, step_id: &StepId) -> RokResult<StepStatus> {
        let mut stage = Stage::Bind { revision_id: None };
        let mut round = 0u32;
        let mut iterations = 0u32;

        loop {
            if self.ctx.is_cancelled() {
                return Err(RokError::Cancelled {
                    reason: format!("step '{step_id}' interrupted"),
                });
            }
            iterations += 1;
            if iterations > MAX_STAGE_ITERATIONS {
                error!(run_id = %self.ctx.run_id, step_id = %step_id, "stage iteration guard tripped");
                return self.fail(step_id, "revision loop exceeded its iteration guard");
            }

            let next = match self.advance(step_id, stage, &mut round).await {
                Ok(next) => next,
                Err(e @ RokError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    warn!(run_id = %self.ctx.run_id, step_id = %step_id, error = %e, "step pipeline error");
                    return self.fail(step_id, &e.to_string());
                }
            };

            if next == Stage::Done {
                return Ok(self.status(step_id));
            }
            stage = next;
        }
    }

    async fn advance(&self, step_id: &StepId, stage: Stage, round: &mut u32) -> RokResult<Stage> {
        let (ctx, store, trail) = (self.ctx.as_ref(), &self.store, &self.trail);
        match stage {
            Stage::Bind { revision_id } => {
                let outcome = binder::gather_and_bind(
                    ctx,
                    store,
                    trail,
                    self.evidence.as_ref(),
                    step_id,
                    *round,
                )
                .await?;
                match outcome {
                    BindOutcome::Attached(_) | BindOutcome::NothingAttached => {
                        Ok(Stage::Execute { revision_id })
                    }
                    BindOutcome::Insufficient { reason } => {
                        let issue = format!("evidence insufficient: {reason}");
                        self.record_unknown(step_id, issue, revision_id)?;
                        Ok(Stage::Revise {
                            trigger: RevisionTrigger::EvidenceInsufficient,
                        })
                    }
                }
            }
            Stage::Execute { revision_id } => {
                match dispatcher::execute(&self.executors, ctx, store, trail, step_id, revision_id.clone())
                    .await
                {
                    Ok(_) => Ok(Stage::Verify { revision_id }),
                    Err(e) if e.is_executor_failure() => {
                        self.record_unknown(step_id, e.to_string(), revision_id)?;
                        Ok(Stage::Revise {
                            trigger: RevisionTrigger::ExecutorFailure,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            Stage::Verify { revision_id } => {
                let outcome =
                    coordinator::verify(&self.verifiers, ctx, store, trail, step_id, revision_id).await?;
                if outcome.passed {
                    Ok(Stage::Done)
                } else {
                    Ok(Stage::Revise {
                        trigger: RevisionTrigger::VerificationBelowThreshold,
                    })
                }
            }
            Stage::Revise { trigger } => {
                let next = revision::revise(self.gate.as_ref(), ctx, store, trail, step_id, trigger, *round)?;
                Ok(match next {
                    Reentry::Bind {
                        round: next_round,
                        revision_id,
                    } => {
                        *round = next_round;
                        Stage::Bind {
                            revision_id: Some(revision_id),
                        }
                    }
                    Reentry::Execute { revision_id } => Stage::Execute {
                        revision_id: Some(revision_id),
                    },
                    Reentry::Escalated => Stage::Done,
                })
            }
            Stage::Done => Ok(Stage::Done),
        }
    }

    /// Record the kernel's UNKNOWN verdict when no verifier judgement exists.
    fn record_unknown(
        &self,
        step_id: &StepId,
        issue: String,
        revision_id: Option<RevisionId>,
    ) -> RokResult<()> {
        let verification = Verification::kernel_unknown(issue).with_revision(revision_id);
        let payload = json!({
            "step_id": step_id,
            "status": verification.status,
            "confidence": verification.confidence,
            "issues": verification.issues,
            "revision_id": verification.revision_id,
        });
        self.store
            .write(|doc| doc.with_step(step_id, |s| s.record_verification(verification, false)))?;
        self.trail.record(AuditEventType::VerificationFailed, payload);
        Ok(())
    }

    fn fail(&self, step_id: &StepId, reason: &str) -> RokResult<StepStatus> {
        let failed = self.store.write(|doc| {
            doc.with_step(step_id, |s| {
                if s.status().is_terminal() {
                    Ok(false)
                } else {
                    s.fail(reason).map(|_| true)
                }
            })
        })?;
        if failed {
            self.trail.record(
                AuditEventType::StepFailed,
                json!({ "step_id": step_id, "uncertain": false, "reason": reason }),
            );
        }
        debug!(run_id = %self.ctx.run_id, step_id = %step_id, reason, "step failed");
        Ok(self.status(step_id))
    }

    fn status(&self, step_id: &StepId) -> StepStatus {
        self.store.read(|doc| {
            doc.step(step_id)
                .map(|s| s.status())
                .unwrap_or(StepStatus::Failed)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use rok_contracts::{
        document::RunDocument,
        evidence::{Evidence, SourceRef, SourceType},
        ids::RunId,
        policy::{PolicyContext, PolicyDecision, PolicySettings},
        revision::RevisionAction,
        step::{ExecutorSpec, PromptTemplateRef, Step, StepPlan},
        task::{Run, Task, TaskRequest},
        verify::VerificationStatus,
    };

    use crate::traits::{
        Judgement, ModelAdapter, ModelRequest, ModelResponse, StepVerifier, StepView, ToolInterface,
        ToolResponse,
    };

    // ── Mock helpers ─────────────────────────────────────────────────────────

    /// Fails the first `failures` calls, then answers.
    struct FlakyModel {
        failures: Mutex<u32>,
        calls: Arc<Mutex<Vec<ModelRequest>>>,
    }

    #[async_trait]
    impl ModelAdapter for FlakyModel {
        async fn invoke(&self, request: &ModelRequest) -> RokResult<ModelResponse> {
            self.calls.lock().unwrap().push(request.clone());
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RokError::ExecutorFailure {
                    executor: request.executor.clone(),
                    reason: "rate limited".to_string(),
                });
            }
            Ok(ModelResponse {
                text: "accuracy improved by 14.8%".to_string(),
                metadata: serde_json::Value::Null,
            })
        }
    }

    struct NoTool;

    #[async_trait]
    impl ToolInterface for NoTool {
        async fn invoke(&self, tool_name: &str, _config: &serde_json::Value) -> RokResult<ToolResponse> {
            Err(RokError::ExecutorFailure { executor: tool_name.to_string(), reason: "no tools".to_string() })
        }
    }

    /// Hands out queued judgements; repeats the last one when drained.
    struct QueueVerifier {
        queue: Mutex<VecDeque<(VerificationStatus, f64)>>,
    }

    #[async_trait]
    impl StepVerifier for QueueVerifier {
        async fn judge(&self, step: &StepView) -> RokResult<Judgement> {
            let mut queue = self.queue.lock().unwrap();
            let (status, conf) = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                *queue.front().unwrap()
            };
            Ok(Judgement::new(status, conf).checking(step.evidence_ids()))
        }
    }

    /// Always returns the same evidence, relevance set per test.
    struct StaticSource {
        relevance: f64,
        rounds: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl EvidenceSource for StaticSource {
        async fn gather(&self, _step: &StepView, round: u32) -> RokResult<Vec<Evidence>> {
            self.rounds.lock().unwrap().push(round);
            Ok(vec![Evidence::new(
                SourceRef { source_type: SourceType::Document, source_id: "paper".to_string(), uri: None },
                format!("round {round}: accuracy improved by 14.8%"),
                self.relevance,
            )?])
        }
    }

    struct FixedGate(PolicyDecision);

    impl PolicyGate for FixedGate {
        fn settings(&self, _domain: &str) -> PolicySettings {
            PolicySettings::default()
        }

        fn decide(&self, _ctx: &PolicyContext) -> PolicyDecision {
            self.0.clone()
        }
    }

    struct Harness {
        worker: StepWorker,
        model_calls: Arc<Mutex<Vec<ModelRequest>>>,
        rounds: Arc<Mutex<Vec<u32>>>,
    }

    fn harness(
        failures: u32,
        judgements: Vec<(VerificationStatus, f64)>,
        decision: PolicyDecision,
        relevance: f64,
        settings: PolicySettings,
    ) -> Harness {
        let plan = StepPlan::new(
            "extract claim",
            ExecutorSpec::model("gpt_stub", PromptTemplateRef::new("extract_claim", "1")),
        )
        .with_id("S1")
        .requires_evidence();
        let mut step = Step::from_plan(plan, 0);
        step.schedule().unwrap();
        let store = RunStore::new(RunDocument::new(
            Task::from_request(&TaskRequest::new("verify claim", "research")),
            Run::start(RunId::new(), None, "p", serde_json::Value::Null),
            vec![step],
        ));
        let model_calls = Arc::new(Mutex::new(Vec::new()));
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let ctx = RunContext::new(
            RunId::new(),
            "research",
            settings,
            CancellationToken::new(),
            Some(Duration::from_secs(1)),
        );
        let worker = StepWorker {
            executors: Executors {
                model: Arc::new(FlakyModel { failures: Mutex::new(failures), calls: Arc::clone(&model_calls) }),
                tool: Arc::new(NoTool),
            },
            verifiers: Verifiers {
                rule: Arc::new(QueueVerifier { queue: Mutex::new(judgements.into()) }),
                model: None,
            },
            evidence: Some(Arc::new(StaticSource { relevance, rounds: Arc::clone(&rounds) })),
            gate: Arc::new(FixedGate(decision)),
            ctx: Arc::new(ctx),
            trail: AuditTrail::new(store.clone(), None),
            store,
        };
        Harness { worker, model_calls, rounds }
    }

    fn reexecute() -> PolicyDecision {
        PolicyDecision::ReexecuteStep { reason: "retry".to_string(), added_constraints: vec![] }
    }

    fn step(h: &Harness) -> Step {
        h.worker.store.read(|d| d.steps()[0].clone())
    }

    // ── Happy path ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn supported_first_time_verifies_without_revisions() {
        let h = harness(0, vec![(VerificationStatus::Supported, 0.95)], reexecute(), 0.9, PolicySettings::default());
        let status = h.worker.run(&StepId::from("S1")).await.unwrap();
        assert_eq!(status, StepStatus::Verified);
        assert!(step(&h).revisions().is_empty());
    }

    #[tokio::test]
    async fn revision_outcome_links_back_to_its_record() {
        let h = harness(
            0,
            vec![(VerificationStatus::Weak, 0.4), (VerificationStatus::Supported, 0.9)],
            reexecute(),
            0.9,
            PolicySettings::default(),
        );
        assert_eq!(h.worker.run(&StepId::from("S1")).await.unwrap(), StepStatus::Verified);

        let s = step(&h);
        let rev_id = s.revisions()[0].revision_id.clone();
        assert_eq!(s.executions()[1].revision_id.as_ref(), Some(&rev_id));
        assert_eq!(s.verifications()[1].revision_id.as_ref(), Some(&rev_id));
        assert_eq!(h.model_calls.lock().unwrap().len(), 2);
    }

    // ── Revision loop ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn partial_below_threshold_exhausts_and_escalates() {
        let settings = PolicySettings {
            verification_confidence_threshold: 0.85,
            max_retries_per_step: 3,
            ..PolicySettings::default()
        };
        let h = harness(0, vec![(VerificationStatus::PartiallySupported, 0.78)], reexecute(), 0.9, settings);
        let status = h.worker.run(&StepId::from("S1")).await.unwrap();

        let s = step(&h);
        assert_eq!(status, StepStatus::Failed);
        assert!(s.is_uncertain());
        assert_eq!(s.retry_count(), 3, "retry count must stop at the ceiling");
        assert_eq!(s.revisions().len(), 4, "three retries plus the forced escalation");
        assert!(s.revisions()[3].forced);
        assert_eq!(s.executions().len(), 4);
    }

    #[tokio::test]
    async fn executor_failure_is_revised_like_a_failed_verification() {
        let h = harness(1, vec![(VerificationStatus::Supported, 0.9)], reexecute(), 0.9, PolicySettings::default());
        assert_eq!(h.worker.run(&StepId::from("S1")).await.unwrap(), StepStatus::Verified);

        let s = step(&h);
        assert_eq!(s.verifications()[0].status, VerificationStatus::Unknown);
        assert!(s.verifications()[0].issues[0].contains("rate limited"));
        assert_eq!(s.revisions()[0].action, RevisionAction::ReexecuteStep);
    }

    #[tokio::test]
    async fn insufficient_evidence_fetches_more_then_escalates() {
        let settings = PolicySettings {
            min_evidence_relevance: 0.5,
            max_retries_per_step: 2,
            ..PolicySettings::default()
        };
        let h = harness(
            0,
            vec![(VerificationStatus::Supported, 0.9)],
            PolicyDecision::FetchMoreEvidence { reason: "look again".to_string() },
            0.1,
            settings,
        );
        let status = h.worker.run(&StepId::from("S1")).await.unwrap();

        assert_eq!(status, StepStatus::Failed);
        assert_eq!(*h.rounds.lock().unwrap(), vec![0, 1, 2], "each fetch widens the round");
        assert!(h.model_calls.lock().unwrap().is_empty(), "no execution without evidence");
        assert!(step(&h).is_uncertain());
    }

    #[tokio::test]
    async fn cancellation_stops_the_pipeline() {
        let h = harness(0, vec![(VerificationStatus::Supported, 0.9)], reexecute(), 0.9, PolicySettings::default());
        h.worker.ctx.cancel.cancel();
        let err = h.worker.run(&StepId::from("S1")).await.unwrap_err();
        assert!(matches!(err, RokError::Cancelled { .. }));
        assert_eq!(step(&h).status(), StepStatus::Scheduled, "the kernel fails cancelled steps");
    }
}
