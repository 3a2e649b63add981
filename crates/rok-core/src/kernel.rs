//! The reasoning orchestration kernel.
//!
//! The kernel drives one task through the full control flow:
//!
//!   Intake → Decomposition → {Schedule → Bind → Execute → Verify → Revise}* → Consistency → Finalize
//!
//! Every ready step runs its pipeline in its own task. The scheduler loop
//! joins completions and recomputes the ready batch after each, failing
//! steps whose dependencies failed so the run always drains. `run` returns
//! a document in every case, including rejection and cancellation.

use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rok_contracts::{
    audit::AuditEventType,
    conclusion::MemoryWrite,
    document::RunDocument,
    error::{RokError, RokResult},
    ids::{RunId, StepId},
    step::StepStatus,
    task::{RunStatus, TaskRequest, TaskStatus},
};

use crate::{
    consistency,
    context::RunContext,
    coordinator::Verifiers,
    dispatcher::Executors,
    finalizer,
    intake,
    pipeline::StepWorker,
    replay::replay_request,
    scheduler,
    store::RunStore,
    trail::AuditTrail,
    traits::{AuditSink, EvidenceSource, MemoryStore, PolicyGate},
};

/// Per-run overrides.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Deadline for every external call. `None` uses the policy's
    /// `executor_timeout_ms`.
    pub timeout: Option<Duration>,
    /// Append verified facts to the memory store on finalization.
    pub write_memory: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            write_memory: true,
        }
    }
}

type WorkerResult = (StepId, Result<RokResult<StepStatus>, ()>);

pub struct Kernel {
    gate: Arc<dyn PolicyGate>,
    executors: Executors,
    verifiers: Verifiers,
    evidence: Option<Arc<dyn EvidenceSource>>,
    memory: Option<Arc<dyn MemoryStore>>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl Kernel {
    pub fn new(gate: Arc<dyn PolicyGate>, executors: Executors, verifiers: Verifiers) -> Self {
        Self {
            gate,
            executors,
            verifiers,
            evidence: None,
            memory: None,
            sink: None,
        }
    }

    pub fn with_evidence_source(mut self, source: Arc<dyn EvidenceSource>) -> Self {
        self.evidence = Some(source);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn run(&self, request: TaskRequest, cancel: CancellationToken) -> RunDocument {
        self.run_with(request, RunOptions::default(), cancel).await
    }

    /// Replay a stored run: same graph and inputs, linked through
    /// `parent_run_id`, with memory writes disabled.
    pub async fn replay(&self, doc: &RunDocument, cancel: CancellationToken) -> RokResult<RunDocument> {
        let request = replay_request(doc)?;
        let options = RunOptions {
            write_memory: false,
            ..RunOptions::default()
        };
        Ok(self.run_with(request, options, cancel).await)
    }

    pub async fn run_with(
        &self,
        request: TaskRequest,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> RunDocument {
        let run_id = RunId::new();
        let settings = self.gate.settings(&request.domain);
        info!(run_id = %run_id, domain = %request.domain, steps = request.steps.len(), "task received");

        let received = json!({
            "objective": request.objective,
            "domain": request.domain,
            "step_count": request.steps.len(),
            "parent_run_id": request.parent_run_id,
            "policy_id": settings.policy_id,
        });

        let decomposition = match intake::decompose(&request, &settings, self.gate.as_ref(), run_id.clone()) {
            Ok(d) => d,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "task rejected");
                let store = RunStore::new(intake::rejected(&request, &settings, run_id, &e.to_string()));
                let trail = AuditTrail::new(store.clone(), self.sink.clone());
                trail.record(AuditEventType::TaskReceived, received);
                trail.record(AuditEventType::TaskRejected, json!({ "reason": e.to_string() }));
                trail.flush();
                return store.snapshot();
            }
        };

        let store = RunStore::new(decomposition.document);
        let trail = AuditTrail::new(store.clone(), self.sink.clone());
        trail.record(AuditEventType::TaskReceived, received);

        if let Err(e) = store.write(|doc| doc.advance_task(TaskStatus::Decomposed, None)) {
            return self.abort(&store, &trail, e);
        }
        trail.record(
            AuditEventType::TaskDecomposed,
            json!({ "order": decomposition.order, "step_count": decomposition.order.len() }),
        );
        for routed in &decomposition.routed {
            debug!(run_id = %run_id, step_id = %routed.step_id, executor = %routed.routed.name, "executor routed");
            trail.record(
                AuditEventType::ExecutorRouted,
                json!({
                    "step_id": routed.step_id,
                    "declared": routed.declared.name,
                    "routed": routed.routed.name,
                }),
            );
        }
        if let Err(e) = store.write(|doc| doc.advance_task(TaskStatus::Running, None)) {
            return self.abort(&store, &trail, e);
        }

        let ctx = Arc::new(RunContext::new(run_id, request.domain.clone(), settings, cancel, options.timeout));
        let worker = StepWorker {
            executors: self.executors.clone(),
            verifiers: self.verifiers.clone(),
            evidence: self.evidence.clone(),
            gate: Arc::clone(&self.gate),
            ctx: Arc::clone(&ctx),
            store: store.clone(),
            trail: trail.clone(),
        };

        if self.drive(&worker).await {
            self.cancel_run(&ctx, &store, &trail);
            trail.flush();
            return store.snapshot();
        }

        let memory = self.load_memory(&ctx);
        if let Err(e) = consistency::check(&ctx, &store, &trail, &memory) {
            return self.abort(&store, &trail, e);
        }

        let conclusion = store.read(|doc| finalizer::conclude(doc, &ctx.settings, self.gate.as_ref()));
        if let Err(e) = finalizer::apply(
            &ctx,
            &store,
            &trail,
            self.memory.as_ref(),
            options.write_memory,
            conclusion,
        ) {
            error!(run_id = %ctx.run_id, error = %e, "finalization failed");
        }

        self.complete(&ctx, &store, &trail);
        trail.flush();
        store.snapshot()
    }

    /// The scheduling loop. Returns `true` if the run was cancelled.
    async fn drive(&self, worker: &StepWorker) -> bool {
        let (ctx, store, trail) = (&worker.ctx, &worker.store, &worker.trail);
        let limit = ctx.settings.max_parallel_steps.max(1);
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut in_flight: HashSet<StepId> = HashSet::new();

        loop {
            if ctx.is_cancelled() {
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                return true;
            }

            self.fail_blocked(ctx, store, trail);

            let ready = store.read(|doc| scheduler::ready_batch(doc, &in_flight, &ctx.waived));
            for step_id in ready.into_iter().take(limit.saturating_sub(in_flight.len())) {
                if !self.schedule(ctx, store, trail, &step_id) {
                    continue;
                }
                let w = worker.clone();
                let id = step_id.clone();
                workers.spawn(async move {
                    let outcome = AssertUnwindSafe(w.run(&id)).catch_unwind().await.map_err(|_| ());
                    (id, outcome)
                });
                in_flight.insert(step_id);
            }

            if workers.is_empty() {
                let open = store.read(|doc| !doc.all_steps_terminal());
                if open {
                    // Nothing runs and nothing can start.
                    warn!(run_id = %ctx.run_id, "no runnable steps remain; failing open steps");
                    let failed = store.write(|doc| doc.fail_open_steps("unschedulable: dependencies can never be satisfied"));
                    for step_id in failed {
                        trail.record(
                            AuditEventType::StepFailed,
                            json!({ "step_id": step_id, "uncertain": false, "reason": "unschedulable" }),
                        );
                    }
                }
                return false;
            }

            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                joined = workers.join_next() => {
                    if let Some(Ok((step_id, outcome))) = joined {
                        in_flight.remove(&step_id);
                        self.settle(ctx, store, trail, &step_id, outcome);
                    }
                }
            }
        }
    }

    /// CREATED → SCHEDULED plus its audit event. Returns false if the step
    /// could not be scheduled.
    fn schedule(&self, ctx: &RunContext, store: &RunStore, trail: &AuditTrail, step_id: &StepId) -> bool {
        let scheduled = store.write(|doc| {
            doc.with_step(step_id, |s| {
                s.schedule()?;
                Ok((s.logical_id(), s.executor().clone(), s.verifier().clone()))
            })
        });
        match scheduled {
            Ok((logical_id, executor, verifier)) => {
                debug!(run_id = %ctx.run_id, step_id = %step_id, executor = %executor.name, "step scheduled");
                trail.record(
                    AuditEventType::StepScheduled,
                    json!({
                        "step_id": step_id,
                        "logical_id": logical_id,
                        "executor": executor,
                        "verifier": verifier,
                    }),
                );
                true
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, step_id = %step_id, error = %e, "step could not be scheduled");
                false
            }
        }
    }

    /// Fail CREATED steps whose dependencies failed, until none remain.
    fn fail_blocked(&self, ctx: &RunContext, store: &RunStore, trail: &AuditTrail) {
        loop {
            let blocked = store.read(|doc| scheduler::blocked_by_failure(doc, &ctx.waived));
            if blocked.is_empty() {
                return;
            }
            for (step_id, dependency) in blocked {
                let reason = format!("dependency {dependency} failed");
                match store.write(|doc| doc.with_step(&step_id, |s| s.fail(reason.clone()))) {
                    Ok(()) => {
                        debug!(run_id = %ctx.run_id, step_id = %step_id, %dependency, "step blocked by failed dependency");
                        trail.record(
                            AuditEventType::StepFailed,
                            json!({ "step_id": step_id, "uncertain": false, "reason": reason }),
                        );
                    }
                    Err(e) => {
                        // A step that cannot be failed would be reported again forever.
                        error!(run_id = %ctx.run_id, step_id = %step_id, error = %e, "could not fail blocked step");
                        return;
                    }
                }
            }
        }
    }

    fn settle(
        &self,
        ctx: &RunContext,
        store: &RunStore,
        trail: &AuditTrail,
        step_id: &StepId,
        outcome: Result<RokResult<StepStatus>, ()>,
    ) {
        let reason = match outcome {
            Ok(Ok(status)) => {
                debug!(run_id = %ctx.run_id, step_id = %step_id, ?status, "step settled");
                return;
            }
            // The cancellation path fails the step.
            Ok(Err(RokError::Cancelled { .. })) => return,
            Ok(Err(e)) => e.to_string(),
            Err(()) => "step worker panicked".to_string(),
        };
        error!(run_id = %ctx.run_id, step_id = %step_id, %reason, "step worker failed");
        let failed = store.write(|doc| {
            doc.with_step(step_id, |s| {
                if s.status().is_terminal() {
                    Ok(false)
                } else {
                    s.fail(reason.clone()).map(|_| true)
                }
            })
        });
        if matches!(failed, Ok(true)) {
            trail.record(
                AuditEventType::StepFailed,
                json!({ "step_id": step_id, "uncertain": false, "reason": reason }),
            );
        }
    }

    fn load_memory(&self, ctx: &RunContext) -> Vec<MemoryWrite> {
        match self.memory.as_ref().map(|m| m.load()) {
            Some(Ok(items)) => items,
            Some(Err(e)) => {
                warn!(run_id = %ctx.run_id, error = %e, "memory could not be loaded; checking without it");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn cancel_run(&self, ctx: &RunContext, store: &RunStore, trail: &AuditTrail) {
        warn!(run_id = %ctx.run_id, "run cancelled");
        let failed = store.write(|doc| doc.fail_open_steps("run cancelled"));
        for step_id in &failed {
            trail.record(
                AuditEventType::StepFailed,
                json!({ "step_id": step_id, "uncertain": false, "reason": "run cancelled" }),
            );
        }
        if let Err(e) = store.write(|doc| doc.fail("run cancelled", RunStatus::Cancelled)) {
            error!(run_id = %ctx.run_id, error = %e, "could not mark run cancelled");
        }
        trail.record(AuditEventType::RunCancelled, json!({ "failed_step_ids": failed }));
    }

    fn complete(&self, ctx: &RunContext, store: &RunStore, trail: &AuditTrail) {
        let (task_status, run_status, confidence) = store.read(|doc| {
            (
                doc.task().status(),
                doc.run().status(),
                doc.run().accounting.final_confidence,
            )
        });
        info!(run_id = %ctx.run_id, ?task_status, ?run_status, confidence, "run completed");
        trail.record(
            AuditEventType::RunCompleted,
            json!({
                "task_status": task_status,
                "run_status": run_status,
                "final_confidence": confidence,
                "total_revisions": ctx.total_revisions(),
            }),
        );
    }

    /// Fail the run on an internal error and return the document.
    fn abort(&self, store: &RunStore, trail: &AuditTrail, e: RokError) -> RunDocument {
        error!(error = %e, "run aborted");
        store.write(|doc| {
            doc.fail_open_steps("run aborted");
            if let Err(inner) = doc.fail(e.to_string(), RunStatus::Failed) {
                warn!(error = %inner, "run already finished");
            }
        });
        trail.record(AuditEventType::FinalizationFailed, json!({ "error": e.to_string() }));
        trail.flush();
        store.snapshot()
    }
}
