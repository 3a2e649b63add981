//! Reference scenarios.
//!
//! Each scenario wires real kernel components (TOML policy gate, rule and
//! model verifiers, retriever, hash-chained audit sink) to the stub
//! executors and mock data, runs one task, and returns the run document.

pub mod claim_verification;
pub mod loan_payment;
pub mod revision_exhaustion;
pub mod self_correction;

use std::{path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rok_audit::{InMemoryAuditSink, JsonLinesAuditSink};
use rok_contracts::{
    audit::LogEvent,
    conclusion::MemoryWrite,
    document::RunDocument,
    error::RokResult,
    task::TaskRequest,
};
use rok_core::{
    traits::{AuditSink, MemoryStore},
    Executors, InMemoryMemoryStore, JsonFileMemoryStore, Kernel, Verifiers,
};
use rok_policy::TomlPolicyGate;
use rok_verify::RuleVerifier;

use crate::{
    adapters::{StubModelAdapter, StubModelVerifier},
    retriever::SentenceRetriever,
    tools::CalculatorTool,
};

/// Embedded reference policies.
pub const FINANCE_POLICY: &str = include_str!("../../policies/finance.toml");
pub const RESEARCH_POLICY: &str = include_str!("../../policies/research.toml");

/// Overrides a caller can supply to any scenario.
#[derive(Debug, Clone, Default)]
pub struct ScenarioOptions {
    /// Policy file to use instead of the embedded one.
    pub policy: Option<PathBuf>,
    /// JSON memory file shared across runs. Seeded only while empty.
    pub memory: Option<PathBuf>,
    /// Also write the audit chain as JSON lines to this path.
    pub audit_log: Option<PathBuf>,
}

/// A finished scenario.
pub struct ScenarioRun {
    pub name: &'static str,
    pub document: RunDocument,
    /// Inspectable handle on the chain the kernel wrote to.
    pub audit: InMemoryAuditSink,
}

// ── Wiring ────────────────────────────────────────────────────────────────────

pub(crate) fn policy_gate(options: &ScenarioOptions, embedded: &str) -> RokResult<Arc<TomlPolicyGate>> {
    let gate = match &options.policy {
        Some(path) => TomlPolicyGate::from_file(path)?,
        None => TomlPolicyGate::from_toml_str(embedded)?,
    };
    Ok(Arc::new(gate))
}

pub(crate) fn memory_store(options: &ScenarioOptions, seed: Vec<MemoryWrite>) -> RokResult<Arc<dyn MemoryStore>> {
    match &options.memory {
        Some(path) => {
            let store = JsonFileMemoryStore::new(path);
            if !seed.is_empty() && store.load()?.is_empty() {
                debug!(path = %path.display(), items = seed.len(), "seeding memory file");
                store.append(&seed)?;
            }
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryMemoryStore::with_items(seed))),
    }
}

/// Forwards every event to each inner sink in order.
struct TeeSink(Vec<Arc<dyn AuditSink>>);

impl AuditSink for TeeSink {
    fn emit(&self, event: &LogEvent) -> RokResult<()> {
        self.0.iter().try_for_each(|sink| sink.emit(event))
    }

    fn flush(&self) -> RokResult<()> {
        self.0.iter().try_for_each(|sink| sink.flush())
    }
}

/// The reference kernel and the in-memory chain it writes to.
fn reference_kernel(
    name: &'static str,
    options: &ScenarioOptions,
    gate: Arc<TomlPolicyGate>,
    model: StubModelAdapter,
    memory: Arc<dyn MemoryStore>,
) -> RokResult<(Kernel, InMemoryAuditSink)> {
    let audit = InMemoryAuditSink::new(name);
    let sink: Arc<dyn AuditSink> = match &options.audit_log {
        Some(path) => Arc::new(TeeSink(vec![
            Arc::new(audit.clone()),
            Arc::new(JsonLinesAuditSink::create(path, name)?),
        ])),
        None => Arc::new(audit.clone()),
    };

    let kernel = Kernel::new(
        gate,
        Executors {
            model: Arc::new(model),
            tool: Arc::new(CalculatorTool),
        },
        Verifiers {
            rule: Arc::new(RuleVerifier::new()),
            model: Some(Arc::new(StubModelVerifier)),
        },
    )
    .with_evidence_source(Arc::new(SentenceRetriever::default()))
    .with_memory(memory)
    .with_audit_sink(sink);
    Ok((kernel, audit))
}

fn finished(name: &'static str, document: RunDocument, audit: InMemoryAuditSink) -> ScenarioRun {
    info!(
        scenario = name,
        task_status = ?document.task().status(),
        run_status = ?document.run().status(),
        "scenario finished"
    );
    ScenarioRun { name, document, audit }
}

/// Build the reference kernel, run `request`, and hand back the document.
pub(crate) async fn execute(
    name: &'static str,
    request: TaskRequest,
    options: &ScenarioOptions,
    gate: Arc<TomlPolicyGate>,
    model: StubModelAdapter,
    memory: Arc<dyn MemoryStore>,
) -> RokResult<ScenarioRun> {
    let (kernel, audit) = reference_kernel(name, options, gate, model, memory)?;
    let document = kernel.run(request, CancellationToken::new()).await;
    Ok(finished(name, document, audit))
}

pub const REPLAY: &str = "replay";

/// Re-run a stored document on the reference kernel.
///
/// The embedded policy is picked by the document's domain unless
/// `options.policy` names a file. The replay is linked to the stored run and
/// writes no memory.
pub async fn replay(document: &RunDocument, options: &ScenarioOptions) -> RokResult<ScenarioRun> {
    let embedded = match document.task().domain() {
        "finance" => FINANCE_POLICY,
        _ => RESEARCH_POLICY,
    };
    let gate = policy_gate(options, embedded)?;
    let memory = memory_store(options, Vec::new())?;
    let (kernel, audit) = reference_kernel(REPLAY, options, gate, StubModelAdapter::new(), memory)?;
    let replayed = kernel.replay(document, CancellationToken::new()).await?;
    Ok(finished(REPLAY, replayed, audit))
}

// ── Reporting ─────────────────────────────────────────────────────────────────

/// Print a human-readable summary of a finished scenario.
pub fn print_report(run: &ScenarioRun) {
    let doc = &run.document;
    println!("=== {} ===", run.name);
    println!();
    println!("  Objective:   {}", doc.task().objective());
    println!("  Domain:      {}", doc.task().domain());
    println!("  Policy:      {}", doc.run().policy_id);
    println!();

    for step in doc.steps() {
        let verdict = step
            .current_verification()
            .map(|v| format!("{:?} @ {:.2}", v.status, v.confidence))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<4} {:<28} {:<10} executor={:<10} attempts={} revisions={} verdict={}",
            step.logical_id(),
            step.title(),
            format!("{:?}", step.status()),
            step.executor().name,
            step.executions().len(),
            step.revisions().len(),
            verdict,
        );
        for revision in step.revisions() {
            println!(
                "         revision: {:?}{} ({})",
                revision.action,
                if revision.forced { " [forced]" } else { "" },
                revision.reason
            );
        }
        if step.is_uncertain() {
            println!("         uncertain: {}", step.failure_reason().unwrap_or("escalated"));
        }
    }
    println!();

    for c in doc.contradictions() {
        println!("  Contradiction [{:?}]: {}", c.severity, c.description);
    }

    let accounting = &doc.run().accounting;
    println!(
        "  Task status: {:?}   Run status: {:?}",
        doc.task().status(),
        doc.run().status()
    );
    println!(
        "  Confidence:  {:.3} (base {:.3})   Cost: {:.2}   Risk: {:.2}",
        accounting.final_confidence, accounting.base_confidence, accounting.total_cost, accounting.total_risk
    );
    if let Some(conclusion) = doc.final_conclusion() {
        println!("  Conclusion:  {}", conclusion.content.replace('\n', " | "));
    }
    if let Some(clarification) = &doc.run().clarification {
        println!("  Clarification requested: {}", clarification.reason);
    }
    if let Some(reason) = doc.task().status_reason() {
        println!("  Reason:      {reason}");
    }
    println!();
    println!(
        "  Audit chain integrity:  {} ({} event(s) in chain)",
        if run.audit.verify_integrity() { "VERIFIED" } else { "FAILED" },
        run.audit.len()
    );
    println!();
}
