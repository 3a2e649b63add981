//! Reasoning Orchestration Kernel: Reference Demo CLI
//!
//! Runs the reference scenarios on the real kernel components (policy gate,
//! rule verifier, hash-chained audit sink) wired to deterministic stubs, and
//! inspects stored run documents.
//!
//! Usage:
//!   cargo run -p demo -- run all
//!   cargo run -p demo -- run self-correction --out runs/
//!   cargo run -p demo -- run claim-verification --memory memory.json
//!   cargo run -p demo -- validate runs/self-correction.json
//!   cargo run -p demo -- diff runs/a.json runs/b.json
//!   cargo run -p demo -- replay runs/loan-payment.json

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rok_contracts::error::{RokError, RokResult};
use rok_core::diff_runs;
use rok_ref::{
    adapters::{StubModelAdapter, GPT_STUB},
    scenarios::{
        self, claim_verification, loan_payment, print_report, revision_exhaustion,
        self_correction, ScenarioOptions, ScenarioRun,
    },
};
use rok_verify::{invariants, load_document};

// ── CLI definition ────────────────────────────────────────────────────────────

/// Reasoning orchestration kernel reference demo.
///
/// Each scenario decomposes a task into steps, binds evidence, executes,
/// verifies, revises under policy, checks consistency, and finalizes.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "Reasoning orchestration kernel reference demo",
    long_about = "Runs reference scenarios showing evidence binding, verification,\n\
                  policy-driven revision, consistency checking, and audit chain integrity."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scenario, or all of them in sequence.
    Run {
        scenario: Scenario,
        #[command(flatten)]
        wiring: Wiring,
        /// Write each run document as `<scenario>.json` into this directory.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Check a stored run document against the RSL schema and the kernel's invariants.
    Validate { document: PathBuf },
    /// Compare two stored run documents step by step.
    Diff {
        before: PathBuf,
        after: PathBuf,
        /// Print the diff as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Re-run a stored run document, linked to it as parent.
    Replay {
        document: PathBuf,
        #[command(flatten)]
        wiring: Wiring,
        /// Write the replayed document to this file.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct Wiring {
    /// Policy TOML to use instead of the scenario's embedded policy.
    #[arg(long)]
    policy: Option<PathBuf>,
    /// JSON memory file shared across runs.
    #[arg(long)]
    memory: Option<PathBuf>,
    /// Also write the audit chain as JSON lines to this file.
    #[arg(long)]
    audit_log: Option<PathBuf>,
}

impl From<Wiring> for ScenarioOptions {
    fn from(w: Wiring) -> Self {
        ScenarioOptions {
            policy: w.policy,
            memory: w.memory,
            audit_log: w.audit_log,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Run every scenario below in sequence.
    All,
    /// Claim checked against the paper; finalizes on partial support.
    ClaimVerification,
    /// Same claim with a conflicting fact in memory; requests clarification.
    PriorMemory,
    /// Overstated figure contradicted, restated, then finalized.
    SelfCorrection,
    /// Strict policy retries a partial claim until the ceiling escalates.
    RevisionExhaustion,
    /// Model, tool, and model steps with policy routing.
    LoanPayment,
    /// Loan payment with the primary model down; policy switches executor.
    LoanOutage,
}

const EVERY_SCENARIO: [Scenario; 6] = [
    Scenario::ClaimVerification,
    Scenario::PriorMemory,
    Scenario::SelfCorrection,
    Scenario::RevisionExhaustion,
    Scenario::LoanPayment,
    Scenario::LoanOutage,
];

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Set RUST_LOG=debug for the kernel's decision trail.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { scenario, wiring, out } => {
            print_banner();
            run_scenarios(scenario, wiring.into(), out.as_deref()).await
        }
        Command::Validate { document } => validate(&document),
        Command::Diff { before, after, json } => diff(&before, &after, json),
        Command::Replay { document, wiring, out } => {
            replay(&document, wiring.into(), out.as_deref()).await
        }
    };

    if let Err(e) = result {
        eprintln!("Demo error: {e}");
        std::process::exit(1);
    }
}

// ── Scenario dispatch ─────────────────────────────────────────────────────────

async fn run_one(scenario: Scenario, options: &ScenarioOptions) -> RokResult<ScenarioRun> {
    match scenario {
        Scenario::ClaimVerification => claim_verification::run(options).await,
        Scenario::PriorMemory => claim_verification::run_against_prior_memory(options).await,
        Scenario::SelfCorrection => self_correction::run(options).await,
        Scenario::RevisionExhaustion => revision_exhaustion::run(options).await,
        Scenario::LoanPayment => loan_payment::run(options).await,
        Scenario::LoanOutage => {
            loan_payment::run_with_model(options, StubModelAdapter::new().with_outage(GPT_STUB)).await
        }
        Scenario::All => Err(RokError::validation("'all' is not a single scenario")),
    }
}

async fn run_scenarios(scenario: Scenario, options: ScenarioOptions, out: Option<&Path>) -> RokResult<()> {
    let selected: Vec<Scenario> = if scenario == Scenario::All {
        EVERY_SCENARIO.to_vec()
    } else {
        vec![scenario]
    };

    for (index, scenario) in selected.into_iter().enumerate() {
        let run = run_one(scenario, &options).await?;
        print_report(&run);
        if let Some(dir) = out {
            let label = scenario
                .to_possible_value()
                .map(|v| v.get_name().to_string())
                .unwrap_or_else(|| format!("scenario-{index}"));
            write_document(&run, &dir.join(format!("{label}.json")))?;
        }
    }
    println!("All selected scenarios completed.");
    Ok(())
}

async fn replay(document: &Path, options: ScenarioOptions, out: Option<&Path>) -> RokResult<()> {
    let stored = load_document(document)?;
    let run = scenarios::replay(&stored, &options).await?;
    print_report(&run);

    let diff = diff_runs(&stored, &run.document);
    println!("  Against {}: {}", document.display(), diff.summary);
    if let Some(path) = out {
        write_document(&run, path)?;
    }
    Ok(())
}

fn write_document(run: &ScenarioRun, path: &Path) -> RokResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
    }
    std::fs::write(path, run.document.to_json_pretty()?).map_err(|e| storage_error(path, e))?;
    info!(scenario = run.name, path = %path.display(), "run document written");
    println!("  Run document written to {}", path.display());
    println!();
    Ok(())
}

fn storage_error(path: &Path, e: std::io::Error) -> RokError {
    RokError::Storage {
        reason: format!("failed to write '{}': {e}", path.display()),
    }
}

// ── Inspection ────────────────────────────────────────────────────────────────

fn validate(path: &Path) -> RokResult<()> {
    let doc = load_document(path)?;
    println!("{}: conforms to the RSL schema", path.display());

    let violations = invariants::check(&doc);
    if violations.is_empty() {
        println!(
            "{}: all invariants hold ({} step(s), {} event(s))",
            path.display(),
            doc.steps().len(),
            doc.events().len()
        );
        return Ok(());
    }
    for violation in &violations {
        println!("  {violation}");
    }
    Err(RokError::validation(format!(
        "{} invariant violation(s) in '{}'",
        violations.len(),
        path.display()
    )))
}

fn diff(before: &Path, after: &Path, json: bool) -> RokResult<()> {
    let left = load_document(before)?;
    let right = load_document(after)?;
    let diff = diff_runs(&left, &right);

    if json {
        let text = serde_json::to_string_pretty(&diff).map_err(|e| {
            RokError::validation(format!("failed to serialize diff: {e}"))
        })?;
        println!("{text}");
        return Ok(());
    }

    println!("{}", diff.summary);
    if let Some(change) = &diff.task_status {
        println!("  task status: {:?} -> {:?}", change.before, change.after);
    }
    if let Some(change) = &diff.run_status {
        println!("  run status:  {:?} -> {:?}", change.before, change.after);
    }
    for step in &diff.steps {
        println!("  step {} ({}):", step.step_index, step.title);
        if let Some(c) = &step.status {
            println!("    status:       {:?} -> {:?}", c.before, c.after);
        }
        if let Some(c) = &step.verification_status {
            println!("    verification: {:?} -> {:?}", c.before, c.after);
        }
        if let Some(c) = &step.verification_confidence {
            println!("    confidence:   {:?} -> {:?}", c.before, c.after);
        }
        if let Some(c) = &step.revision_count {
            println!("    revisions:    {} -> {}", c.before, c.after);
        }
        if let Some(c) = &step.output {
            println!("    output:       {:?} -> {:?}", c.before, c.after);
        }
    }
    if let Some(conclusion) = &diff.conclusion {
        if let Some(c) = &conclusion.content {
            println!("  conclusion: {:?} -> {:?}", c.before, c.after);
        }
        if let Some(c) = &conclusion.confidence {
            println!("  conclusion confidence: {:?} -> {:?}", c.before, c.after);
        }
    }
    Ok(())
}

// ── Banner ────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("Reasoning Orchestration Kernel");
    println!("Reference Demo");
    println!("==============================");
    println!();
    println!("Kernel pipeline per step:");
    println!("  [1] Evidence binder attaches retrieved sources above the relevance floor");
    println!("  [2] Dispatcher runs the step's model or tool executor under a timeout");
    println!("  [3] Verifier coordinator judges the output against its evidence");
    println!("  [4] Revision controller asks policy how to re-enter, within ceilings");
    println!("  [5] Consistency checker and finalizer decide the run outcome");
    println!("  Every transition is appended to a SHA-256 hash-chained audit log.");
    println!();
}
