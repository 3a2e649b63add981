//! Execution dispatcher.
//!
//! Closed dispatch over `ExecutorKind`. The kernel persists the template
//! reference and the parameters it passed, never rendered prompt text.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use rok_contracts::{
    audit::AuditEventType,
    error::{RokError, RokResult},
    evidence::{Evidence, SourceRef, SourceType},
    ids::{ExecutionId, RevisionId, StepId},
    step::{ExecutorKind, StepExecution},
};

use crate::{
    context::RunContext,
    store::RunStore,
    trail::AuditTrail,
    traits::{ModelAdapter, ModelRequest, StepView, ToolInterface},
};

/// The executors a kernel can dispatch to.
#[derive(Clone)]
pub struct Executors {
    pub model: Arc<dyn ModelAdapter>,
    pub tool: Arc<dyn ToolInterface>,
}

struct Produced {
    output: String,
    metadata: serde_json::Value,
    tool_call_ref: Option<String>,
    evidence: Vec<Evidence>,
}

/// Parameters persisted with the execution and handed to the executor.
fn parameters(view: &StepView) -> serde_json::Value {
    let dependency_outputs: serde_json::Map<String, serde_json::Value> = view
        .dependency_outputs
        .iter()
        .map(|(id, out)| (id.to_string(), json!(out)))
        .collect();
    json!({
        "config": view.executor.config,
        "inputs": view.inputs,
        "dependency_outputs": dependency_outputs,
        "constraints": view.constraints,
        "evidence_ids": view.evidence_ids(),
    })
}

async fn invoke(
    executors: &Executors,
    ctx: &RunContext,
    view: &StepView,
    params: &serde_json::Value,
) -> RokResult<Produced> {
    let spec = &view.executor;
    match spec.kind {
        ExecutorKind::Model => {
            let template = spec.prompt_template.clone().ok_or_else(|| RokError::ExecutorFailure {
                executor: spec.name.clone(),
                reason: "no prompt template reference".to_string(),
            })?;
            let request = ModelRequest {
                executor: spec.name.clone(),
                template,
                parameters: params.clone(),
                step: view.clone(),
            };
            let response = ctx
                .bounded(&format!("model:{}", spec.name), executors.model.invoke(&request))
                .await?;
            Ok(Produced {
                output: response.text,
                metadata: response.metadata,
                tool_call_ref: None,
                evidence: Vec::new(),
            })
        }
        ExecutorKind::Tool => {
            // Tools see their declared config plus the task inputs.
            let mut config = spec.config.clone();
            if let (Some(obj), Some(inputs)) = (config.as_object_mut(), view.inputs.as_object()) {
                for (k, v) in inputs {
                    obj.entry(k.clone()).or_insert_with(|| v.clone());
                }
            } else if config.is_null() {
                config = view.inputs.clone();
            }
            let response = ctx
                .bounded(&format!("tool:{}", spec.name), executors.tool.invoke(&spec.name, &config))
                .await?;
            let mut evidence = Evidence::new(
                SourceRef {
                    source_type: SourceType::Tool,
                    source_id: spec.name.clone(),
                    uri: Some(response.tool_call_ref.clone()),
                },
                response.output.clone(),
                1.0,
            )?;
            if let Some(data) = response.data.clone() {
                evidence = evidence.with_data(data);
            }
            Ok(Produced {
                output: response.output,
                metadata: json!({ "tool_call_ref": response.tool_call_ref }),
                tool_call_ref: Some(response.tool_call_ref),
                evidence: vec![evidence],
            })
        }
    }
}

/// Run the step's executor and record the execution.
///
/// Returns the executor error on failure or timeout; the step is left
/// untouched so the revision controller can decide what happens next.
pub async fn execute(
    executors: &Executors,
    ctx: &RunContext,
    store: &RunStore,
    trail: &AuditTrail,
    step_id: &StepId,
    revision_id: Option<RevisionId>,
) -> RokResult<StepExecution> {
    let view = store.view(step_id)?;
    let params = parameters(&view);
    let started_at = Utc::now();

    debug!(
        run_id = %ctx.run_id,
        step_id = %step_id,
        executor = %view.executor.name,
        attempt = view.attempt,
        "dispatching step"
    );

    let produced = match invoke(executors, ctx, &view, &params).await {
        Ok(p) => p,
        Err(e) => {
            if !matches!(e, RokError::Cancelled { .. }) {
                warn!(run_id = %ctx.run_id, step_id = %step_id, error = %e, "executor failed");
                trail.record(
                    AuditEventType::ExecutorFailed,
                    json!({
                        "step_id": step_id,
                        "executor": view.executor.name,
                        "attempt": view.attempt,
                        "error": e.to_string(),
                    }),
                );
            }
            return Err(e);
        }
    };

    let execution = StepExecution {
        execution_id: ExecutionId::new(),
        attempt: view.attempt,
        executor: view.executor.clone(),
        output: produced.output,
        prompt_template: view.executor.prompt_template.clone(),
        parameters: params,
        tool_call_ref: produced.tool_call_ref,
        metadata: produced.metadata,
        revision_id,
        started_at,
        ended_at: Utc::now(),
    };

    store.write(|doc| {
        let gate = doc.dependency_gate(&ctx.waived);
        let record = execution.clone();
        doc.with_step(step_id, |s| s.record_execution(record, produced.evidence, &gate))
    })?;

    trail.record(
        AuditEventType::StepExecuted,
        json!({
            "step_id": step_id,
            "execution_id": execution.execution_id,
            "attempt": execution.attempt,
            "executor": execution.executor.name,
            "prompt_template": execution.prompt_template,
            "tool_call_ref": execution.tool_call_ref,
            "revision_id": execution.revision_id,
        }),
    );
    Ok(execution)
}
