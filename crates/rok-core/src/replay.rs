//! Rebuild a task request from a stored run document.

use rok_contracts::{
    document::RunDocument,
    error::{RokError, RokResult},
    step::StepPlan,
    task::TaskRequest,
};

/// The request that reproduces `doc`'s step graph.
///
/// Each step keeps the executor it first ran with, so a run whose policy
/// switched executors mid-revision replays from the same starting point.
/// The new run is linked to the old one through `parent_run_id`.
pub fn replay_request(doc: &RunDocument) -> RokResult<TaskRequest> {
    if doc.steps().is_empty() {
        return Err(RokError::validation(format!(
            "run '{}' has no steps to replay",
            doc.run().run_id
        )));
    }
    let task = doc.task();
    let steps = doc
        .steps()
        .iter()
        .map(|s| StepPlan {
            step_id: Some(s.step_id().clone()),
            title: s.title().to_string(),
            description: s.description().to_string(),
            depends_on: s.depends_on().to_vec(),
            executor: s
                .executions()
                .first()
                .map(|e| e.executor.clone())
                .unwrap_or_else(|| s.executor().clone()),
            verifier: Some(s.verifier().clone()),
            evidence_required: s.evidence_required(),
        })
        .collect();

    Ok(TaskRequest {
        objective: task.objective().to_string(),
        domain: task.domain().to_string(),
        context: task.context().clone(),
        constraints: task.constraints().to_vec(),
        sources: task.sources().to_vec(),
        inputs: task.inputs().clone(),
        steps,
        parent_run_id: Some(doc.run().run_id.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rok_contracts::{
        ids::{ExecutionId, RunId, StepId},
        step::{DependencyGate, ExecutorSpec, PromptTemplateRef, Step, StepExecution},
        task::{Run, Task},
    };

    #[test]
    fn replay_keeps_graph_and_first_executor() {
        let first = ExecutorSpec::model("gpt_stub", PromptTemplateRef::new("extract", "1"));
        let mut step = Step::from_plan(
            StepPlan::new("extract", first.clone()).with_id("S1").requires_evidence(),
            0,
        );
        step.schedule().unwrap();
        step.record_execution(
            StepExecution {
                execution_id: ExecutionId::new(),
                attempt: 1,
                executor: first.clone(),
                output: "out".to_string(),
                prompt_template: first.prompt_template.clone(),
                parameters: serde_json::Value::Null,
                tool_call_ref: None,
                metadata: serde_json::Value::Null,
                revision_id: None,
                started_at: chrono::Utc::now(),
                ended_at: chrono::Utc::now(),
            },
            vec![],
            &DependencyGate::default(),
        )
        .unwrap();
        let dependent = Step::from_plan(
            StepPlan::new("judge", ExecutorSpec::tool("calc")).with_id("S2").depends_on(&["S1"]),
            1,
        );

        let request = TaskRequest::new("objective", "research")
            .with_inputs(serde_json::json!({ "k": 1 }));
        let run = Run::start(RunId::new(), None, "p", serde_json::Value::Null);
        let run_id = run.run_id.clone();
        let doc = RunDocument::new(Task::from_request(&request), run, vec![step, dependent]);

        let replay = replay_request(&doc).unwrap();
        assert_eq!(replay.parent_run_id, Some(run_id));
        assert_eq!(replay.steps.len(), 2);
        assert_eq!(replay.steps[0].executor, first);
        assert!(replay.steps[0].evidence_required);
        assert_eq!(replay.steps[1].depends_on, vec![StepId::from("S1")]);
        assert_eq!(replay.inputs["k"], 1);
    }

    #[test]
    fn rejected_run_cannot_be_replayed() {
        let request = TaskRequest::new("o", "d");
        let doc = RunDocument::new(
            Task::from_request(&request),
            Run::start(RunId::new(), None, "p", serde_json::Value::Null),
            vec![],
        );
        assert!(matches!(replay_request(&doc), Err(RokError::Validation { .. })));
    }
}
