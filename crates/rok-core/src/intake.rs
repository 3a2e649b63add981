//! Task intake and decomposition.
//!
//! `validate` is the only place a `Validation` or `CyclicDependency` error
//! can originate. Everything after it is recovered inside the kernel.

use std::collections::HashSet;

use tracing::{debug, warn};

use rok_contracts::{
    document::RunDocument,
    error::{RokError, RokResult},
    ids::{RunId, StepId},
    policy::{PolicySettings, RoutingContext},
    step::{ExecutorKind, ExecutorSpec, Step, StepPlan},
    task::{Run, RunStatus, Task, TaskRequest},
};

use crate::{scheduler::topological_order, traits::PolicyGate};

/// An executor replaced by the routing hook at intake.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedExecutor {
    pub step_id: StepId,
    pub declared: ExecutorSpec,
    pub routed: ExecutorSpec,
}

/// A validated, routed task ready to become a run document.
#[derive(Debug)]
pub struct Decomposition {
    pub document: RunDocument,
    /// Step ids in dependency order.
    pub order: Vec<StepId>,
    pub routed: Vec<RoutedExecutor>,
}

/// Give every plan an id. Caller-supplied ids are kept.
pub fn assign_ids(plans: &[StepPlan]) -> Vec<StepPlan> {
    plans
        .iter()
        .cloned()
        .map(|mut p| {
            if p.step_id.is_none() {
                p.step_id = Some(StepId::new());
            }
            p
        })
        .collect()
}

fn plan_id(plan: &StepPlan, index: usize) -> RokResult<&StepId> {
    plan.step_id
        .as_ref()
        .ok_or_else(|| RokError::validation(format!("step at position {index} has no id")))
}

/// Validate a request whose plans all carry ids. Returns step indices in
/// dependency order.
pub fn validate(
    request: &TaskRequest,
    plans: &[StepPlan],
    settings: &PolicySettings,
) -> RokResult<Vec<usize>> {
    if request.objective.trim().is_empty() {
        return Err(RokError::validation("objective must not be empty"));
    }
    if request.domain.trim().is_empty() {
        return Err(RokError::validation("domain must not be empty"));
    }
    if !settings.domain_allowed(&request.domain) {
        return Err(RokError::validation(format!(
            "domain '{}' is not allowed by policy '{}'",
            request.domain, settings.policy_id
        )));
    }
    if plans.is_empty() {
        return Err(RokError::validation("a task needs at least one step"));
    }

    let mut index_of = std::collections::HashMap::new();
    for (i, plan) in plans.iter().enumerate() {
        let id = plan_id(plan, i)?;
        if index_of.insert(id.clone(), i).is_some() {
            return Err(RokError::validation(format!("duplicate step id '{id}'")));
        }
    }

    let mut graph = Vec::with_capacity(plans.len());
    for (i, plan) in plans.iter().enumerate() {
        let id = plan_id(plan, i)?;
        if plan.title.trim().is_empty() {
            return Err(RokError::validation(format!("step '{id}' has no title")));
        }
        if !settings.executor_allowed(&plan.executor.name) {
            return Err(RokError::validation(format!(
                "step '{id}': executor '{}' is not allowed by policy",
                plan.executor.name
            )));
        }
        if plan.executor.kind == ExecutorKind::Model && plan.executor.prompt_template.is_none() {
            return Err(RokError::validation(format!(
                "step '{id}': MODEL executor '{}' needs a prompt template reference",
                plan.executor.name
            )));
        }

        let mut seen = HashSet::new();
        let mut deps = Vec::with_capacity(plan.depends_on.len());
        for dep in &plan.depends_on {
            if dep == id {
                return Err(RokError::validation(format!("step '{id}' depends on itself")));
            }
            if !seen.insert(dep) {
                return Err(RokError::validation(format!(
                    "step '{id}' lists dependency '{dep}' twice"
                )));
            }
            let &dep_index = index_of.get(dep).ok_or_else(|| {
                RokError::validation(format!("step '{id}' depends on unknown step '{dep}'"))
            })?;
            deps.push(dep_index);
        }
        graph.push(deps);
    }

    topological_order(&graph).map_err(|stuck| RokError::CyclicDependency {
        step_ids: stuck
            .into_iter()
            .filter_map(|i| plans[i].step_id.as_ref().map(|s| s.to_string()))
            .collect(),
    })
}

/// Validate, apply evidence policy and routing, and build the document.
///
/// The returned document's task is still CREATED.
pub fn decompose(
    request: &TaskRequest,
    settings: &PolicySettings,
    gate: &dyn PolicyGate,
    run_id: RunId,
) -> RokResult<Decomposition> {
    let mut plans = assign_ids(&request.steps);
    let order = validate(request, &plans, settings)?;

    let mut routed = Vec::new();
    for (index, plan) in plans.iter_mut().enumerate() {
        let id = plan_id(plan, index)?.clone();
        if settings.requires_evidence(&id, index) && !plan.evidence_required {
            debug!(step_id = %id, "policy requires evidence for step");
            plan.evidence_required = true;
        }

        // Tool steps keep their declared executor.
        if plan.executor.kind == ExecutorKind::Tool {
            continue;
        }
        let ctx = RoutingContext {
            domain: &request.domain,
            step_id: &id,
            step_index: index,
            declared: &plan.executor,
        };
        let Some(choice) = gate.route(&ctx) else {
            continue;
        };
        if choice == plan.executor {
            continue;
        }
        if !settings.executor_allowed(&choice.name)
            || (choice.kind == ExecutorKind::Model && choice.prompt_template.is_none())
        {
            warn!(step_id = %id, executor = %choice.name, "routing choice rejected; keeping declared executor");
            continue;
        }
        routed.push(RoutedExecutor {
            step_id: id,
            declared: plan.executor.clone(),
            routed: choice.clone(),
        });
        plan.executor = choice;
    }

    let steps: Vec<Step> = plans
        .into_iter()
        .enumerate()
        .map(|(i, p)| Step::from_plan(p, i))
        .collect();
    let order = order
        .into_iter()
        .map(|i| steps[i].step_id().clone())
        .collect();

    let run = Run::start(
        run_id,
        request.parent_run_id.clone(),
        settings.policy_id.clone(),
        serde_json::to_value(settings).unwrap_or_default(),
    );
    Ok(Decomposition {
        document: RunDocument::new(Task::from_request(request), run, steps),
        order,
        routed,
    })
}

/// The document returned for a request that failed validation: task and run
/// FAILED, zero steps.
pub fn rejected(
    request: &TaskRequest,
    settings: &PolicySettings,
    run_id: RunId,
    reason: &str,
) -> RunDocument {
    let run = Run::start(
        run_id,
        request.parent_run_id.clone(),
        settings.policy_id.clone(),
        serde_json::to_value(settings).unwrap_or_default(),
    );
    let mut doc = RunDocument::new(Task::from_request(request), run, Vec::new());
    if let Err(e) = doc.fail(reason, RunStatus::Failed) {
        warn!(error = %e, "could not mark rejected run as failed");
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use rok_contracts::{
        policy::PolicyDecision,
        step::PromptTemplateRef,
        task::TaskStatus,
    };

    struct RoutingGate {
        route_to: Option<ExecutorSpec>,
    }

    impl PolicyGate for RoutingGate {
        fn settings(&self, _domain: &str) -> PolicySettings {
            PolicySettings::default()
        }

        fn decide(&self, _ctx: &rok_contracts::policy::PolicyContext) -> PolicyDecision {
            PolicyDecision::Finalize
        }

        fn route(&self, _ctx: &RoutingContext<'_>) -> Option<ExecutorSpec> {
            self.route_to.clone()
        }
    }

    fn model(id: &str, deps: &[&str]) -> StepPlan {
        StepPlan::new(
            format!("step {id}"),
            ExecutorSpec::model("stub", PromptTemplateRef::new("t", "1")),
        )
        .with_id(id)
        .depends_on(deps)
    }

    fn request(steps: Vec<StepPlan>) -> TaskRequest {
        let mut r = TaskRequest::new("objective", "general");
        r.steps = steps;
        r
    }

    fn check(r: &TaskRequest) -> RokResult<Vec<usize>> {
        validate(r, &assign_ids(&r.steps), &PolicySettings::default())
    }

    // ── Validation ───────────────────────────────────────────────────────────

    #[test]
    fn cycle_is_rejected_with_members() {
        let r = request(vec![model("S1", &["S3"]), model("S2", &["S1"]), model("S3", &["S2"])]);
        match check(&r).unwrap_err() {
            RokError::CyclicDependency { step_ids } => {
                assert_eq!(step_ids, vec!["S1", "S2", "S3"]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_rejected() {
        let r = request(vec![model("S1", &["S1"])]);
        assert!(check(&r).unwrap_err().to_string().contains("depends on itself"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let r = request(vec![model("S1", &["S7"])]);
        assert!(check(&r).unwrap_err().to_string().contains("unknown step 'S7'"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let r = request(vec![model("S1", &[]), model("S1", &[])]);
        assert!(check(&r).unwrap_err().to_string().contains("duplicate step id"));
    }

    #[test]
    fn empty_objective_and_step_list_are_rejected() {
        let mut r = request(vec![model("S1", &[])]);
        r.objective = "  ".to_string();
        assert!(matches!(check(&r), Err(RokError::Validation { .. })));
        assert!(check(&request(vec![])).is_err());
    }

    #[test]
    fn model_executor_without_template_is_rejected() {
        let mut plan = model("S1", &[]);
        plan.executor.prompt_template = None;
        assert!(check(&request(vec![plan])).unwrap_err().to_string().contains("prompt template"));
    }

    #[test]
    fn disallowed_domain_and_executor_are_rejected() {
        let r = request(vec![model("S1", &[])]);
        let settings = PolicySettings {
            allowed_domains: vec!["finance".to_string()],
            ..PolicySettings::default()
        };
        assert!(validate(&r, &r.steps, &settings).is_err());

        let settings = PolicySettings {
            allowed_executors: vec!["calculator".to_string()],
            ..PolicySettings::default()
        };
        assert!(validate(&r, &r.steps, &settings).unwrap_err().to_string().contains("not allowed"));
    }

    // ── Decomposition ────────────────────────────────────────────────────────

    #[test]
    fn decompose_keeps_declaration_order_and_reports_dependency_order() {
        let r = request(vec![model("S1", &["S2"]), model("S2", &[])]);
        let gate = RoutingGate { route_to: None };
        let out = decompose(&r, &PolicySettings::default(), &gate, RunId::new()).unwrap();

        let ids: Vec<_> = out.document.steps().iter().map(|s| s.step_id().to_string()).collect();
        assert_eq!(ids, vec!["S1", "S2"], "document keeps declaration order");
        assert_eq!(out.order, vec![StepId::from("S2"), StepId::from("S1")]);
        assert_eq!(out.document.task().status(), TaskStatus::Created);
    }

    #[test]
    fn routing_replaces_model_executors_only() {
        let mut r = request(vec![model("S1", &[])]);
        r.steps.push(StepPlan::new("calc", ExecutorSpec::tool("calculator")).with_id("S2"));
        let target = ExecutorSpec::model("o3_stub", PromptTemplateRef::new("t", "1"));
        let gate = RoutingGate { route_to: Some(target.clone()) };

        let out = decompose(&r, &PolicySettings::default(), &gate, RunId::new()).unwrap();
        assert_eq!(out.routed.len(), 1);
        assert_eq!(out.document.steps()[0].executor(), &target);
        assert_eq!(out.document.steps()[1].executor().name, "calculator");
    }

    #[test]
    fn policy_evidence_requirement_applies_by_logical_id() {
        let r = request(vec![model("first", &[]), model("second", &[])]);
        let settings = PolicySettings {
            evidence_required_steps: vec!["S2".to_string()],
            ..PolicySettings::default()
        };
        let gate = RoutingGate { route_to: None };
        let out = decompose(&r, &settings, &gate, RunId::new()).unwrap();
        assert!(!out.document.steps()[0].evidence_required());
        assert!(out.document.steps()[1].evidence_required());
    }

    #[test]
    fn rejected_document_has_no_steps() {
        let r = request(vec![model("S1", &["S1"])]);
        let doc = rejected(&r, &PolicySettings::default(), RunId::new(), "bad");
        assert!(doc.steps().is_empty());
        assert_eq!(doc.task().status(), TaskStatus::Failed);
        assert_eq!(doc.run().status(), RunStatus::Failed);
    }
}
