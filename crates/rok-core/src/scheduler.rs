//! Dependency scheduler.
//!
//! Pure functions over the run document. The kernel loop calls them after
//! every step completion to decide what to spawn next and which steps can
//! never run.

use std::collections::{BTreeSet, HashSet};

use rok_contracts::{document::RunDocument, ids::StepId, step::StepStatus};

/// Order step indices so every dependency precedes its dependents.
///
/// `graph[i]` holds the indices step `i` depends on. Ties are broken by
/// declaration order so replays schedule identically. On a cycle, returns
/// the indices that could not be ordered.
pub fn topological_order(graph: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = graph.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, deps) in graph.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(i);
            in_degree[i] += 1;
        }
    }

    // Kahn's algorithm; the smallest ready index is always taken first.
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        let placed: HashSet<usize> = order.into_iter().collect();
        Err((0..n).filter(|i| !placed.contains(i)).collect())
    }
}

fn dependency_satisfied(doc: &RunDocument, dep: &StepId, waived: &BTreeSet<StepId>) -> bool {
    waived.contains(dep)
        || doc
            .step(dep)
            .is_some_and(|s| s.status() == StepStatus::Verified)
}

/// Steps that may start now, in declaration order.
///
/// A step is ready when it is not terminal, not already in flight, and every
/// dependency is VERIFIED or waived.
pub fn ready_batch(
    doc: &RunDocument,
    in_flight: &HashSet<StepId>,
    waived: &BTreeSet<StepId>,
) -> Vec<StepId> {
    doc.steps()
        .iter()
        .filter(|s| !s.status().is_terminal() && !in_flight.contains(s.step_id()))
        .filter(|s| {
            s.depends_on()
                .iter()
                .all(|dep| dependency_satisfied(doc, dep, waived))
        })
        .map(|s| s.step_id().clone())
        .collect()
}

/// Not-yet-started steps that can never run because a dependency FAILED.
///
/// Returns `(step, failed dependency)` pairs in declaration order.
pub fn blocked_by_failure(doc: &RunDocument, waived: &BTreeSet<StepId>) -> Vec<(StepId, StepId)> {
    doc.steps()
        .iter()
        .filter(|s| s.status() == StepStatus::Created)
        .filter_map(|s| {
            s.depends_on()
                .iter()
                .find(|dep| {
                    !waived.contains(*dep)
                        && doc
                            .step(dep)
                            .is_some_and(|d| d.status() == StepStatus::Failed)
                })
                .map(|dep| (s.step_id().clone(), dep.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rok_contracts::{
        ids::RunId,
        step::{ExecutorSpec, Step, StepPlan},
        task::{Run, Task, TaskRequest},
    };

    fn doc(plans: Vec<StepPlan>) -> RunDocument {
        let request = TaskRequest::new("objective", "general");
        let steps = plans
            .into_iter()
            .enumerate()
            .map(|(i, p)| Step::from_plan(p, i))
            .collect();
        RunDocument::new(
            Task::from_request(&request),
            Run::start(RunId::new(), None, "test", serde_json::Value::Null),
            steps,
        )
    }

    fn tool(id: &str, deps: &[&str]) -> StepPlan {
        StepPlan::new(id, ExecutorSpec::tool("calculator"))
            .with_id(id)
            .depends_on(deps)
    }

    // ── Topological order ────────────────────────────────────────────────────

    #[test]
    fn ties_follow_declaration_order() {
        // 0 and 2 are roots; 1 depends on 2.
        let order = topological_order(&[vec![], vec![2], vec![]]).unwrap();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn cycle_reports_unordered_members() {
        let err = topological_order(&[vec![], vec![2], vec![1]]).unwrap_err();
        assert_eq!(err, vec![1, 2]);
    }

    // ── Ready batches ────────────────────────────────────────────────────────

    #[test]
    fn only_roots_are_ready_initially() {
        let d = doc(vec![tool("S1", &[]), tool("S2", &["S1"]), tool("S3", &[])]);
        let ready = ready_batch(&d, &HashSet::new(), &BTreeSet::new());
        assert_eq!(ready, vec![StepId::from("S1"), StepId::from("S3")]);
    }

    #[test]
    fn in_flight_steps_are_not_ready_again() {
        let d = doc(vec![tool("S1", &[]), tool("S2", &[])]);
        let in_flight: HashSet<StepId> = [StepId::from("S1")].into_iter().collect();
        assert_eq!(
            ready_batch(&d, &in_flight, &BTreeSet::new()),
            vec![StepId::from("S2")]
        );
    }

    #[test]
    fn waived_dependency_does_not_gate() {
        let d = doc(vec![tool("S1", &[]), tool("S2", &["S1"])]);
        let waived: BTreeSet<StepId> = [StepId::from("S1")].into_iter().collect();
        let ready = ready_batch(&d, &HashSet::new(), &waived);
        assert!(ready.contains(&StepId::from("S2")));
    }

    #[test]
    fn failed_dependency_blocks_dependents() {
        let mut d = doc(vec![tool("S1", &[]), tool("S2", &["S1"])]);
        d.with_step(&StepId::from("S1"), |s| s.fail("forced")).unwrap();

        assert!(ready_batch(&d, &HashSet::new(), &BTreeSet::new()).is_empty());
        assert_eq!(
            blocked_by_failure(&d, &BTreeSet::new()),
            vec![(StepId::from("S2"), StepId::from("S1"))]
        );
    }
}
