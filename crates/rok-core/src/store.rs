//! The shared run document.
//!
//! One `RunStore` exists per run. Every component reads and writes the
//! document through short closures applied under a `std::sync::Mutex`; the
//! lock is never held across an `.await`, so bookkeeping for one step never
//! waits on another step's executor call.

use std::sync::{Arc, Mutex, MutexGuard};

use rok_contracts::{
    document::RunDocument,
    error::{RokError, RokResult},
    ids::StepId,
};

use crate::traits::StepView;

#[derive(Clone)]
pub struct RunStore {
    inner: Arc<Mutex<RunDocument>>,
}

impl RunStore {
    pub fn new(doc: RunDocument) -> Self {
        Self {
            inner: Arc::new(Mutex::new(doc)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunDocument> {
        // A panic inside a closure cannot leave a half-applied entity: every
        // mutator validates before it writes.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read<R>(&self, f: impl FnOnce(&RunDocument) -> R) -> R {
        f(&self.lock())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut RunDocument) -> R) -> R {
        f(&mut self.lock())
    }

    /// A full copy of the current document.
    pub fn snapshot(&self) -> RunDocument {
        self.read(|doc| doc.clone())
    }

    /// Capture a read-only view of one step.
    pub fn view(&self, step_id: &StepId) -> RokResult<StepView> {
        self.read(|doc| capture_view(doc, step_id))
    }
}

pub(crate) fn capture_view(doc: &RunDocument, step_id: &StepId) -> RokResult<StepView> {
    let step = doc
        .step(step_id)
        .ok_or_else(|| RokError::state(format!("unknown step '{step_id}'")))?;
    let task = doc.task();

    let dependency_outputs = step
        .depends_on()
        .iter()
        .filter_map(|dep| {
            doc.step(dep)
                .and_then(|d| d.current_output())
                .map(|out| (dep.clone(), out.to_string()))
        })
        .collect();

    Ok(StepView {
        step_id: step.step_id().clone(),
        step_index: step.step_index(),
        logical_id: step.logical_id(),
        title: step.title().to_string(),
        description: step.description().to_string(),
        status: step.status(),
        executor: step.executor().clone(),
        verifier: step.verifier().clone(),
        evidence_required: step.evidence_required(),
        evidence: step.evidence().to_vec(),
        output: step.current_output().map(str::to_string),
        attempt: step.executions().len() as u32 + 1,
        constraints: step.accumulated_constraints(),
        dependency_outputs,
        objective: task.objective().to_string(),
        domain: task.domain().to_string(),
        task_constraints: task.constraints().to_vec(),
        inputs: task.inputs().clone(),
        sources: task.sources().to_vec(),
    })
}
