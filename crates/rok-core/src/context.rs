//! Per-run context passed to every component call.
//!
//! A `RunContext` is created at intake and dropped when the run reaches a
//! terminal status. It carries the policy snapshot, the task-wide revision
//! counter, the cancellation token, and the external-call deadline.

use std::{
    collections::BTreeSet,
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use rok_contracts::{
    error::{RokError, RokResult},
    ids::{RunId, StepId},
    policy::PolicySettings,
};

/// Hard per-step retry ceiling. Policy may lower it, never raise it.
pub const ABSOLUTE_MAX_RETRIES_PER_STEP: u32 = 16;

/// Hard per-task revision ceiling. Policy may lower it, never raise it.
pub const ABSOLUTE_MAX_TOTAL_REVISIONS: u32 = 256;

pub struct RunContext {
    pub run_id: RunId,
    pub domain: String,
    pub settings: PolicySettings,
    pub waived: BTreeSet<StepId>,
    pub cancel: CancellationToken,
    pub timeout: Duration,
    revisions: AtomicU32,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        domain: impl Into<String>,
        settings: PolicySettings,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        let timeout = timeout.unwrap_or(Duration::from_millis(settings.executor_timeout_ms));
        let waived = settings.waived_dependencies.iter().cloned().collect();
        Self {
            run_id,
            domain: domain.into(),
            settings,
            waived,
            cancel,
            timeout,
            revisions: AtomicU32::new(0),
        }
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.settings
            .max_retries_per_step
            .min(ABSOLUTE_MAX_RETRIES_PER_STEP)
    }

    pub fn total_ceiling(&self) -> u32 {
        self.settings
            .max_total_revisions
            .min(ABSOLUTE_MAX_TOTAL_REVISIONS)
    }

    pub fn total_revisions(&self) -> u32 {
        self.revisions.load(Ordering::Acquire)
    }

    /// Reserve one slot against the task-wide ceiling.
    ///
    /// Returns `false` once the ceiling is reached. Concurrent callers can
    /// never push the counter past it.
    pub fn try_reserve_revision(&self) -> bool {
        let ceiling = self.total_ceiling();
        let mut current = self.revisions.load(Ordering::Acquire);
        loop {
            if current >= ceiling {
                return false;
            }
            match self.revisions.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a reservation that was not used.
    pub fn release_revision(&self) {
        let _ = self
            .revisions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run an external call under the run deadline and cancellation token.
    ///
    /// Elapsed deadline maps to `Timeout`; cancellation maps to `Cancelled`.
    pub async fn bounded<T, F>(&self, operation: &str, call: F) -> RokResult<T>
    where
        F: Future<Output = RokResult<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RokError::Cancelled {
                reason: format!("'{operation}' abandoned"),
            }),
            result = tokio::time::timeout(self.timeout, call) => match result {
                Ok(inner) => inner,
                Err(_elapsed) => Err(RokError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn context(max_total: u32) -> RunContext {
        let settings = PolicySettings {
            max_total_revisions: max_total,
            max_retries_per_step: 99,
            ..PolicySettings::default()
        };
        RunContext::new(
            RunId::new(),
            "general",
            settings,
            CancellationToken::new(),
            Some(Duration::from_millis(20)),
        )
    }

    #[test]
    fn ceilings_never_exceed_absolute_limits() {
        let ctx = context(10_000);
        assert_eq!(ctx.retry_ceiling(), ABSOLUTE_MAX_RETRIES_PER_STEP);
        assert_eq!(ctx.total_ceiling(), ABSOLUTE_MAX_TOTAL_REVISIONS);
    }

    #[test]
    fn concurrent_reservations_never_overshoot() {
        let ctx = Arc::new(context(50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || (0..100).filter(|_| ctx.try_reserve_revision()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50, "exactly the ceiling must be granted");
        assert_eq!(ctx.total_revisions(), 50);
    }

    #[test]
    fn release_returns_a_slot() {
        let ctx = context(1);
        assert!(ctx.try_reserve_revision());
        assert!(!ctx.try_reserve_revision());
        ctx.release_revision();
        assert!(ctx.try_reserve_revision());
    }

    #[tokio::test]
    async fn bounded_call_times_out() {
        let ctx = context(1);
        let result: RokResult<()> = ctx
            .bounded("model:slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RokError::Timeout { timeout_ms: 20, .. })));
    }

    #[tokio::test]
    async fn bounded_call_observes_cancellation() {
        let ctx = context(1);
        ctx.cancel.cancel();
        let result: RokResult<()> = ctx
            .bounded("tool:calc", std::future::pending())
            .await;
        assert!(matches!(result, Err(RokError::Cancelled { .. })));
    }
}
