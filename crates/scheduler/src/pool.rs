//! Worker slots.
//!
//! A slot is a long-lived task that repeatedly asks the scheduler for the
//! next dispatchable job, runs it through the engine, and reports the
//! outcome back. Slots never touch job records; all bookkeeping happens in
//! the scheduler. A slot retires when the scheduler shuts down or the
//! concurrency limit drops below the number of live slots.

use crate::executor::{FailureKind, Outcome};
use crate::scheduler::{Assignment, SchedulerInner};
use std::sync::Arc;
use tracing::debug;

/// Spawn one worker slot onto the current runtime.
pub(crate) fn spawn_slot(inner: Arc<SchedulerInner>) {
    tokio::spawn(async move {
        while let Some(assignment) = inner.next_assignment().await {
            let outcome = execute_assignment(&inner, &assignment).await;
            inner.apply_outcome(&assignment.job_id, outcome);
        }
        debug!("worker slot retired");
    });
}

/// Run one assignment through the engine, enforcing the optional per-job
/// runtime limit.
///
/// On timeout the engine future is dropped (its child process is reaped by
/// kill-on-drop), the token is cancelled for good measure, and the slot
/// reports a `Timeout` failure — which the retry policy treats as
/// retryable.
async fn execute_assignment(inner: &Arc<SchedulerInner>, assignment: &Assignment) -> Outcome {
    let progress = {
        let inner = inner.clone();
        let job_id = assignment.job_id.clone();
        move |fraction: f32| inner.apply_progress(&job_id, fraction)
    };

    let execution = inner.engine.execute(
        &assignment.spec,
        &assignment.target,
        &assignment.cancel,
        &progress,
    );

    match inner.job_timeout {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(outcome) => outcome,
            Err(_) => {
                assignment.cancel.cancel();
                Outcome::failure(
                    FailureKind::Timeout,
                    format!("job exceeded maximum runtime of {}s", limit.as_secs()),
                )
            }
        },
        None => execution.await,
    }
}
