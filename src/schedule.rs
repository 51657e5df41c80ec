//! Cooperative time-slicing primitives.
//!
//! Long-running bake stages are written as explicit state machines that
//! implement [`Resumable`]: an external scheduler calls `step` once per frame
//! with a time budget, and the job returns control when the budget is spent.
//! Loop cursors live in the job struct, so nothing is lost between steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{BakeError, Result};

/// Outcome of one `step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Budget exhausted; call `step` again on the next tick.
    Pending,
    /// All work finished; `finish` returns the result.
    Done,
    /// Work stopped early (error or cancellation); `finish` returns the error.
    Failed,
}

/// Shared cancellation flag checked at every yield point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Wall-clock allowance for a single step.
#[derive(Debug, Clone, Copy)]
pub struct FrameBudget {
    start: Instant,
    limit: Duration,
}

impl FrameBudget {
    pub fn start(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self::start(Duration::MAX)
    }

    pub fn exhausted(&self) -> bool {
        self.start.elapsed() >= self.limit
    }
}

/// A unit of work that can be advanced in budgeted slices.
pub trait Resumable {
    type Output;

    /// Do as much work as fits in `budget`. Always makes progress on at least
    /// one unit of work so a zero budget cannot stall the job.
    fn step(&mut self, budget: Duration) -> StepStatus;

    /// Consume the job. Returns the output only when every step completed.
    fn finish(self) -> Result<Self::Output>;
}

/// Run a job to completion, ignoring time budgets.
pub fn run_blocking<R: Resumable>(mut job: R) -> Result<R::Output> {
    while job.step(Duration::MAX) == StepStatus::Pending {}
    job.finish()
}

/// Drive a job with a fixed per-frame budget, counting how many frames it took.
pub fn run_sliced<R: Resumable>(mut job: R, budget: Duration) -> Result<(R::Output, usize)> {
    let mut frames = 0;
    loop {
        frames += 1;
        match job.step(budget) {
            StepStatus::Pending => continue,
            StepStatus::Done | StepStatus::Failed => break,
        }
    }
    job.finish().map(|out| (out, frames))
}

/// Check the cancel flag, mapping a cancellation to [`BakeError::Canceled`].
pub(crate) fn check_canceled(token: &CancelToken) -> Result<()> {
    if token.is_canceled() {
        Err(BakeError::Canceled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts to `target`, one unit per loop iteration.
    struct Counter {
        current: u32,
        target: u32,
        cancel: CancelToken,
        failed: bool,
    }

    impl Resumable for Counter {
        type Output = u32;

        fn step(&mut self, budget: Duration) -> StepStatus {
            let budget = FrameBudget::start(budget);
            loop {
                if self.cancel.is_canceled() {
                    self.failed = true;
                    return StepStatus::Failed;
                }
                self.current += 1;
                if self.current >= self.target {
                    return StepStatus::Done;
                }
                if budget.exhausted() {
                    return StepStatus::Pending;
                }
            }
        }

        fn finish(self) -> Result<u32> {
            if self.failed {
                Err(BakeError::Canceled)
            } else {
                Ok(self.current)
            }
        }
    }

    #[test]
    fn blocking_runs_to_completion() {
        let job = Counter {
            current: 0,
            target: 1000,
            cancel: CancelToken::new(),
            failed: false,
        };
        assert_eq!(run_blocking(job).unwrap(), 1000);
    }

    #[test]
    fn zero_budget_still_progresses() {
        let job = Counter {
            current: 0,
            target: 5,
            cancel: CancelToken::new(),
            failed: false,
        };
        let (out, frames) = run_sliced(job, Duration::ZERO).unwrap();
        assert_eq!(out, 5);
        assert_eq!(frames, 5);
    }

    #[test]
    fn canceled_job_reports_error() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let job = Counter {
            current: 0,
            target: 5,
            cancel: cancel.clone(),
            failed: false,
        };
        assert!(matches!(run_blocking(job), Err(BakeError::Canceled)));
        assert!(check_canceled(&cancel).is_err());
    }
}
