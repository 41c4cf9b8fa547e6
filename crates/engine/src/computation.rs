//! Continuation-style deferred results.
//!
//! A [`Computation`] is a chain of boxed async steps. Advancing a step yields
//! either a final result or a [`Progress::Suspended`] continuation to be
//! re-checked later. The [`ComputationQueue`](crate::task_queue::ComputationQueue)
//! drives steps on a bounded worker pool and waits out suspensions on timers
//! that hold no worker permit, so a suspended computation never blocks a
//! worker.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::ServiceId;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputationError {
    /// Distinguished cancellation; never intercepted by `recover`.
    #[error("Canceled")]
    Canceled,

    #[error("Timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("{message}")]
    Failed {
        /// Service the failure belongs to, when known.
        service_id: Option<ServiceId>,
        message: String,
    },

    #[error("Dependency {dependency_id} finished in {state}")]
    DependencyFailed {
        dependency_id: ServiceId,
        state: ServiceState,
    },

    /// Processing stopped because the record was suspended.
    #[error("Suspended")]
    Suspended,
}

impl ComputationError {
    pub fn failed(message: impl Into<String>) -> Self {
        ComputationError::Failed {
            service_id: None,
            message: message.into(),
        }
    }

    /// Attach the owning service to a `Failed` error that has none.
    pub fn for_service(self, id: ServiceId) -> Self {
        match self {
            ComputationError::Failed {
                service_id: None,
                message,
            } => ComputationError::Failed {
                service_id: Some(id),
                message,
            },
            other => other,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ComputationError::Canceled)
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        ComputationError::failed(format!("Processor panicked: {message}"))
    }
}

// ---------------------------------------------------------------------------
// Progress / Computation
// ---------------------------------------------------------------------------

pub type StepFuture<T> = Pin<Box<dyn Future<Output = Progress<T>> + Send>>;

/// Outcome of advancing a computation by one step.
pub enum Progress<T> {
    Done(Result<T, ComputationError>),
    /// Not ready yet; run `resume` after `recheck_after`.
    Suspended {
        recheck_after: Duration,
        resume: Computation<T>,
    },
}

impl<T> std::fmt::Debug for Progress<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Progress::Done(Ok(_)) => f.write_str("Done(Ok(..))"),
            Progress::Done(Err(e)) => write!(f, "Done(Err({e:?}))"),
            Progress::Suspended { recheck_after, .. } => {
                write!(f, "Suspended {{ recheck_after: {recheck_after:?} }}")
            }
        }
    }
}

/// A deferred result built from chained async steps.
pub struct Computation<T> {
    step: Box<dyn FnOnce() -> StepFuture<T> + Send>,
}

impl<T: Send + 'static> Computation<T> {
    /// Build a computation from a single step.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Progress<T>> + Send + 'static,
    {
        Self {
            step: Box::new(move || Box::pin(f())),
        }
    }

    pub fn completed(value: T) -> Self {
        Self::new(move || async move { Progress::Done(Ok(value)) })
    }

    pub fn failed(error: ComputationError) -> Self {
        Self::new(move || async move { Progress::Done(Err(error)) })
    }

    pub fn from_future<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = Result<T, ComputationError>> + Send + 'static,
    {
        Self::new(move || async move { Progress::Done(fut.await) })
    }

    /// Advance by one step. Panics inside the step become `Failed`.
    pub fn step(self) -> StepFuture<T> {
        let started = std::panic::catch_unwind(AssertUnwindSafe(self.step));
        match started {
            Ok(fut) => Box::pin(async move {
                AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Progress::Done(Err(ComputationError::from_panic(panic))))
            }),
            Err(panic) => Box::pin(async move { Progress::Done(Err(ComputationError::from_panic(panic))) }),
        }
    }

    /// Chain another computation on success. The next computation's first
    /// step runs in the same step as this one's completion.
    pub fn and_then<U, F>(self, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Computation<U> + Send + 'static,
    {
        Computation::new(move || async move {
            match self.step().await {
                Progress::Done(Ok(value)) => f(value).step().await,
                Progress::Done(Err(e)) => Progress::Done(Err(e)),
                Progress::Suspended {
                    recheck_after,
                    resume,
                } => Progress::Suspended {
                    recheck_after,
                    resume: resume.and_then(f),
                },
            }
        })
    }

    pub fn map<U, F>(self, f: F) -> Computation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |value| Computation::completed(f(value)))
    }

    /// Replace a failure with another computation. Cancellation passes through.
    pub fn recover<F>(self, handler: F) -> Self
    where
        F: FnOnce(ComputationError) -> Computation<T> + Send + 'static,
    {
        Computation::new(move || async move {
            match self.step().await {
                Progress::Done(Err(e)) if !e.is_canceled() => handler(e).step().await,
                Progress::Suspended {
                    recheck_after,
                    resume,
                } => Progress::Suspended {
                    recheck_after,
                    resume: resume.recover(handler),
                },
                done => done,
            }
        })
    }

    /// Bound the whole computation by `limit`, measured from `started_at`.
    ///
    /// The limit is checked before every step and re-check, and a running
    /// step is cut short when the limit passes.
    pub fn with_timeout(self, limit: Duration, started_at: Instant) -> Self {
        Computation::new(move || async move {
            let elapsed = started_at.elapsed();
            if elapsed >= limit {
                return Progress::Done(Err(timeout_error(elapsed)));
            }

            match tokio::time::timeout(limit - elapsed, self.step()).await {
                Ok(Progress::Suspended {
                    recheck_after,
                    resume,
                }) => {
                    let remaining = limit.saturating_sub(started_at.elapsed());
                    Progress::Suspended {
                        recheck_after: recheck_after.min(remaining),
                        resume: resume.with_timeout(limit, started_at),
                    }
                }
                Ok(done) => done,
                Err(_) => Progress::Done(Err(timeout_error(started_at.elapsed()))),
            }
        })
    }
}

fn timeout_error(elapsed: Duration) -> ComputationError {
    ComputationError::Timeout {
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
    }
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

/// Result of one condition check.
#[derive(Debug, Clone, PartialEq)]
pub struct Cond<S> {
    pub state: S,
    pub satisfied: bool,
}

impl<S> Cond<S> {
    pub fn satisfied(state: S) -> Self {
        Self {
            state,
            satisfied: true,
        }
    }

    pub fn pending(state: S) -> Self {
        Self {
            state,
            satisfied: false,
        }
    }
}

/// Condition re-checked by [`suspend_until`] until satisfied.
#[async_trait]
pub trait ContinuationCond: Send + 'static {
    type State: Send + 'static;

    async fn check(&mut self) -> Result<Cond<Self::State>, ComputationError>;
}

/// Adapts an async closure into a [`ContinuationCond`].
pub struct FnCond<F>(pub F);

#[async_trait]
impl<F, Fut, S> ContinuationCond for FnCond<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Cond<S>, ComputationError>> + Send + 'static,
    S: Send + 'static,
{
    type State = S;

    async fn check(&mut self) -> Result<Cond<S>, ComputationError> {
        (self.0)().await
    }
}

/// A computation that completes with the condition's state once it is
/// satisfied, re-checking every `poll_interval`.
pub fn suspend_until<C>(mut cond: C, poll_interval: Duration) -> Computation<C::State>
where
    C: ContinuationCond,
{
    Computation::new(move || async move {
        match cond.check().await {
            Ok(Cond {
                state,
                satisfied: true,
            }) => Progress::Done(Ok(state)),
            Ok(_) => Progress::Suspended {
                recheck_after: poll_interval,
                resume: suspend_until(cond, poll_interval),
            },
            Err(e) => Progress::Done(Err(e)),
        }
    })
}

/// Drive a computation to completion inline, sleeping through suspensions.
///
/// Only for tests and tools; the engine runs computations on a
/// [`ComputationQueue`](crate::task_queue::ComputationQueue).
pub async fn run_inline<T: Send + 'static>(mut computation: Computation<T>) -> Result<T, ComputationError> {
    loop {
        match computation.step().await {
            Progress::Done(result) => return result,
            Progress::Suspended {
                recheck_after,
                resume,
            } => {
                tokio::time::sleep(recheck_after).await;
                computation = resume;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_cond(target: usize, checks: Arc<AtomicUsize>) -> FnCond<impl FnMut() -> futures::future::Ready<Result<Cond<usize>, ComputationError>> + Send + 'static> {
        FnCond(move || {
            let n = checks.fetch_add(1, Ordering::SeqCst) + 1;
            futures::future::ready(Ok(Cond {
                state: n,
                satisfied: n >= target,
            }))
        })
    }

    // -- composition -----------------------------------------------------

    #[tokio::test]
    async fn map_and_then_compose() {
        let c = Computation::completed(2)
            .map(|v| v * 10)
            .and_then(|v| Computation::from_future(async move { Ok(v + 1) }));
        assert_eq!(run_inline(c).await, Ok(21));
    }

    #[tokio::test]
    async fn failure_skips_later_steps() {
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let c = Computation::<i32>::failed(ComputationError::failed("boom")).map(move |v| {
            seen.fetch_add(1, Ordering::SeqCst);
            v
        });
        assert_matches!(run_inline(c).await, Err(ComputationError::Failed { message, .. }) if message == "boom");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recover_handles_failure_but_not_cancellation() {
        let recovered = Computation::<i32>::failed(ComputationError::failed("x"))
            .recover(|_| Computation::completed(7));
        assert_eq!(run_inline(recovered).await, Ok(7));

        let canceled = Computation::<i32>::failed(ComputationError::Canceled)
            .recover(|_| Computation::completed(7));
        assert_eq!(run_inline(canceled).await, Err(ComputationError::Canceled));
    }

    #[tokio::test]
    async fn panic_becomes_failed() {
        let c = Computation::<i32>::new(|| async { panic!("kaboom") });
        assert_matches!(
            run_inline(c).await,
            Err(ComputationError::Failed { message, .. }) if message.contains("kaboom")
        );
    }

    // -- suspension ------------------------------------------------------

    #[tokio::test]
    async fn suspend_until_yields_discrete_rechecks() {
        let checks = Arc::new(AtomicUsize::new(0));
        let mut c = suspend_until(counter_cond(3, checks.clone()), Duration::from_millis(1))
            .map(|n| n * 100);

        let mut suspensions = 0;
        let result = loop {
            match c.step().await {
                Progress::Done(r) => break r,
                Progress::Suspended {
                    recheck_after,
                    resume,
                } => {
                    assert_eq!(recheck_after, Duration::from_millis(1));
                    suspensions += 1;
                    c = resume;
                }
            }
        };

        assert_eq!(suspensions, 2);
        assert_eq!(checks.load(Ordering::SeqCst), 3);
        assert_eq!(result, Ok(300));
    }

    // -- timeout ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timeout_cuts_a_running_step() {
        let c = Computation::<i32>::from_future(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        })
        .with_timeout(Duration::from_millis(50), Instant::now());
        assert_matches!(run_inline(c).await, Err(ComputationError::Timeout { elapsed_ms }) if elapsed_ms >= 50);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_checked_on_recheck() {
        let checks = Arc::new(AtomicUsize::new(0));
        let c = suspend_until(counter_cond(usize::MAX, checks.clone()), Duration::from_millis(20))
            .with_timeout(Duration::from_millis(50), Instant::now());
        assert_matches!(run_inline(c).await, Err(ComputationError::Timeout { .. }));
        assert!(checks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn for_service_only_fills_missing_owner() {
        assert_eq!(
            ComputationError::failed("x").for_service(4),
            ComputationError::Failed {
                service_id: Some(4),
                message: "x".into()
            }
        );
        assert_eq!(ComputationError::Canceled.for_service(4), ComputationError::Canceled);
    }
}
