//! Bounded worker pool that drives [`Computation`]s.
//!
//! Every step runs while holding one permit of a shared semaphore, so at most
//! `pool_size` steps execute at a time. Between re-checks a suspended
//! computation waits on a timer without a permit.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::computation::{Computation, ComputationError, Progress};

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub steps_executed: u64,
    pub rechecks_scheduled: u64,
    /// Computations currently waiting for a re-check.
    pub suspended: usize,
    /// Steps currently executing.
    pub active: usize,
}

struct Counters {
    steps_executed: AtomicU64,
    rechecks_scheduled: AtomicU64,
    suspended: AtomicUsize,
    active: AtomicUsize,
}

/// Decrements a gauge when dropped, including on cancellation.
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared worker pool. Cheap to clone.
#[derive(Clone)]
pub struct ComputationQueue {
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl ComputationQueue {
    pub fn new(pool_size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            counters: Arc::new(Counters {
                steps_executed: AtomicU64::new(0),
                rechecks_scheduled: AtomicU64::new(0),
                suspended: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            steps_executed: self.counters.steps_executed.load(Ordering::SeqCst),
            rechecks_scheduled: self.counters.rechecks_scheduled.load(Ordering::SeqCst),
            suspended: self.counters.suspended.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
        }
    }

    /// Start driving `computation`. Firing `cancel` stops it at the next
    /// await point with [`ComputationError::Canceled`].
    pub fn submit<T: Send + 'static>(
        &self,
        computation: Computation<T>,
        cancel: CancellationToken,
    ) -> ComputationHandle<T> {
        let (tx, rx) = oneshot::channel();
        let queue = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let result = queue.drive(computation, &token).await;
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        });
        ComputationHandle { result: rx, cancel }
    }

    async fn drive<T: Send + 'static>(
        &self,
        mut computation: Computation<T>,
        cancel: &CancellationToken,
    ) -> Result<T, ComputationError> {
        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ComputationError::Canceled),
                permit = self.permits.clone().acquire_owned() => permit
                    .map_err(|_| ComputationError::failed("Worker pool closed"))?,
            };

            let progress = {
                let _active = GaugeGuard::enter(&self.counters.active);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ComputationError::Canceled),
                    progress = computation.step() => progress,
                }
            };
            self.counters.steps_executed.fetch_add(1, Ordering::SeqCst);
            drop(permit);

            match progress {
                Progress::Done(result) => return result,
                Progress::Suspended {
                    recheck_after,
                    resume,
                } => {
                    self.counters.rechecks_scheduled.fetch_add(1, Ordering::SeqCst);
                    let _suspended = GaugeGuard::enter(&self.counters.suspended);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ComputationError::Canceled),
                        _ = tokio::time::sleep(recheck_after) => {}
                    }
                    computation = resume;
                }
            }
        }
    }
}

/// Handle to a submitted computation.
pub struct ComputationHandle<T> {
    result: oneshot::Receiver<Result<T, ComputationError>>,
    cancel: CancellationToken,
}

impl<T> ComputationHandle<T> {
    /// Wait for the final result.
    pub async fn join(self) -> Result<T, ComputationError> {
        self.result
            .await
            .unwrap_or_else(|_| Err(ComputationError::failed("Computation driver stopped")))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::{suspend_until, Cond, FnCond};
    use std::time::Duration;
    use assert_matches::assert_matches;

    const POLL: Duration = Duration::from_millis(5);

    fn never_ready() -> Computation<()> {
        suspend_until(
            FnCond(|| async { Ok(Cond::pending(())) }),
            Duration::from_millis(10),
        )
    }

    // -- non-blocking suspension -----------------------------------------

    #[tokio::test]
    async fn suspended_task_does_not_block_a_pool_of_one() {
        let queue = ComputationQueue::new(1);
        let waiting = queue.submit(never_ready(), CancellationToken::new());
        let quick = queue.submit(Computation::completed(5), CancellationToken::new());

        let result = tokio::time::timeout(Duration::from_secs(2), quick.join()).await;
        assert_eq!(result.expect("quick task finished"), Ok(5));

        while queue.stats().rechecks_scheduled < 2 {
            tokio::time::sleep(POLL).await;
        }
        assert_eq!(queue.stats().suspended, 1);

        waiting.cancel();
        assert_eq!(waiting.join().await, Err(ComputationError::Canceled));
        assert_eq!(queue.stats().suspended, 0);
    }

    #[tokio::test]
    async fn steps_are_counted() {
        let queue = ComputationQueue::new(4);
        let handle = queue.submit(
            Computation::completed(1).map(|v| v + 1),
            CancellationToken::new(),
        );
        assert_eq!(handle.join().await, Ok(2));
        let stats = queue.stats();
        assert_eq!(stats.steps_executed, 1);
        assert_eq!(stats.active, 0);
    }

    // -- cancellation ----------------------------------------------------

    #[tokio::test]
    async fn cancel_interrupts_a_running_step() {
        let queue = ComputationQueue::new(1);
        let token = CancellationToken::new();
        let handle = queue.submit(
            Computation::<i32>::from_future(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            }),
            token.clone(),
        );
        tokio::time::sleep(POLL).await;
        token.cancel();
        assert_matches!(handle.join().await, Err(ComputationError::Canceled));
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test]
    async fn cancel_before_start_never_runs() {
        let queue = ComputationQueue::new(1);
        let token = CancellationToken::new();
        token.cancel();
        let handle = queue.submit(Computation::completed(1), token);
        assert_eq!(handle.join().await, Err(ComputationError::Canceled));
        assert_eq!(queue.stats().steps_executed, 0);
    }
}
