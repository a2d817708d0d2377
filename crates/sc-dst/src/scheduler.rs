//! Suspension points and the virtual-time scheduler.
//!
//! Coordinators suspend only through a [`Sleeper`]. In production that is
//! [`TokioSleeper`]. Under simulation it is a [`SimScheduler`]: sleeps
//! register a timer and stay pending until the scheduler fires it, which
//! moves the [`SimClock`] to the timer's deadline. Timers with equal
//! deadlines fire in registration order, so interleavings are reproducible.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures_util::task::noop_waker_ref;

use crate::clock::SimClock;
use crate::error::DstError;

/// Boxed future returned by [`Sleeper::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A source of suspension points.
pub trait Sleeper: Send + Sync {
    /// Suspend the calling task for `duration`.
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Real timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Timer firings before [`SimScheduler::block_on`] gives up.
const STEPS_COUNT_MAX: u64 = 10_000_000;

#[derive(Debug, Default)]
struct TimerQueue {
    /// `(deadline_ns, seq)`, earliest first
    deadlines: BinaryHeap<Reverse<(u64, u64)>>,
    /// Live timers; dropped sleeps are removed here and skipped on pop
    wakers: BTreeMap<u64, Option<Waker>>,
    seq_next: u64,
    fired_count: u64,
}

/// Virtual-time scheduler.
///
/// Cheap to clone; clones share the clock and the timer queue.
#[derive(Debug, Clone)]
pub struct SimScheduler {
    clock: Arc<SimClock>,
    timers: Arc<Mutex<TimerQueue>>,
}

impl SimScheduler {
    #[must_use]
    pub fn new(clock: Arc<SimClock>) -> Self {
        Self {
            clock,
            timers: Arc::new(Mutex::new(TimerQueue::default())),
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    fn timers(&self) -> MutexGuard<'_, TimerQueue> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of sleeps currently waiting.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers().wakers.len()
    }

    /// Number of timers fired so far.
    #[must_use]
    pub fn fired_count(&self) -> u64 {
        self.timers().fired_count
    }

    /// Fire the earliest live timer, moving the clock to its deadline.
    ///
    /// Returns `false` when no timer is queued.
    pub fn fire_next(&self) -> bool {
        self.fire_next_until(u64::MAX)
    }

    /// Fire the earliest live timer due at or before `limit_ns`.
    fn fire_next_until(&self, limit_ns: u64) -> bool {
        let waker = {
            let mut timers = self.timers();
            loop {
                let Some(Reverse((deadline_ns, seq))) = timers.deadlines.peek().copied() else {
                    return false;
                };
                if deadline_ns > limit_ns {
                    return false;
                }
                timers.deadlines.pop();
                if let Some(waker) = timers.wakers.remove(&seq) {
                    timers.fired_count += 1;
                    self.clock.advance_to_ns(deadline_ns);
                    break waker;
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Advance the clock by `delta`, firing every timer that comes due.
    pub fn advance(&self, delta: Duration) {
        let target_ns = self.clock.now_ns().saturating_add(delta.as_nanos() as u64);
        while self.fire_next_until(target_ns) {}
        self.clock.advance_to_ns(target_ns);
    }

    /// Drive `future` to completion on the calling thread.
    ///
    /// Whenever the future is pending the earliest timer fires. A future
    /// that waits on anything other than this scheduler's timers stalls.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, DstError> {
        let mut future = std::pin::pin!(future);
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut steps: u64 = 0;

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            if !self.fire_next() {
                return Err(DstError::Stalled {
                    now_ms: self.clock.now_ms(),
                });
            }
            steps += 1;
            if steps >= STEPS_COUNT_MAX {
                return Err(DstError::StepLimit {
                    steps_max: STEPS_COUNT_MAX,
                });
            }
        }
    }
}

impl Sleeper for SimScheduler {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        let deadline_ns = self
            .clock
            .now_ns()
            .saturating_add(duration.as_nanos().min(u128::from(u64::MAX)) as u64);
        Box::pin(SimSleep {
            scheduler: self.clone(),
            deadline_ns,
            seq: None,
        })
    }
}

/// Pending simulated sleep.
struct SimSleep {
    scheduler: SimScheduler,
    deadline_ns: u64,
    seq: Option<u64>,
}

impl Future for SimSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.scheduler.clock.now_ns() >= self.deadline_ns {
            if let Some(seq) = self.seq.take() {
                self.scheduler.timers().wakers.remove(&seq);
            }
            return Poll::Ready(());
        }

        let mut timers = self.scheduler.timers();
        match self.seq {
            Some(seq) => {
                timers.wakers.insert(seq, Some(cx.waker().clone()));
            }
            None => {
                let seq = timers.seq_next;
                timers.seq_next += 1;
                timers.deadlines.push(Reverse((self.deadline_ns, seq)));
                timers.wakers.insert(seq, Some(cx.waker().clone()));
                drop(timers);
                self.seq = Some(seq);
            }
        }
        Poll::Pending
    }
}

impl Drop for SimSleep {
    fn drop(&mut self) {
        if let Some(seq) = self.seq.take() {
            self.scheduler.timers().wakers.remove(&seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::future::join_all;

    fn scheduler() -> SimScheduler {
        SimScheduler::new(Arc::new(SimClock::new()))
    }

    #[test]
    fn test_sleep_moves_virtual_time() {
        let sched = scheduler();
        let sleeper = sched.clone();
        sched
            .block_on(async move { sleeper.sleep(Duration::from_millis(75)).await })
            .unwrap();

        assert_eq!(sched.clock().now_ms(), 75);
        assert_eq!(sched.fired_count(), 1);
        assert_eq!(sched.pending_timers(), 0);
    }

    #[test]
    fn test_concurrent_sleeps_overlap() {
        let sched = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        let tasks = [30u64, 10, 20].map(|ms| {
            let sleeper = sched.clone();
            let order = Arc::clone(&order);
            async move {
                sleeper.sleep(Duration::from_millis(ms)).await;
                order.lock().unwrap().push(ms);
            }
        });
        sched.block_on(join_all(tasks)).unwrap();

        // Overlapping sleeps end at the longest one, not the sum.
        assert_eq!(sched.clock().now_ms(), 30);
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_zero_sleep_is_ready() {
        let sched = scheduler();
        let sleeper = sched.clone();
        sched
            .block_on(async move { sleeper.sleep(Duration::ZERO).await })
            .unwrap();
        assert_eq!(sched.fired_count(), 0);
    }

    #[test]
    fn test_stall_is_reported() {
        let sched = scheduler();
        let err = sched.block_on(std::future::pending::<()>()).unwrap_err();
        assert!(matches!(err, DstError::Stalled { now_ms: 0 }));
    }

    #[test]
    fn test_dropped_sleep_does_not_move_time() {
        let sched = scheduler();
        let sleeper = sched.clone();
        {
            let mut fut = sleeper.sleep(Duration::from_secs(10));
            let mut cx = Context::from_waker(noop_waker_ref());
            assert!(fut.as_mut().poll(&mut cx).is_pending());
        }
        assert_eq!(sched.pending_timers(), 0);
        assert!(!sched.fire_next());
        assert_eq!(sched.clock().now_ms(), 0);
    }

    #[test]
    fn test_advance_fires_due_timers_only() {
        let sched = scheduler();
        let sleeper = sched.clone();
        let mut short = sleeper.sleep(Duration::from_millis(5));
        let mut long = sleeper.sleep(Duration::from_millis(50));
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(short.as_mut().poll(&mut cx).is_pending());
        assert!(long.as_mut().poll(&mut cx).is_pending());

        sched.advance(Duration::from_millis(10));
        assert_eq!(sched.clock().now_ms(), 10);
        assert!(short.as_mut().poll(&mut cx).is_ready());
        assert!(long.as_mut().poll(&mut cx).is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_sleeper_uses_runtime_clock() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(120)).await;
        assert!(start.elapsed() >= Duration::from_millis(120));
    }
}
