//! ---
//! mnf_section: "01-core-functionality"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Readiness polling with bounded retries and cancellation."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Poll-until-ready primitive.
//!
//! A predicate is evaluated repeatedly, sleeping between attempts, until it
//! reports readiness. [`PollPolicy::fixed`] reproduces the classic unbounded
//! loop (fixed interval, no attempt cap, no timeout); callers on a deadline
//! tighten it with [`PollPolicy::with_max_attempts`],
//! [`PollPolicy::with_timeout`] and [`PollPolicy::exponential`]. A
//! [`CancelSignal`] is checked before every attempt and interrupts the sleep.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Always sleep the base interval.
    Fixed,
    /// Multiply the interval by `factor` after each failed attempt, capped at `max`.
    Exponential { factor: f64, max: Duration },
}

/// Retry policy applied by [`poll_until`] and [`poll_for`].
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub backoff: Backoff,
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    /// Fixed interval, unbounded attempts, no timeout.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff: Backoff::Fixed,
            max_attempts: None,
            timeout: None,
        }
    }

    /// Exponential backoff starting at `interval`.
    pub fn exponential(interval: Duration, factor: f64, max: Duration) -> Self {
        Self {
            interval,
            backoff: Backoff::Exponential {
                factor: factor.max(1.0),
                max,
            },
            max_attempts: None,
            timeout: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay applied after the given number of failed attempts (1-indexed).
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { factor, max } => {
                let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
                let scaled = self.interval.as_secs_f64() * factor.powi(exponent);
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}

/// Successful completion of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Number of predicate evaluations, including the successful one.
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Reasons a poll loop stops without the predicate becoming true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitFailure {
    #[error("gave up after {attempts} attempt(s)")]
    Exhausted { attempts: u32 },
    #[error("timed out after {elapsed:?} and {attempts} attempt(s)")]
    TimedOut { attempts: u32, elapsed: Duration },
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

/// Error returned by the poll functions: either the loop gave up or the
/// predicate itself failed (which stops polling immediately).
#[derive(Debug)]
pub enum PollError<E> {
    Wait(WaitFailure),
    Predicate(E),
}

impl<E: fmt::Display> fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Wait(failure) => write!(f, "{}", failure),
            PollError::Predicate(err) => write!(f, "readiness check failed: {}", err),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Wait(failure) => Some(failure),
            PollError::Predicate(err) => Some(err),
        }
    }
}

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation; every subscribed [`CancelSignal`] observes it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver side of a cancellation signal, cheap to clone into tasks.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pends forever if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected cancellation handle/signal pair.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Evaluate `predicate` until it returns `Ok(true)`.
///
/// No evaluation starts after the policy's timeout has elapsed; the sleep
/// before the deadline is shortened accordingly.
pub async fn poll_until<F, Fut, E>(
    policy: &PollPolicy,
    cancel: Option<&CancelSignal>,
    mut predicate: F,
) -> Result<PollOutcome, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    poll_for(policy, cancel, move || {
        let check = predicate();
        async move { check.await.map(|ready| ready.then_some(())) }
    })
    .await
    .map(|((), outcome)| outcome)
}

/// Evaluate `probe` until it yields `Ok(Some(value))`, returning the value.
pub async fn poll_for<F, Fut, T, E>(
    policy: &PollPolicy,
    cancel: Option<&CancelSignal>,
    mut probe: F,
) -> Result<(T, PollOutcome), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let deadline = policy.timeout.map(|timeout| started + timeout);
    let mut cancel = cancel.cloned();
    let mut attempts: u32 = 0;

    loop {
        if cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(PollError::Wait(WaitFailure::Cancelled { attempts }));
        }

        attempts += 1;
        trace!(attempts, "evaluating readiness predicate");
        if let Some(value) = probe().await.map_err(PollError::Predicate)? {
            let outcome = PollOutcome {
                attempts,
                elapsed: started.elapsed(),
            };
            debug!(attempts, elapsed_ms = outcome.elapsed.as_millis() as u64, "ready");
            return Ok((value, outcome));
        }

        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(PollError::Wait(WaitFailure::Exhausted { attempts }));
        }

        let mut delay = policy.delay_after(attempts);
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::Wait(WaitFailure::TimedOut {
                    attempts,
                    elapsed: now - started,
                }));
            }
            delay = delay.min(deadline - now);
        }

        match cancel.as_mut() {
            Some(signal) => {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = signal.cancelled() => {
                        return Err(PollError::Wait(WaitFailure::Cancelled { attempts }));
                    }
                }
            }
            None => sleep(delay).await,
        }

        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::Wait(WaitFailure::TimedOut {
                    attempts,
                    elapsed: now - started,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn flaky(ready_after: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<bool, ()>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let predicate = move || {
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(seen >= ready_after))
        };
        (calls, predicate)
    }

    #[tokio::test(start_paused = true)]
    async fn false_n_times_then_true_takes_n_plus_one_evaluations() {
        let interval = Duration::from_secs(10);
        for n in [0u32, 1, 4] {
            let (calls, predicate) = flaky(n);
            let started = Instant::now();
            let outcome = poll_until(&PollPolicy::fixed(interval), None, predicate)
                .await
                .unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), n + 1);
            assert_eq!(outcome.attempts, n + 1);
            assert_eq!(started.elapsed(), interval * n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_stops_the_loop() {
        let (calls, predicate) = flaky(u32::MAX);
        let policy = PollPolicy::fixed(Duration::from_secs(1)).with_max_attempts(3);
        let err = poll_until(&policy, None, predicate).await.unwrap_err();
        assert!(matches!(
            err,
            PollError::Wait(WaitFailure::Exhausted { attempts: 3 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_the_loop() {
        let (calls, predicate) = flaky(u32::MAX);
        let policy = PollPolicy::fixed(Duration::from_secs(4)).with_timeout(Duration::from_secs(10));
        let started = Instant::now();
        let err = poll_until(&policy, None, predicate).await.unwrap_err();
        assert!(matches!(err, PollError::Wait(WaitFailure::TimedOut { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let (handle, signal) = cancellation();
        let (calls, predicate) = flaky(u32::MAX);
        let policy = PollPolicy::fixed(Duration::from_secs(3600));
        let task = tokio::spawn(async move { poll_until(&policy, Some(&signal), predicate).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PollError::Wait(WaitFailure::Cancelled { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_signal_prevents_first_attempt() {
        let (handle, signal) = cancellation();
        handle.cancel();
        let (calls, predicate) = flaky(0);
        let err = poll_until(&PollPolicy::fixed(Duration::from_secs(1)), Some(&signal), predicate)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Wait(WaitFailure::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = poll_until(&PollPolicy::fixed(Duration::from_secs(1)), None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<bool, _>("provider down"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PollError::Predicate("provider down")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_for_returns_the_probed_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (value, outcome) = poll_for(&PollPolicy::fixed(Duration::from_secs(2)), None, move || {
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<_, ()>((seen == 2).then_some("10.0.0.7")))
        })
        .await
        .unwrap();
        assert_eq!(value, "10.0.0.7");
        assert_eq!(outcome.attempts, 3);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = PollPolicy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(10));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(5), Duration::from_secs(10));
        assert_eq!(policy.delay_after(1000), Duration::from_secs(10));
        let fixed = PollPolicy::fixed(Duration::from_secs(7));
        assert_eq!(fixed.delay_after(1), fixed.delay_after(99));
    }
}
