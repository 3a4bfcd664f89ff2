//! Exponential backoff and the retry engine.
//!
//! [`retry`] repeatedly invokes a probe until it succeeds, until the probe
//! reports a terminal failure, until the [`CheckContext`] stops, or until
//! the [`BackoffPolicy`]'s max elapsed time is reached. The same engine
//! drives dependency checks and SUT readiness checks.
//!
//! Wait intervals start at `initial_interval` and grow as
//! `min(previous × multiplier, max_interval)`. Each returned wait is
//! jittered by ±`randomization_factor`; the jittered value never feeds back
//! into the next interval.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::checker::CheckContext;
use crate::error::{CheckError, RetryError, RetryErrorKind};

/// Parameters of an exponential backoff sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Wait after the first failed attempt.
    pub initial_interval: Duration,
    /// Growth factor applied after every failed attempt (`>= 1.0`).
    pub multiplier: f64,
    /// Jitter ratio in `[0.0, 1.0]`; a wait of `w` lands in `w × (1 ± r)`.
    pub randomization_factor: f64,
    /// Cap on the un-jittered interval.
    pub max_interval: Duration,
    /// Stop retrying once this much time has passed. `None` retries until
    /// the context stops.
    pub max_elapsed_time: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl BackoffPolicy {
    /// Policy used for readiness gating: starts polling after 10ms and
    /// never waits more than a second between attempts.
    pub fn readiness() -> Self {
        Self {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Same policy without jitter.
    pub fn without_jitter(self) -> Self {
        Self {
            randomization_factor: 0.0,
            ..self
        }
    }

    /// Begin a fresh, reset sequence.
    pub fn start(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(*self)
    }
}

/// Stateful position in a backoff sequence.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial_interval.min(policy.max_interval),
            started: Instant::now(),
            policy,
        }
    }

    /// Restart from `initial_interval` with a fresh elapsed-time clock.
    pub fn reset(&mut self) {
        self.current = self.policy.initial_interval.min(self.policy.max_interval);
        self.started = Instant::now();
    }

    /// The next un-jittered interval.
    pub fn current_interval(&self) -> Duration {
        self.current
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time to wait before the next attempt, or `None` when the max elapsed
    /// time would be exceeded.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let wait = jitter(self.current, self.policy.randomization_factor);

        if let Some(max_elapsed) = self.policy.max_elapsed_time {
            if self.elapsed() + wait > max_elapsed {
                return None;
            }
        }

        self.current = grow(self.current, self.policy.multiplier, self.policy.max_interval);
        Some(wait)
    }
}

/// `min(current × multiplier, max)`, saturating on overflow.
fn grow(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let next = current.as_secs_f64() * multiplier.max(1.0);
    if !next.is_finite() || next >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(next)
    }
}

/// Uniformly pick a value in `interval × [1 - factor, 1 + factor]`.
fn jitter(interval: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 || interval.is_zero() {
        return interval;
    }
    let delta = interval.as_secs_f64() * factor;
    let low = interval.as_secs_f64() - delta;
    let jittered = low + fastrand::f64() * (2.0 * delta);
    Duration::from_secs_f64(jittered.max(0.0))
}

/// Run `op` until it succeeds, returning the number of attempts made.
///
/// Every attempt and every wait is raced against `ctx.done()`. A failure
/// observed after the context stopped ends the loop with
/// [`RetryErrorKind::Stopped`]; no further attempt is made.
pub async fn retry<F, Fut>(
    policy: &BackoffPolicy,
    ctx: &CheckContext,
    mut op: F,
) -> Result<u32, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CheckError>>,
{
    let mut backoff = policy.start();
    let mut attempts = 0u32;
    let mut last: Option<CheckError> = None;

    loop {
        if let Some(reason) = ctx.stop_reason() {
            return Err(RetryError {
                attempts,
                kind: RetryErrorKind::Stopped { reason, last },
            });
        }

        attempts = attempts.saturating_add(1);
        let outcome = tokio::select! {
            biased;
            reason = ctx.done() => Err(reason),
            result = op() => Ok(result),
        };

        let err = match outcome {
            Ok(Ok(())) => {
                debug!(attempts, "check succeeded");
                return Ok(attempts);
            }
            Ok(Err(err)) if err.is_terminal() => {
                return Err(RetryError {
                    attempts,
                    kind: RetryErrorKind::Terminal(err),
                });
            }
            Ok(Err(err)) => err,
            Err(reason) => {
                // The attempt was abandoned mid-flight.
                return Err(RetryError {
                    attempts,
                    kind: RetryErrorKind::Stopped { reason, last },
                });
            }
        };

        if let Some(reason) = ctx.stop_reason() {
            return Err(RetryError {
                attempts,
                kind: RetryErrorKind::Stopped {
                    reason,
                    last: Some(err),
                },
            });
        }

        let Some(wait) = backoff.next_backoff() else {
            return Err(RetryError {
                attempts,
                kind: RetryErrorKind::Exhausted { last: err },
            });
        };

        debug!(attempts, error = %err, wait_ms = wait.as_millis() as u64, "check failed, retrying");
        last = Some(err);

        tokio::select! {
            biased;
            reason = ctx.done() => {
                return Err(RetryError {
                    attempts,
                    kind: RetryErrorKind::Stopped { reason, last },
                });
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio_util::sync::CancellationToken;

    use crate::checker::StopReason;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(5),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(20),
            max_elapsed_time: None,
        }
    }

    #[test]
    fn intervals_grow_and_cap_without_jitter() {
        let policy = BackoffPolicy {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(1000),
            max_elapsed_time: None,
        };
        let mut backoff = policy.start();
        let waits: Vec<_> = (0..7).map(|_| backoff.next_backoff().unwrap()).collect();
        assert_eq!(
            waits,
            [100, 200, 400, 800, 1000, 1000, 1000].map(Duration::from_millis)
        );
    }

    #[test]
    fn underlying_intervals_are_monotonic_with_jitter() {
        let mut backoff = BackoffPolicy::readiness().start();
        let mut previous = backoff.current_interval();
        for _ in 0..50 {
            backoff.next_backoff().unwrap();
            let current = backoff.current_interval();
            assert!(current >= previous, "{current:?} < {previous:?}");
            assert!(current <= Duration::from_secs(1));
            previous = current;
        }
        assert_eq!(previous, Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_randomization_bounds() {
        let policy = BackoffPolicy {
            initial_interval: Duration::from_millis(1000),
            multiplier: 1.0,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(10),
            max_elapsed_time: None,
        };
        let mut backoff = policy.start();
        for _ in 0..200 {
            let wait = backoff.next_backoff().unwrap();
            assert!(wait >= Duration::from_millis(500), "{wait:?}");
            assert!(wait <= Duration::from_millis(1500), "{wait:?}");
        }
    }

    #[test]
    fn initial_interval_above_max_is_capped() {
        let policy = BackoffPolicy {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(2),
            ..BackoffPolicy::default().without_jitter()
        };
        assert_eq!(policy.start().next_backoff(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = fast_policy().start();
        backoff.next_backoff();
        backoff.next_backoff();
        assert_eq!(backoff.current_interval(), Duration::from_millis(20));
        backoff.reset();
        assert_eq!(backoff.current_interval(), Duration::from_millis(5));
    }

    #[test]
    fn max_elapsed_time_stops_sequence() {
        let policy = BackoffPolicy {
            max_elapsed_time: Some(Duration::ZERO),
            ..fast_policy()
        };
        assert_eq!(policy.start().next_backoff(), None);
    }

    #[test]
    fn huge_multiplier_saturates_at_max() {
        let max = Duration::from_secs(3);
        assert_eq!(grow(Duration::from_secs(1), f64::MAX, max), max);
        assert_eq!(grow(Duration::from_secs(1), f64::INFINITY, max), max);
    }

    #[tokio::test]
    async fn retry_returns_on_first_success() {
        let ctx = CheckContext::new(CancellationToken::new());
        let attempts = retry(&fast_policy(), &ctx, || async { Ok(()) }).await;
        assert_eq!(attempts, Ok(1));
    }

    #[tokio::test]
    async fn retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CheckContext::with_timeout(CancellationToken::new(), Duration::from_secs(5));
        let counter = calls.clone();
        let attempts = retry(&fast_policy(), &ctx, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(CheckError::not_ready("warming up"))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(attempts, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CheckContext::new(CancellationToken::new());
        let counter = calls.clone();
        let err = retry(&fast_policy(), &ctx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(CheckError::terminal("bad url")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(
            err.kind,
            RetryErrorKind::Terminal(CheckError::terminal("bad url"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_produces_stopped_with_last_error() {
        let ctx = CheckContext::with_timeout(CancellationToken::new(), Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = retry(&fast_policy(), &ctx, || async {
            Err(CheckError::not_ready("connection refused"))
        })
        .await
        .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(err.attempts >= 2);
        assert_eq!(
            err.kind,
            RetryErrorKind::Stopped {
                reason: StopReason::DeadlineExceeded,
                last: Some(CheckError::not_ready("connection refused")),
            }
        );
    }

    #[tokio::test]
    async fn already_cancelled_context_makes_no_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = CheckContext::new(token);
        let err = retry(&fast_policy(), &ctx, || async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 0);
        assert!(matches!(
            err.kind,
            RetryErrorKind::Stopped {
                reason: StopReason::Cancelled,
                last: None
            }
        ));
    }

    #[tokio::test]
    async fn hanging_probe_is_abandoned_on_cancel() {
        let ctx = CheckContext::new(CancellationToken::new());
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = retry(&fast_policy(), &ctx, || {
            std::future::pending::<Result<(), CheckError>>()
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(
            err.kind,
            RetryErrorKind::Stopped {
                reason: StopReason::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn max_elapsed_time_exhausts() {
        let policy = BackoffPolicy {
            max_elapsed_time: Some(Duration::from_millis(30)),
            ..fast_policy()
        };
        let ctx = CheckContext::new(CancellationToken::new());
        let err = retry(&policy, &ctx, || async { Err(CheckError::not_ready("down")) })
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            RetryErrorKind::Exhausted {
                last: CheckError::not_ready("down")
            }
        );
    }
}
