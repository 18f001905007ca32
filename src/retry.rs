//! Non-blocking retries with exponential backoff and jitter.
//!
//! BlueZ is flaky around power transitions and daemon restarts, so every
//! bus-facing operation in this library runs under a [`RetryPolicy`]. The
//! delay curve is `base * multiplier^(n-1)` capped at `max`, multiplied by
//! a uniform jitter in `[0.7, 1.3]` so that colliding clients don't retry
//! in lockstep.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_io::Timer;
use futures_util::future::{self, Either};
use rand::Rng;

use crate::error::{Error, Result};

/// Backoff parameters for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// The default policy for property writes and registration calls.
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
    };

    /// The aggressive policy used for advertisement registration, which can
    /// stay unavailable for seconds after an adapter power cycle.
    pub const ADVERTISING: Self = Self {
        max_attempts: 5,
        base_delay: Duration::from_millis(2000),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };

    /// Returns the jittered delay before attempt `n` (1-based).
    ///
    /// The result lies in `[0.7 * d, 1.3 * d]` where
    /// `d = min(max_delay, base_delay * multiplier^(n-1))`, floored at one
    /// millisecond.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let nominal = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = nominal.min(self.max_delay.as_secs_f64());
        let jittered = capped * rand::thread_rng().gen_range(0.7..=1.3);
        Duration::from_secs_f64(jittered).max(Duration::from_millis(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A cooperative cancellation flag shared between the server handle and the
/// event loop. Retry sleeps observe it between attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Runs `op` under `policy`, sleeping the jittered backoff delay between
/// attempts.
///
/// Only retryable errors (see [`Error::is_retryable`]) are re-attempted;
/// terminal errors and exhausted policies surface the last error. The
/// `cancel` token stops the retry loop at the next delay boundary with
/// [`Error::Failed`].
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "{what} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                    policy.max_attempts
                );
                Timer::after(delay).await;
                if cancel.is_cancelled() {
                    return Err(Error::Failed(format!("{what} cancelled during retry")));
                }
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    log::error!("{what} failed after {attempt} attempts: {e}");
                }
                return Err(e);
            }
        }
    }
}

/// Bounds `fut` to `limit`, failing with [`Error::Timeout`] on expiry.
///
/// The abandoned future is dropped; any in-flight bus call completes or
/// times out on its own inside zbus.
pub async fn timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    futures_util::pin_mut!(fut);
    match future::select(fut, Timer::after(limit)).await {
        Either::Left((result, _)) => result,
        Either::Right(_) => Err(Error::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_envelope() {
        let policy = RetryPolicy::DEFAULT;
        for attempt in 1..=6 {
            let nominal = (policy.base_delay.as_secs_f64()
                * policy.multiplier.powi(attempt as i32 - 1))
            .min(policy.max_delay.as_secs_f64());
            for _ in 0..50 {
                let delay = policy.delay(attempt).as_secs_f64();
                assert!(delay >= nominal * 0.7 - 1e-9, "attempt {attempt}: {delay}");
                assert!(delay <= nominal * 1.3 + 1e-9, "attempt {attempt}: {delay}");
            }
        }
    }

    #[test]
    fn delay_is_capped_by_max_delay() {
        let policy = RetryPolicy::ADVERTISING;
        // Attempt 10 would nominally be 2000ms * 2^9 = 1024s; the cap wins.
        let delay = policy.delay(10).as_secs_f64();
        assert!(delay <= 30.0 * 1.3 + 1e-9);
        assert!(delay >= 30.0 * 0.7 - 1e-9);
    }

    #[test]
    fn delay_never_underflows_one_millisecond() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_micros(10),
            max_delay: Duration::from_micros(10),
            multiplier: 1.0,
        };
        for _ in 0..20 {
            assert!(policy.delay(1) >= Duration::from_millis(1));
        }
    }

    #[test]
    fn retry_stops_on_terminal_errors() {
        let mut calls = 0;
        let result: Result<()> = pollster::block_on(retry(
            &RetryPolicy::DEFAULT,
            &CancelToken::new(),
            "op",
            || {
                calls += 1;
                async { Err(Error::NotSupported("nope".into())) }
            },
        ));
        assert!(matches!(result, Err(Error::NotSupported(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_reattempts_until_success() {
        let mut calls = 0;
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
        };
        let result = pollster::block_on(retry(&policy, &CancelToken::new(), "op", || {
            calls += 1;
            let outcome = if calls < 3 {
                Err(Error::NotReady("powering".into()))
            } else {
                Ok(calls)
            };
            async move { outcome }
        }));
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_exhausts_the_policy() {
        let mut calls = 0;
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
        };
        let result: Result<()> = pollster::block_on(retry(&policy, &CancelToken::new(), "op", || {
            calls += 1;
            async { Err(Error::InProgress("busy".into())) }
        }));
        assert!(matches!(result, Err(Error::InProgress(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn timeout_expires() {
        let result: Result<()> = pollster::block_on(timeout(
            Duration::from_millis(5),
            std::future::pending(),
        ));
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn timeout_passes_through_results() {
        let result = pollster::block_on(timeout(Duration::from_secs(1), async { Ok(7) }));
        assert_eq!(result.unwrap(), 7);
    }
}
