//! Retry With Backoff
//!
//! Generic retry combinator parameterized by operation, attempt budget and
//! delay schedule. Delays come from the `backoff` crate: constant for fixed
//! settling, exponential for escalation.

use crate::error::Result;
use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Retry Policy
// =============================================================================

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delay {
    Constant(Duration),
    Exponential { initial: Duration, max: Duration },
}

/// Attempt budget and delay schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Delay,
}

impl RetryPolicy {
    /// Up to `max_attempts` tries with a fixed delay between them
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Delay::Constant(delay),
        }
    }

    /// Up to `max_attempts` tries, doubling the delay each time
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Delay::Exponential { initial, max },
        }
    }

    /// A single attempt, no delay
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Fresh delay schedule
    pub fn schedule(&self) -> Box<dyn Backoff + Send> {
        match self.delay {
            Delay::Constant(d) => Box::new(Constant::new(d)),
            Delay::Exponential { initial, max } => Box::new(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(initial)
                    .with_multiplier(2.0)
                    .with_randomization_factor(0.0)
                    .with_max_interval(max)
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        }
    }
}

// =============================================================================
// Combinator
// =============================================================================

/// Run `op` until it succeeds or the attempt budget is spent
///
/// `op` receives the 1-based attempt number. The last error is returned when
/// every attempt fails.
pub async fn retry<T, F, Fut>(what: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut schedule = policy.schedule();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = what, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(operation = what, attempts = attempt, error = %e, "Giving up");
                return Err(e);
            }
            Err(e) => {
                let delay = schedule.next_backoff().unwrap_or(Duration::ZERO);
                debug!(operation = what, attempt, error = %e, ?delay, "Attempt failed, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
