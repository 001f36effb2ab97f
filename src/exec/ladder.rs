//! Fallback Ladders
//!
//! An ordered list of named strategies sharing one attempt contract. Rungs
//! are lazy futures; `climb` polls them in order and stops at the first
//! success, so every rung runs at most once per climb.

use crate::error::Result;
use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, info, warn};

/// A rung that did not hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RungFailure {
    pub rung: String,
    pub reason: String,
}

/// Successful climb
#[derive(Debug)]
pub struct Climbed<T> {
    /// Name of the rung that succeeded
    pub rung: String,
    pub value: T,
    /// Rungs tried (and failed) before it
    pub failures: Vec<RungFailure>,
}

/// Every rung failed
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub ladder: String,
    pub failures: Vec<RungFailure>,
}

impl Exhausted {
    /// One-line summary of every failure
    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            return format!("{}: no strategies available", self.ladder);
        }
        let parts: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.rung, f.reason))
            .collect();
        parts.join("; ")
    }
}

/// Ordered strategies with stop-at-first-success semantics
pub struct Ladder<'a, T> {
    name: String,
    rungs: Vec<(String, BoxFuture<'a, Result<T>>)>,
}

impl<'a, T: Send + 'a> Ladder<'a, T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rungs: Vec::new(),
        }
    }

    /// Append a strategy
    pub fn rung<F>(mut self, name: impl Into<String>, attempt: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'a,
    {
        self.rungs.push((name.into(), Box::pin(attempt)));
        self
    }

    /// Try each rung in order until one succeeds
    pub async fn climb(self) -> std::result::Result<Climbed<T>, Exhausted> {
        let mut failures = Vec::new();

        for (rung, attempt) in self.rungs {
            debug!(ladder = %self.name, rung = %rung, "Trying strategy");
            match attempt.await {
                Ok(value) => {
                    if failures.is_empty() {
                        debug!(ladder = %self.name, rung = %rung, "Strategy succeeded");
                    } else {
                        info!(
                            ladder = %self.name,
                            rung = %rung,
                            fallbacks = failures.len(),
                            "Fallback strategy succeeded"
                        );
                    }
                    return Ok(Climbed {
                        rung,
                        value,
                        failures,
                    });
                }
                Err(e) => {
                    warn!(ladder = %self.name, rung = %rung, error = %e, "Strategy failed");
                    failures.push(RungFailure {
                        rung,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(Exhausted {
            ladder: self.name,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let later = AtomicUsize::new(0);

        let climbed = Ladder::new("test")
            .rung("first", async { Err(Error::Internal("nope".into())) })
            .rung("second", async { Ok(2) })
            .rung("third", async {
                later.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            })
            .climb()
            .await
            .unwrap();

        assert_eq!(climbed.rung, "second");
        assert_eq!(climbed.value, 2);
        assert_eq!(climbed.failures.len(), 1);
        assert_eq!(climbed.failures[0].rung, "first");
        // Lazy: the third rung never ran
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_collects_failures() {
        let exhausted = Ladder::<()>::new("test")
            .rung("a", async { Err(Error::Internal("one".into())) })
            .rung("b", async { Err(Error::Internal("two".into())) })
            .climb()
            .await
            .unwrap_err();

        assert_eq!(exhausted.failures.len(), 2);
        assert_eq!(
            exhausted.summary(),
            "a: Internal error: one; b: Internal error: two"
        );
    }

    #[test]
    fn test_empty_ladder() {
        let ladder = Ladder::<()>::new("empty");
        let exhausted = tokio_test::block_on(ladder.climb()).unwrap_err();
        assert_eq!(exhausted.summary(), "empty: no strategies available");
    }
}
