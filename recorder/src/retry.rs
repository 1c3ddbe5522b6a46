//! Bounded exponential backoff for remote calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// Retries a failing call with delays of 1 s, 3 s, 7 s, 15 s and 31 s
/// (`next = 2 * previous + 1 s`, while below 60 s), then makes one last
/// attempt whose error is returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            increment: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// The pauses taken between attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay), move |d| {
            Some(*d * 2 + self.increment)
        })
        .take_while(move |d| *d < self.max_delay)
    }

    /// Run `op` until it succeeds or the backoff is exhausted.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        for (attempt, delay) in self.delays().enumerate() {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("{what} succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!("{what} failed (attempt {}): {e}; retrying in {delay:?}", attempt + 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        op().await
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
