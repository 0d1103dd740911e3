//! Request budget per source.
//!
//! A token bucket refilled continuously at `refill_per_sec` up to `capacity`.
//! Each `fetch_batch` costs one token. Waiting for tokens suspends only the
//! calling task; if the wait would run past the caller's deadline the call
//! fails with [`FetchError::RateLimited`] without spending a token.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use super::types::{SourceAdapter, SourceBatch};
use crate::error::FetchError;

/// Budget parameters for one source.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RateBudget {
    /// Burst size; also the initial fill.
    pub capacity: u32,
    /// Steady-state requests per second.
    pub refill_per_sec: f64,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    budget: RateBudget,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(budget: RateBudget) -> Self {
        Self {
            budget,
            state: Mutex::new(BucketState {
                tokens: f64::from(budget.capacity),
                last: Instant::now(),
            }),
        }
    }

    pub fn budget(&self) -> RateBudget {
        self.budget
    }

    /// Take one token if available, otherwise report how long until one is.
    fn try_take(&self, now: Instant) -> Result<(), Duration> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let dt = now.saturating_duration_since(st.last).as_secs_f64();
        st.last = now;
        st.tokens = (st.tokens + dt * self.budget.refill_per_sec).min(f64::from(self.budget.capacity));

        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            return Ok(());
        }
        if self.budget.refill_per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        let deficit = 1.0 - st.tokens;
        Err(Duration::try_from_secs_f64(deficit / self.budget.refill_per_sec).unwrap_or(Duration::MAX))
    }

    /// Wait for a token. Fails with the remaining wait if it would overrun `deadline`.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<(), Duration> {
        loop {
            let now = Instant::now();
            let wait = match self.try_take(now) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let ready_at = now.checked_add(wait);
            if let Some(d) = deadline {
                if ready_at.map_or(true, |r| r > d) {
                    return Err(wait);
                }
            }
            // Re-check after sleeping: another task may have taken the token.
            match ready_at {
                Some(_) => sleep(wait).await,
                None => std::future::pending::<()>().await,
            }
        }
    }
}

/// A source adapter behind a per-source request budget.
pub struct RateLimitedFetcher<A: SourceAdapter> {
    adapter: A,
    bucket: TokenBucket,
}

impl<A: SourceAdapter> RateLimitedFetcher<A> {
    pub fn new(adapter: A, budget: RateBudget) -> Self {
        Self {
            adapter,
            bucket: TokenBucket::new(budget),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn source_id(&self) -> &str {
        self.adapter.source_id()
    }

    /// Spend one request from the budget, then fetch.
    pub async fn fetch_batch(
        &self,
        cursor: Option<&A::Cursor>,
        limit: usize,
        deadline: Option<Instant>,
    ) -> Result<SourceBatch<A::Cursor>, FetchError> {
        if let Err(wait) = self.bucket.acquire(deadline).await {
            tracing::debug!(
                target: "ingest",
                source = %self.source_id(),
                wait_ms = wait.as_millis() as u64,
                "request budget exhausted before deadline"
            );
            return Err(FetchError::RateLimited {
                source_id: self.source_id().to_string(),
                retry_after: (wait != Duration::MAX).then_some(wait),
            });
        }
        self.adapter.fetch_batch(cursor, limit).await
    }
}
