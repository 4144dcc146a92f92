use crate::error::Result;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 8;

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Fixed request-rate cap shared by every outbound request of a run.
/// The bucket holds a single token, so requests are spaced at least
/// `1s / rps` apart. Zero requests per second means no cap.
#[derive(Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    limiter: Option<Arc<DirectLimiter>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let Some(rps) = NonZeroU32::new(requests_per_second) else {
            return Self::unlimited();
        };
        let quota = Quota::per_second(rps).allow_burst(NonZeroU32::MIN);
        Self {
            min_interval: Duration::from_secs(1) / rps.get(),
            limiter: Some(Arc::new(GovernorRateLimiter::direct(quota))),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self {
            min_interval: Duration::ZERO,
            limiter: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn is_unlimited(&self) -> bool {
        self.limiter.is_none()
    }

    /// Wait until this caller's slot comes up.
    pub async fn acquire(&self) {
        if let Some(ref limiter) = self.limiter {
            limiter.until_ready().await;
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_SECOND)
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `retry` (1-based): base doubled per
    /// retry, capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` through the limiter, retrying transient failures.
    /// Non-transient errors are returned immediately.
    pub async fn run<F, Fut, T>(
        &self,
        limiter: &RateLimiter,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            limiter.acquire().await;
            match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(operation = operation_name, retry, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.backoff(retry);
                    warn!(
                        operation = operation_name,
                        retry,
                        ?delay,
                        "Transient failure: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
