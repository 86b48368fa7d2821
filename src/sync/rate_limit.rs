use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::model::Provider;

const BACKOFF_SECONDS: &[u64] = &[2, 8, 30];

/// How many times a retryable provider call is attempted and how long to
/// wait between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: BACKOFF_SECONDS.len() as u32 + 1,
            backoff: BACKOFF_SECONDS.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: vec![Duration::ZERO],
        }
    }

    /// Delay before retry number `attempt` (zero based). A provider's
    /// `Retry-After` wins over the schedule.
    pub fn delay_for(&self, attempt: u32, err: &Error) -> Duration {
        if let Error::RateLimited {
            retry_after: Some(after),
            ..
        } = err
        {
            return *after;
        }
        self.backoff
            .get(attempt as usize)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether `err` on attempt `attempt` (zero based) may be retried.
    pub fn should_retry(&self, attempt: u32, err: &Error) -> bool {
        err.is_retryable() && attempt + 1 < self.max_attempts
    }
}

/// Sleep for the backoff before retry `attempt`.
pub async fn backoff_sleep(policy: &RetryPolicy, attempt: u32, err: &Error) {
    let wait = policy.delay_for(attempt, err);
    log::warn!(
        "{err}. Waiting {}ms before retry {}/{}",
        wait.as_millis(),
        attempt + 1,
        policy.max_attempts.saturating_sub(1)
    );
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
}

/// Bounds in-flight requests per provider.
#[derive(Debug, Clone)]
pub struct ProviderLimiter {
    permits: Arc<HashMap<Provider, Arc<Semaphore>>>,
}

impl ProviderLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        let permits = Provider::ALL
            .iter()
            .map(|p| (*p, Arc::new(Semaphore::new(max_in_flight.max(1)))))
            .collect();
        Self {
            permits: Arc::new(permits),
        }
    }

    pub async fn acquire(&self, provider: Provider) -> Result<OwnedSemaphorePermit> {
        let sem = self
            .permits
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::Other(format!("no limiter for {provider}")))?;
        sem.acquire_owned()
            .await
            .map_err(|_| Error::Other(format!("{provider} limiter closed")))
    }

    pub fn available(&self, provider: Provider) -> usize {
        self.permits
            .get(&provider)
            .map(|s| s.available_permits())
            .unwrap_or(0)
    }
}
