//! Execution Timeout Management
//!
//! Wall-clock limits for backend runs. The supervising deadline is the
//! policy limit plus a grace period, so a sandbox runtime's own timeout
//! always fires first and the host timer only reclaims hung runtimes.

use std::future::Future;
use std::time::Duration;
use tokio::time;

use crate::error::GatewayError;

/// Default grace between the policy limit and the supervising deadline
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Execution timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTimeout {
    /// Policy wall-clock limit
    limit: Duration,
    /// Extra time granted to the supervising timer
    grace: Duration,
}

impl Default for ExecutionTimeout {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ExecutionTimeout {
    /// Create a timeout with the default grace period
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use sentinel_gateway::backend::ExecutionTimeout;
    ///
    /// let timeout = ExecutionTimeout::new(Duration::from_secs(30));
    /// assert_eq!(timeout.supervising(), Duration::from_secs(35));
    /// ```
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            grace: DEFAULT_GRACE,
        }
    }

    /// Create a timeout from seconds
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Override the grace period
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Policy limit
    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn limit_ms(&self) -> u64 {
        u64::try_from(self.limit.as_millis()).unwrap_or(u64::MAX)
    }

    /// Limit in whole seconds, rounded up, for runtimes that take seconds
    pub fn limit_secs_ceil(&self) -> u64 {
        let secs = self.limit.as_secs();
        if self.limit.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }

    /// Deadline of the host-side supervising timer
    pub fn supervising(&self) -> Duration {
        self.limit + self.grace
    }

    /// Execute a future under the policy limit
    ///
    /// Returns `ExecutionTimeout` if the limit expires first.
    pub async fn run<F, T>(&self, future: F) -> Result<T, GatewayError>
    where
        F: Future<Output = T>,
    {
        time::timeout(self.limit, future)
            .await
            .map_err(|_| GatewayError::ExecutionTimeout(self.limit_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_default() {
        let timeout = ExecutionTimeout::default();
        assert_eq!(timeout.limit(), Duration::from_secs(30));
        assert_eq!(timeout.supervising(), Duration::from_secs(35));
    }

    #[test]
    fn test_supervising_strictly_greater() {
        let timeout = ExecutionTimeout::from_secs(2).with_grace(Duration::from_millis(500));
        assert!(timeout.supervising() > timeout.limit());
        assert_eq!(timeout.supervising(), Duration::from_millis(2500));
    }

    #[test]
    fn test_limit_secs_ceil() {
        assert_eq!(ExecutionTimeout::new(Duration::from_millis(1500)).limit_secs_ceil(), 2);
        assert_eq!(ExecutionTimeout::new(Duration::from_millis(200)).limit_secs_ceil(), 1);
        assert_eq!(ExecutionTimeout::from_secs(30).limit_secs_ceil(), 30);
    }

    #[tokio::test]
    async fn test_run_completes() {
        let timeout = ExecutionTimeout::from_secs(1);
        let value = timeout.run(async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_expires() {
        let timeout = ExecutionTimeout::new(Duration::from_millis(50));
        let result = timeout
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(GatewayError::ExecutionTimeout(50))));
    }
}
