use crate::errors::{ExtractorError, ExtractorResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Bounded retry with linear back-off for transient node failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), delay }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the attempts are
    /// exhausted. Exhaustion escalates to [`ExtractorError::TransientRead`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ExtractorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExtractorResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(ExtractorError::TransientRead(format!("{what}: {e} (after {attempt} attempts)")));
                }
                Err(e) => {
                    let delay = self.delay * attempt;
                    warn!("{} failed (attempt {}/{}): {}, retrying in {:?}", what, attempt, self.max_attempts, e, delay);
                    sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = policy
            .run("flaky read", || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExtractorError::TransientRead("timeout".to_string()))
                } else {
                    Ok(7u32)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: ExtractorResult<()> = policy
            .run("dead node", || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ExtractorError::BatchFailed("connection refused".to_string()))
            })
            .await;
        assert!(matches!(result, Err(ExtractorError::TransientRead(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: ExtractorResult<()> = policy
            .run("revert", || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ExtractorError::Decode("empty".to_string()))
            })
            .await;
        assert_eq!(result, Err(ExtractorError::Decode("empty".to_string())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
