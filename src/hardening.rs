use crate::types::{ObservedError, Result};
use std::future::Future;
use std::time::Duration;

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && self.is_retryable(&e) => {
                    let delay = self.backoff(attempts);
                    tracing::warn!(
                        "Request failed (attempt {}): {}. Retrying in {:?} (jittered)...",
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let base_delay = self.base_delay_ms.saturating_mul(2u64.saturating_pow(attempts - 1));
        // ±25% jitter
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base_delay as i64 + jitter).max(1) as u64)
    }

    fn is_retryable(&self, err: &ObservedError) -> bool {
        err.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParleyError;

    #[tokio::test]
    async fn test_retry_policy_eventual_success() {
        let policy = RetryPolicy::new(3, 1);
        let mut attempts = 0;

        let result: Result<i32> = policy
            .execute_with_retry(|| {
                attempts += 1;
                let a = attempts;
                async move {
                    if a < 3 {
                        Err(ParleyError::Transport("connection reset".to_string()).into())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        match result {
            Ok(val) => assert_eq!(val, 42),
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_policy_skips_permanent_errors() {
        let policy = RetryPolicy::new(5, 1);
        let mut attempts = 0;

        let result: Result<()> = policy
            .execute_with_retry(|| {
                attempts += 1;
                async { Err(ParleyError::Validation("bad input".to_string()).into()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_policy_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, 1);
        let mut attempts = 0;

        let result: Result<()> = policy
            .execute_with_retry(|| {
                attempts += 1;
                async { Err(ParleyError::Transport("down".to_string()).into()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }
}
