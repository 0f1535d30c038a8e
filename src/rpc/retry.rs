//! Retry loop with endpoint rotation and capped exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// How hard the adapter tries before surfacing an RPC failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per endpoint
    pub attempts: usize,
    /// First backoff delay, doubled on every retry
    pub base_delay: Duration,
    /// Ceiling for a single backoff sleep
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Total calls allowed across all endpoints.
    pub fn total_attempts(&self, endpoints: usize) -> usize {
        self.attempts.max(1) * endpoints.max(1)
    }

    /// Sleep before retry number `retry` (0-based). `jitter` is clamped to [0, 1]
    /// and scales an extra `base_delay` on top of the exponential term.
    pub fn backoff(&self, retry: u32, jitter: f64) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)));
        let jitter = self.base_delay.mul_f64(jitter.clamp(0.0, 1.0));
        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

/// Shared cursor over the candidate endpoint list.
#[derive(Debug, Default)]
pub struct EndpointCursor {
    current: AtomicUsize,
}

impl EndpointCursor {
    pub fn current(&self, len: usize) -> usize {
        self.current.load(Ordering::Acquire) % len.max(1)
    }

    pub fn set(&self, index: usize) {
        self.current.store(index, Ordering::Release);
    }

    /// Move past `failed`. When a concurrent caller already rotated away from
    /// it, the cursor is left where that caller put it.
    pub fn rotate_from(&self, failed: usize, len: usize) -> usize {
        let len = len.max(1);
        let next = (failed + 1) % len;
        match self
            .current
            .compare_exchange(failed, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => next,
            Err(actual) => actual % len,
        }
    }
}

/// Run `op` against the current endpoint, rotating and backing off on failure,
/// for at most `attempts × endpoints` calls. The last error is returned.
pub async fn retry_rotating<T, E, F, Fut>(
    op_name: &str,
    cursor: &EndpointCursor,
    endpoints: usize,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let total = policy.total_attempts(endpoints);
    let mut failures = 0usize;
    loop {
        let index = cursor.current(endpoints);
        match op(index).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                failures += 1;
                if failures >= total {
                    tracing::warn!(
                        op = op_name,
                        attempts = failures,
                        error = %e,
                        "RPC call exhausted all endpoints"
                    );
                    return Err(e);
                }
                let next = cursor.rotate_from(index, endpoints);
                let delay = policy.backoff((failures - 1) as u32, rand::random::<f64>());
                tracing::warn!(
                    op = op_name,
                    attempt = failures,
                    endpoint = index,
                    next_endpoint = next,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "RPC call failed, rotating endpoint"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn fast_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0, 0.0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1, 0.0), Duration::from_millis(200));
        assert_eq!(policy.backoff(1, 0.5), Duration::from_millis(250));
        assert_eq!(policy.backoff(5, 1.0), Duration::from_millis(500));
        assert_eq!(policy.backoff(u32::MAX, 1.0), Duration::from_millis(500));
    }

    #[test]
    fn rotate_from_ignores_stale_failures() {
        let cursor = EndpointCursor::default();
        assert_eq!(cursor.rotate_from(0, 3), 1);
        // a second task that also saw endpoint 0 fail must not skip endpoint 1
        assert_eq!(cursor.rotate_from(0, 3), 1);
        assert_eq!(cursor.rotate_from(1, 3), 2);
        assert_eq!(cursor.rotate_from(2, 3), 0);
    }

    #[tokio::test]
    async fn rotates_until_a_healthy_endpoint_answers() {
        let cursor = EndpointCursor::default();
        let visited = Mutex::new(Vec::new());

        let result: Result<&str, String> =
            retry_rotating("get_nonce", &cursor, 3, &fast_policy(2), |index| {
                visited.lock().unwrap().push(index);
                async move {
                    if index == 2 {
                        Ok("ok")
                    } else {
                        Err(format!("endpoint {index} down"))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(*visited.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(cursor.current(3), 2);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_attempts_times_endpoints() {
        let cursor = EndpointCursor::default();
        let calls = Mutex::new(0usize);

        let result: Result<(), String> =
            retry_rotating("send_raw_transaction", &cursor, 2, &fast_policy(3), |index| {
                let call = {
                    let mut calls = calls.lock().unwrap();
                    *calls += 1;
                    *calls
                };
                async move { Err(format!("call {call} on endpoint {index}")) }
            })
            .await;

        assert_eq!(*calls.lock().unwrap(), 6);
        assert_eq!(result.unwrap_err(), "call 6 on endpoint 1");
    }
}
