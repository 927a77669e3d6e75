//! Fail-open utilities for background maintenance
//!
//! Background loops (the pruning sweep, the override watcher) must keep
//! running through individual failures: a failed pass is logged and the next
//! tick tries again. These helpers turn an error (or an overrun) into `None`.
//!
//! DO NOT use fail-open for:
//! - Spawn decisions (the governor must refuse, not shrug)
//! - Degrade sink writes (their failure is fatal to the task)
//! - Breaker bookkeeping (an unreachable store falls back to the
//!   process-local breaker, never to CLOSED)

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use tether_core::fail_open::fail_open;
/// use tether_core::Result;
///
/// async fn sync_overrides() -> Result<usize> {
///     Ok(0)
/// }
///
/// async fn example() {
///     let applied = fail_open("override_watcher", || sync_overrides()).await;
///     // applied is None if sync_overrides() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like [`fail_open`], but also gives up once `bound` elapses
///
/// The sweeper uses this so one slow registry scan cannot stall the loop.
pub async fn fail_open_within<F, Fut, T>(operation_name: &str, bound: Duration, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(bound, f()).await {
        Ok(Ok(val)) => Some(val),
        Ok(Err(e)) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
        Err(_) => {
            warn!(
                "{} exceeded {}ms (fail-open)",
                operation_name,
                bound.as_millis()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TetherError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, TetherError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(TetherError::Other("test error".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_fail_open_within_completes_in_time() {
        let result = fail_open_within("test_op", Duration::from_secs(1), || async {
            Ok::<_, TetherError>("done")
        })
        .await;
        assert_eq!(result, Some("done"));
    }

    #[tokio::test]
    async fn test_fail_open_within_overrun() {
        let result = fail_open_within("slow_op", Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TetherError>(1)
        })
        .await;
        assert_eq!(result, None);
    }
}
