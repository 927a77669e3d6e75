//! Retry engine
//!
//! Wraps one logical operation with bounded retries, exponential backoff with
//! jitter, per-attempt timeouts and breaker checks. Every failed attempt is
//! reported to the breaker; a refused attempt returns immediately as
//! `DependencyUnavailable` without sleeping.
//!
//! The returned future is cancel-safe: dropping it during a backoff sleep or an
//! attempt abandons the call without touching breaker state further.

use rand::Rng;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Classification, DependencyKey, ErrorKind, OperationError, RetrySettings};
use tracing::{debug, warn};

use crate::breakers::BreakerRegistry;
use crate::classifier::ErrorClassifier;

/// Retry policy for one call site
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial call, so at most `max_attempts + 1` calls
    /// and `max_attempts` backoff sleeps
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    pub attempt_timeout: Duration,
    pub max_attempt_timeout: Duration,
    pub retryable_kinds: BTreeSet<ErrorKind>,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay(),
            max_delay: settings.max_delay(),
            jitter_fraction: settings.jitter_fraction.clamp(0.0, 1.0),
            attempt_timeout: settings.attempt_timeout(),
            max_attempt_timeout: settings.max_attempt_timeout(),
            retryable_kinds: settings.retryable_kinds.clone(),
        }
    }

    /// Whether this policy retries `kind`
    ///
    /// Kinds without a [`tether_core::RetryableKind`] counterpart are never
    /// retried, whatever the configured set says.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind.as_retryable().is_some() && self.retryable_kinds.contains(&kind)
    }

    /// Backoff before the attempt following `attempt` (0-based), without jitter
    ///
    /// `min(max_delay, base_delay * 2^attempt)`
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `nominal_delay(attempt) * (1 + jitter)` for a jitter in `[0, 1]`
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        self.nominal_delay(attempt)
            .mul_f64(1.0 + jitter.clamp(0.0, 1.0) * self.jitter_fraction)
    }

    fn sample_jitter(&self) -> f64 {
        if self.jitter_fraction <= 0.0 {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..=1.0)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// Terminal failure of [`RetryEngine::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub dependency: DependencyKey,
    pub error: OperationError,
    pub classification: Classification,
    /// Attempts actually made (zero when the breaker refused the first one)
    pub attempts: u32,
    /// Backoff slept before each retry, in order
    pub delays: Vec<Duration>,
}

impl RetryFailure {
    pub fn kind(&self) -> ErrorKind {
        self.classification.kind
    }
}

impl std::fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s) [{}]: {}",
            self.dependency,
            self.attempts,
            self.classification.kind,
            self.error
        )
    }
}

impl std::error::Error for RetryFailure {}

/// Runs operations against dependencies guarded by shared breakers
#[derive(Clone)]
pub struct RetryEngine {
    breakers: Arc<BreakerRegistry>,
    classifier: ErrorClassifier,
}

impl RetryEngine {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            breakers,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Execute `operation` against `dependency` under `policy`
    ///
    /// For each attempt: ask the breaker first (refusal returns
    /// `DependencyUnavailable` at once), run the attempt under its timeout,
    /// record the outcome on the breaker, classify failures, and back off
    /// before retrying a retryable kind while retries remain. With
    /// `max_attempts = 3` a persistently failing call sleeps about 1s, 2s and
    /// 4s between its four tries, then fails.
    pub async fn execute<T, F, Fut>(
        &self,
        dependency: &DependencyKey,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let breaker = self.breakers.get(dependency);
        let max_retries = policy.max_attempts;
        let mut timeout = policy.attempt_timeout;
        let mut delays = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if !breaker.allow_request().await {
                let error = OperationError::CircuitOpen {
                    dependency: dependency.clone(),
                };
                let classification = self.classifier.classify(&error);
                debug!(
                    dependency = %dependency,
                    attempt = attempt + 1,
                    "breaker refused attempt"
                );
                return Err(RetryFailure {
                    dependency: dependency.clone(),
                    error,
                    classification,
                    attempts: attempt,
                    delays,
                });
            }

            let outcome = match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(OperationError::Timeout { after: timeout }),
            };
            attempt += 1;

            let error = match outcome {
                Ok(value) => {
                    breaker.record_success().await;
                    if attempt > 1 {
                        debug!(dependency = %dependency, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            breaker.record_failure().await;
            let classification = self.classifier.classify(&error);
            let retryable = classification.retryable && policy.is_retryable(classification.kind);

            if !retryable || attempt > max_retries {
                warn!(
                    dependency = %dependency,
                    attempts = attempt,
                    kind = %classification.kind,
                    "giving up: {}",
                    error
                );
                return Err(RetryFailure {
                    dependency: dependency.clone(),
                    error,
                    classification,
                    attempts: attempt,
                    delays,
                });
            }

            if classification.kind == ErrorKind::Timeout {
                timeout = timeout
                    .checked_mul(2)
                    .unwrap_or(policy.max_attempt_timeout)
                    .min(policy.max_attempt_timeout);
            }

            let mut delay = policy.backoff_delay(attempt - 1, policy.sample_jitter());
            if let Some(hint) = classification.suggested_delay {
                delay = delay.max(hint);
            }

            debug!(
                dependency = %dependency,
                attempt,
                max_retries,
                kind = %classification.kind,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            delays.push(delay);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_core::{BreakerSettings, CircuitState, ManualClock};
    use tokio::time::Instant;

    fn engine(threshold: u32) -> RetryEngine {
        let breakers = BreakerRegistry::new(
            BreakerSettings {
                failure_threshold: threshold,
                cooldown_secs: 60,
            },
            BTreeMap::new(),
            Arc::new(ManualClock::default()),
        );
        RetryEngine::new(Arc::new(breakers))
    }

    fn policy(max_attempts: u32, jitter_fraction: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction,
            ..RetryPolicy::default()
        }
    }

    fn within(actual: Duration, nominal: Duration, fraction: f64) -> bool {
        actual >= nominal && actual <= nominal.mul_f64(1.0 + fraction)
    }

    #[test]
    fn test_nominal_schedule_doubles_and_caps() {
        let p = policy(3, 0.0);
        assert_eq!(p.nominal_delay(0), Duration::from_secs(1));
        assert_eq!(p.nominal_delay(1), Duration::from_secs(2));
        assert_eq!(p.nominal_delay(2), Duration::from_secs(4));
        assert_eq!(p.nominal_delay(10), Duration::from_secs(30));
        assert_eq!(p.nominal_delay(64), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let p = policy(3, 0.25);
        assert_eq!(p.backoff_delay(1, 0.0), Duration::from_secs(2));
        assert_eq!(p.backoff_delay(1, 1.0), Duration::from_millis(2500));
    }

    #[test]
    fn test_dependency_unavailable_never_retryable() {
        let mut p = policy(3, 0.0);
        p.retryable_kinds.insert(ErrorKind::DependencyUnavailable);
        assert!(!p.is_retryable(ErrorKind::DependencyUnavailable));
        assert!(p.is_retryable(ErrorKind::Transient));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_transient_failures_back_off_one_two_four_then_fail() {
        let engine = engine(100);
        let key = DependencyKey::new("primary-api");
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = engine
            .execute(&key, &policy(3, 0.1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OperationError::Connection("reset".into())) }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Transient);
        assert_eq!(failure.delays.len(), 3);
        assert!(within(failure.delays[0], Duration::from_secs(1), 0.1));
        assert!(within(failure.delays[1], Duration::from_secs(2), 0.1));
        assert!(within(failure.delays[2], Duration::from_secs(4), 0.1));
        // The initial call plus one per retry
        assert_eq!(failure.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let total: Duration = failure.delays.iter().sum();
        assert!(started.elapsed() >= total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_after_the_last_retry() {
        let engine = engine(100);
        let key = DependencyKey::new("primary-api");
        let started = Instant::now();

        let failure = engine
            .execute(&key, &policy(2, 0.0), || async {
                Err::<(), _>(OperationError::Status {
                    code: 503,
                    message: "unavailable".into(),
                })
            })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert_eq!(
            failure.delays,
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_calls_once() {
        let engine = engine(100);
        let key = DependencyKey::new("primary-api");
        let calls = AtomicU32::new(0);

        let failure = engine
            .execute(&key, &policy(0, 0.0), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OperationError::Connection("reset".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(failure.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_returns_immediately() {
        let engine = engine(1);
        let key = DependencyKey::new("primary-api");
        engine.breakers().get(&key).record_failure().await;
        assert_eq!(engine.breakers().state(&key).await, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let failure = engine
            .execute(&key, &policy(5, 0.0), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, OperationError>(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::DependencyUnavailable);
        assert!(!failure.classification.retryable);
        assert_eq!(failure.attempts, 0);
        assert!(failure.delays.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_failed_attempt_is_recorded() {
        let engine = engine(3);
        let key = DependencyKey::new("primary-api");

        let failure = engine
            .execute(&key, &policy(2, 0.0), || async {
                Err::<(), _>(OperationError::Connection("refused".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert_eq!(engine.breakers().state(&key).await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_stops_attempts() {
        let engine = engine(2);
        let key = DependencyKey::new("primary-api");
        let calls = AtomicU32::new(0);

        let failure = engine
            .execute(&key, &policy(5, 0.0), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OperationError::Connection("refused".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(failure.kind(), ErrorKind::DependencyUnavailable);
        assert_eq!(failure.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let engine = engine(10);
        let key = DependencyKey::new("primary-api");
        let calls = AtomicU32::new(0);

        let failure = engine
            .execute(&key, &policy(5, 0.0), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OperationError::Auth("expired token".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::Auth);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(failure.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_extends_backoff() {
        let engine = engine(10);
        let key = DependencyKey::new("primary-api");
        let calls = AtomicU32::new(0);

        let value = engine
            .execute(&key, &policy(3, 0.0), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(OperationError::RateLimited {
                            retry_after: Some(Duration::from_secs(5)),
                        })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_grow_the_attempt_bound() {
        let engine = engine(10);
        let key = DependencyKey::new("primary-api");
        let p = RetryPolicy {
            attempt_timeout: Duration::from_secs(1),
            max_attempt_timeout: Duration::from_secs(4),
            ..policy(3, 0.0)
        };

        // Each attempt needs 3s: 1s and 2s bounds time out, the 4s bound succeeds
        let value = engine
            .execute(&key, &p, || async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok::<_, OperationError>(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(engine.breakers().get(&key).failure_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_resets_breaker() {
        let engine = engine(10);
        let key = DependencyKey::new("primary-api");
        let calls = AtomicU32::new(0);

        engine
            .execute(&key, &policy(3, 0.0), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OperationError::Connection("reset".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(engine.breakers().get(&key).failure_count().await, 0);
    }
}
