//! Circuit breaker for unreliable external dependencies
//!
//! Implements the circuit breaker pattern to stop calling a dependency that is
//! failing, and to probe it again once a cooldown has elapsed.
//!
//! The authoritative state is the dependency's [`BreakerRecord`] in a
//! [`BreakerStore`] shared by every worker process; each transition is one
//! compare-and-swap of that row, so operations on one dependency are
//! linearizable across processes. Each process also keeps the last row it saw
//! packed into a single `AtomicU64`. A breaker without a store (or whose store
//! is unreachable) runs the same compare-and-swap loop against that word, so
//! the process never forgets failures it observed itself.
//!
//! ```text
//!  bits 0..2   state (closed / open / half-open)
//!  bits 2..22  consecutive failures (saturating)
//!  bits 22..64 millis since epoch: opened_at (open) or probe start (half-open)
//! ```

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    BreakerRecord, BreakerSettings, BreakerStore, CircuitState, Clock, DependencyKey, SystemClock,
};
use tracing::{info, warn};

const STATE_BITS: u32 = 2;
const FAILURE_BITS: u32 = 20;
const TIME_SHIFT: u32 = STATE_BITS + FAILURE_BITS;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const FAILURE_MASK: u64 = (1 << FAILURE_BITS) - 1;
const MAX_FAILURES: u32 = FAILURE_MASK as u32;
const MAX_MILLIS: u64 = (1 << (64 - TIME_SHIFT)) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Packed {
    state: CircuitState,
    failures: u32,
    stamp_ms: u64,
}

impl Packed {
    const CLOSED: Packed = Packed {
        state: CircuitState::Closed,
        failures: 0,
        stamp_ms: 0,
    };

    fn encode(self) -> u64 {
        let state = match self.state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        let failures = u64::from(self.failures.min(MAX_FAILURES));
        (self.stamp_ms.min(MAX_MILLIS) << TIME_SHIFT) | (failures << STATE_BITS) | state
    }

    fn decode(word: u64) -> Self {
        let state = match word & STATE_MASK {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        };
        Self {
            state,
            failures: ((word >> STATE_BITS) & FAILURE_MASK) as u32,
            stamp_ms: word >> TIME_SHIFT,
        }
    }
}

impl From<BreakerRecord> for Packed {
    fn from(record: BreakerRecord) -> Self {
        Self {
            state: record.state,
            failures: record.consecutive_failures.min(MAX_FAILURES),
            stamp_ms: record.stamp_ms.min(MAX_MILLIS),
        }
    }
}

impl From<Packed> for BreakerRecord {
    fn from(packed: Packed) -> Self {
        Self {
            state: packed.state,
            consecutive_failures: packed.failures,
            stamp_ms: packed.stamp_ms,
        }
    }
}

/// Point-in-time view of a breaker, for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub dependency: DependencyKey,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub probe_started_at: Option<DateTime<Utc>>,
    pub forced_open: bool,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

/// Outcome of one transition attempt: the state observed and, if the step
/// wrote one, the state that replaced it
type Transition = (Packed, Option<Packed>);

/// OPEN admits nobody until the cooldown has elapsed, then one caller moves
/// the breaker to HALF_OPEN. A HALF_OPEN probe that never reported back is
/// replaced after another full cooldown.
fn admit_step(packed: Packed, now: u64, cooldown: u64) -> Option<Packed> {
    match packed.state {
        CircuitState::Closed => None,
        CircuitState::Open | CircuitState::HalfOpen => {
            if now.saturating_sub(packed.stamp_ms) < cooldown {
                None
            } else {
                Some(Packed {
                    state: CircuitState::HalfOpen,
                    stamp_ms: now,
                    ..packed
                })
            }
        }
    }
}

fn success_step(packed: Packed) -> Option<Packed> {
    match packed.state {
        CircuitState::Closed if packed.failures == 0 => None,
        CircuitState::Closed | CircuitState::HalfOpen => Some(Packed::CLOSED),
        CircuitState::Open => Some(Packed {
            failures: 0,
            ..packed
        }),
    }
}

fn failure_step(packed: Packed, now: u64, threshold: u32) -> Option<Packed> {
    let failures = packed.failures.saturating_add(1).min(MAX_FAILURES);
    Some(match packed.state {
        CircuitState::Closed if failures >= threshold => Packed {
            state: CircuitState::Open,
            failures,
            stamp_ms: now,
        },
        CircuitState::HalfOpen => Packed {
            state: CircuitState::Open,
            failures,
            stamp_ms: now,
        },
        CircuitState::Closed | CircuitState::Open => Packed { failures, ..packed },
    })
}

/// Circuit breaker guarding one dependency
///
/// # States
///
/// - **Closed**: Normal operation, all requests allowed
/// - **Open**: Threshold reached, requests rejected until the cooldown elapses
/// - **HalfOpen**: Cooldown elapsed, exactly one probe admitted
///
/// One instance exists per [`DependencyKey`] in each process and is shared by
/// reference (`Arc`) with every worker and helper that calls that dependency.
/// With a store attached, every instance for the same key in every process is
/// a handle to the same persisted row.
///
/// # Example
///
/// ```
/// use tether_resilience::CircuitBreaker;
/// use tether_core::CircuitState;
///
/// # async fn example() {
/// let cb = CircuitBreaker::with_system_clock("primary-api", 3, 60);
///
/// cb.record_failure().await;
/// cb.record_failure().await;
/// cb.record_failure().await;
///
/// assert_eq!(cb.state().await, CircuitState::Open);
/// assert!(!cb.allow_request().await);
/// # }
/// ```
pub struct CircuitBreaker {
    dependency: DependencyKey,
    word: AtomicU64,
    forced_open: AtomicBool,
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn BreakerStore>>,
}

impl CircuitBreaker {
    /// Create a process-local breaker reading time from `clock`
    pub fn new(
        dependency: impl Into<DependencyKey>,
        settings: BreakerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dependency: dependency.into(),
            word: AtomicU64::new(Packed::CLOSED.encode()),
            forced_open: AtomicBool::new(false),
            threshold: settings.failure_threshold.clamp(1, MAX_FAILURES),
            cooldown: settings.cooldown(),
            clock,
            store: None,
        }
    }

    /// Create a breaker on the system clock
    ///
    /// # Arguments
    ///
    /// * `threshold` - Number of consecutive failures before opening circuit
    /// * `cooldown_secs` - Seconds to wait before admitting a half-open probe
    pub fn with_system_clock(
        dependency: impl Into<DependencyKey>,
        threshold: u32,
        cooldown_secs: u64,
    ) -> Self {
        Self::new(
            dependency,
            BreakerSettings {
                failure_threshold: threshold,
                cooldown_secs,
            },
            Arc::new(SystemClock),
        )
    }

    /// Keep this breaker's state in `store`, shared with every other process
    pub fn with_store(mut self, store: Arc<dyn BreakerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn dependency(&self) -> &DependencyKey {
        &self.dependency
    }

    pub fn is_shared(&self) -> bool {
        self.store.is_some()
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_millis().min(MAX_MILLIS)
    }

    fn cooldown_ms(&self) -> u64 {
        self.cooldown.as_millis() as u64
    }

    fn load_local(&self) -> Packed {
        Packed::decode(self.word.load(Ordering::Acquire))
    }

    fn mirror(&self, packed: Packed) {
        self.word.store(packed.encode(), Ordering::Release);
    }

    /// Latest state, from the store when there is one
    async fn current(&self) -> Packed {
        if let Some(store) = &self.store {
            match store.load_breaker(&self.dependency).await {
                Ok(record) => {
                    let packed = Packed::from(record);
                    self.mirror(packed);
                    return packed;
                }
                Err(e) => warn!(
                    dependency = %self.dependency,
                    error = %e,
                    "breaker store unreachable, reading process-local state"
                ),
            }
        }
        self.load_local()
    }

    /// Apply `step` atomically: against the shared row when a store is
    /// attached, otherwise (or if the store fails) against the local word
    async fn transact<F>(&self, step: F) -> Transition
    where
        F: Fn(Packed, u64) -> Option<Packed> + Send + Sync,
    {
        if let Some(store) = &self.store {
            match self.transact_shared(store.as_ref(), &step).await {
                Ok(outcome) => {
                    self.mirror(outcome.1.unwrap_or(outcome.0));
                    return outcome;
                }
                Err(e) => warn!(
                    dependency = %self.dependency,
                    error = %e,
                    "breaker store unreachable, using process-local state"
                ),
            }
        }
        self.transact_local(&step)
    }

    async fn transact_shared<F>(
        &self,
        store: &dyn BreakerStore,
        step: &F,
    ) -> tether_core::Result<Transition>
    where
        F: Fn(Packed, u64) -> Option<Packed> + Send + Sync,
    {
        loop {
            let row = store.load_breaker(&self.dependency).await?;
            let before = Packed::from(row);
            let Some(next) = step(before, self.now_ms()) else {
                return Ok((before, None));
            };
            // Compare against the row as read, not its re-encoded form
            if store
                .swap_breaker(&self.dependency, &row, &BreakerRecord::from(next))
                .await?
            {
                return Ok((before, Some(next)));
            }
        }
    }

    fn transact_local<F>(&self, step: &F) -> Transition
    where
        F: Fn(Packed, u64) -> Option<Packed>,
    {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let before = Packed::decode(current);
            let Some(next) = step(before, self.now_ms()) else {
                return (before, None);
            };
            match self.word.compare_exchange_weak(
                current,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (before, Some(next)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Current state as seen by callers
    ///
    /// Reading the state never transitions it; only [`allow_request`]
    /// moves OPEN to HALF_OPEN. A forced override reports OPEN.
    ///
    /// [`allow_request`]: CircuitBreaker::allow_request
    pub async fn state(&self) -> CircuitState {
        if self.is_forced_open() {
            CircuitState::Open
        } else {
            self.current().await.state
        }
    }

    /// Consecutive failures since the last success
    pub async fn failure_count(&self) -> u32 {
        self.current().await.failures
    }

    /// Whether a call may be attempted now
    ///
    /// CLOSED admits everyone. OPEN admits nobody until the cooldown has
    /// elapsed; then exactly one caller wins the compare-and-swap to HALF_OPEN
    /// and becomes the probe, whichever process it runs in. A probe that never
    /// reports back is replaced after another full cooldown.
    pub async fn allow_request(&self) -> bool {
        if self.is_forced_open() {
            return false;
        }

        let cooldown = self.cooldown_ms();
        let (before, moved) = self
            .transact(|packed, now| admit_step(packed, now, cooldown))
            .await;
        match moved {
            Some(_) if before.state == CircuitState::Open => {
                info!(dependency = %self.dependency, "circuit half-open, admitting probe");
                true
            }
            Some(_) => {
                warn!(dependency = %self.dependency, "half-open probe went silent, admitting a new one");
                true
            }
            None => before.state == CircuitState::Closed,
        }
    }

    /// Record a successful call
    ///
    /// Resets the failure count; a successful HALF_OPEN probe closes the
    /// circuit.
    pub async fn record_success(&self) {
        let (before, moved) = self.transact(|packed, _| success_step(packed)).await;
        if moved.is_some() && before.state == CircuitState::HalfOpen {
            info!(dependency = %self.dependency, "probe succeeded, circuit closed");
        }
    }

    /// Record a failed call
    ///
    /// CLOSED opens once the count reaches the threshold; a failed HALF_OPEN
    /// probe reopens immediately with a fresh `opened_at`. Failures while
    /// already OPEN do not extend the cooldown.
    pub async fn record_failure(&self) {
        let threshold = self.threshold;
        let (before, moved) = self
            .transact(|packed, now| failure_step(packed, now, threshold))
            .await;
        let Some(after) = moved else { return };
        match (before.state, after.state) {
            (CircuitState::Closed, CircuitState::Open) => warn!(
                dependency = %self.dependency,
                failures = after.failures,
                "circuit opened"
            ),
            (CircuitState::HalfOpen, CircuitState::Open) => warn!(
                dependency = %self.dependency,
                "probe failed, circuit reopened"
            ),
            _ => {}
        }
    }

    /// Operator emergency stop: reject every request until cleared
    pub fn force_open(&self) {
        if !self.forced_open.swap(true, Ordering::AcqRel) {
            warn!(dependency = %self.dependency, "circuit forced open by operator");
        }
    }

    /// Lift an operator override; failure-counted state is untouched
    pub fn clear_override(&self) {
        if self.forced_open.swap(false, Ordering::AcqRel) {
            info!(dependency = %self.dependency, "operator override cleared");
        }
    }

    pub fn is_forced_open(&self) -> bool {
        self.forced_open.load(Ordering::Acquire)
    }

    /// Time until a probe would be admitted
    ///
    /// `None` while an operator override is active (only a manual reset
    /// reopens the path); zero when requests are currently allowed.
    pub async fn time_until_probe(&self) -> Option<Duration> {
        if self.is_forced_open() {
            return None;
        }
        let packed = self.current().await;
        match packed.state {
            CircuitState::Closed => Some(Duration::ZERO),
            CircuitState::Open | CircuitState::HalfOpen => {
                let elapsed = self.now_ms().saturating_sub(packed.stamp_ms);
                Some(Duration::from_millis(
                    self.cooldown_ms().saturating_sub(elapsed),
                ))
            }
        }
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let packed = self.current().await;
        let stamp = DateTime::from_timestamp_millis(packed.stamp_ms as i64);
        let forced_open = self.is_forced_open();
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: if forced_open { CircuitState::Open } else { packed.state },
            consecutive_failures: packed.failures,
            opened_at: if packed.state == CircuitState::Open { stamp } else { None },
            probe_started_at: if packed.state == CircuitState::HalfOpen {
                stamp
            } else {
                None
            },
            forced_open,
            failure_threshold: self.threshold,
            cooldown: self.cooldown,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let packed = self.load_local();
        f.debug_struct("CircuitBreaker")
            .field("dependency", &self.dependency)
            .field("state", &packed.state)
            .field("failures", &packed.failures)
            .field("forced_open", &self.is_forced_open())
            .field("shared", &self.is_shared())
            .field("threshold", &self.threshold)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}
