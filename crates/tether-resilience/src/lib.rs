//! # tether-resilience
//!
//! Call-level resilience for workers talking to external dependencies:
//!
//! - [`CircuitBreaker`]: per-dependency CLOSED/OPEN/HALF_OPEN gate, a handle
//!   to the row every process shares
//! - [`BreakerRegistry`]: one shared breaker per dependency key
//! - [`ErrorClassifier`]: raw failure to [`tether_core::ErrorKind`]
//! - [`RetryEngine`]: bounded retries with backoff, jitter and timeouts
//!
//! ```
//! use std::sync::Arc;
//! use tether_resilience::{BreakerRegistry, CircuitState};
//! use tether_core::{ManualClock, TetherConfig, DependencyKey};
//!
//! # async fn example() {
//! let breakers = BreakerRegistry::from_config(&TetherConfig::default(), Arc::new(ManualClock::default()));
//! assert_eq!(breakers.state(&DependencyKey::new("primary-api")).await, CircuitState::Closed);
//! # }
//! ```

pub mod breakers;
pub mod circuit_breaker;
pub mod classifier;
pub mod retry;

pub use breakers::BreakerRegistry;
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker};
pub use classifier::ErrorClassifier;
pub use retry::{RetryEngine, RetryFailure, RetryPolicy};
pub use tether_core::CircuitState;
