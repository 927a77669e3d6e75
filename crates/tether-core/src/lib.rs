//! # tether-core
//!
//! Core types for the tether worker resilience core.
//!
//! Workers perform small tasks against unreliable external dependencies and
//! may request helpers when a task stalls. Everything that decides whether a
//! call is attempted, retried, handed to a helper or degraded shares the types
//! defined here.
//!
//! ## Core Paradigm
//!
//! - Breaker state is one shared row per dependency, never copied per worker
//! - Worker population is bounded at insert time, never by after-the-fact pruning
//! - Worker age is measured from immutable creation time, never from heartbeats
//! - "Circuit open" is its own failure kind and can never lead to a spawn

pub mod breaker_store;
pub mod clock;
pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use breaker_store::BreakerStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AlertSettings, BreakerSettings, GovernorSettings, LifecycleSettings, PolicySettings,
    RetrySettings, RoleSettings, StorageSettings, TetherConfig,
};
pub use error::{Result, TetherError};
pub use types::*;
