//! # tether-orchestrator
//!
//! Decides, for a failing worker, whether to retry, ask for a helper, or
//! degrade, and keeps the worker population bounded while doing so.
//!
//! This crate provides:
//! - Spawn governor with atomic, per-role and per-tree ceilings
//! - Session lifecycle manager with an age-based background sweeper
//! - Orchestration policy as a pure state machine
//! - Degrade sink and repeated-degrade operator alerts
//! - Operator override watcher (emergency force-open)
//! - Worker task runner tying it all together

pub mod alerts;
pub mod degrade;
pub mod governor;
pub mod lifecycle;
pub mod overrides;
pub mod policy;
pub mod runtime;
pub mod worker;

pub use alerts::{DegradeAlerter, OperatorAlert};
pub use degrade::{DegradeArtifact, DegradeSink, FileDegradeSink};
pub use governor::{SpawnDecision, SpawnGate, SpawnGovernor, SpawnRefusal, SpawnRequest};
pub use lifecycle::{LifecycleManager, SweepReport};
pub use overrides::{OverrideSync, OverrideWatcher};
pub use policy::{
    decide, transition, Action, Decision, DegradeReason, Event, FailureReport,
    PolicyLimits, SpawnTicket, TaskState,
};
pub use runtime::{Background, Runtime};
pub use worker::{Task, TaskOutcome, Worker, WorkerContext};
