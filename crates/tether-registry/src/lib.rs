//! # tether-registry
//!
//! The durable worker registry every worker and the sweeper share.
//!
//! Ceilings are enforced at insert time by [`WorkerRegistry::insert_if_under_ceiling`]:
//! the active counts and the insert are one atomic step, never a read followed
//! by a write. Both implementations are also the [`tether_core::BreakerStore`]
//! every process's circuit breakers read and compare-and-swap.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Spawn governor / lifecycle / CLI           │
//! └─────────────────┬───────────────────────────┘
//!                   │ WorkerRegistry
//! ┌─────────────────▼───────────────────────────┐
//! │  TursoRegistry (durable)  MemoryRegistry    │
//! │  • workers                                  │
//! │  • breakers (BreakerStore)                  │
//! │  • dependency_overrides                     │
//! └─────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tether_core::{
    DependencyKey, DependencyOverride, NewWorker, Result, SpawnCeilings, WorkerId, WorkerRecord,
    WorkerState,
};

pub mod db;
pub mod memory;

pub use db::{DbError, TursoRegistry};
pub use memory::MemoryRegistry;

/// Durable worker registry reachable by all workers
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Insert `worker` only if its role and its tree are both below their
    /// ceilings, counting ACTIVE workers only. Returns `None` when refused.
    async fn insert_if_under_ceiling(
        &self,
        worker: NewWorker,
        ceilings: SpawnCeilings,
    ) -> Result<Option<WorkerRecord>>;

    async fn get(&self, id: &WorkerId) -> Result<Option<WorkerRecord>>;

    /// Touch `last_heartbeat_at` of an ACTIVE worker. `false` if the worker is
    /// unknown or no longer active.
    async fn update_heartbeat(&self, id: &WorkerId, at: DateTime<Utc>) -> Result<bool>;

    async fn count_active(&self, role: &str) -> Result<u32>;

    /// ACTIVE workers whose tree is rooted at `root`
    async fn count_active_in_tree(&self, root: &WorkerId) -> Result<u32>;

    /// ACTIVE -> TERMINATED. `false` if it was not active.
    async fn mark_terminated(&self, id: &WorkerId) -> Result<bool>;

    /// ACTIVE -> DEGRADED. `false` if it was not active.
    async fn mark_degraded(&self, id: &WorkerId) -> Result<bool>;

    /// ACTIVE workers created strictly before `created_before`, oldest first
    async fn select_stale_active(
        &self,
        created_before: DateTime<Utc>,
        role: Option<&str>,
    ) -> Result<Vec<WorkerRecord>>;

    /// All workers, optionally filtered by state, oldest first
    async fn list(&self, state: Option<WorkerState>) -> Result<Vec<WorkerRecord>>;

    /// Persist an operator force-open override (replaces any existing one)
    async fn set_override(&self, entry: &DependencyOverride) -> Result<()>;

    /// `false` if there was no override for `dependency`
    async fn clear_override(&self, dependency: &DependencyKey) -> Result<bool>;

    async fn list_overrides(&self) -> Result<Vec<DependencyOverride>>;
}
