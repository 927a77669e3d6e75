//! Shared breaker state
//!
//! Every worker process coordinates breaker transitions through one store
//! (the durable registry in production). A transition is a compare-and-swap
//! of the whole [`BreakerRecord`], so two processes recording failures at the
//! same moment cannot lose an increment, and an outage observed by one worker
//! is refused by the governor in every other process.

use async_trait::async_trait;

use crate::{BreakerRecord, DependencyKey, Result};

#[async_trait]
pub trait BreakerStore: Send + Sync {
    /// Current row for `dependency`; [`BreakerRecord::CLOSED`] if never written
    async fn load_breaker(&self, dependency: &DependencyKey) -> Result<BreakerRecord>;

    /// Replace the row with `next` only if it still equals `expected`.
    /// `false` when another writer changed it first.
    async fn swap_breaker(
        &self,
        dependency: &DependencyKey,
        expected: &BreakerRecord,
        next: &BreakerRecord,
    ) -> Result<bool>;

    /// Every persisted row, sorted by dependency
    async fn list_breakers(&self) -> Result<Vec<(DependencyKey, BreakerRecord)>>;
}
