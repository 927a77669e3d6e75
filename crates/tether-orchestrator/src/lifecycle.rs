//! Session lifecycle manager
//!
//! Liveness is judged by immutable creation time. Heartbeats are recorded for
//! observability but never extend a worker's life: a worker that retries
//! forever and heartbeats every second is still pruned once it is too old.
//!
//! The background sweeper never consults breakers or the dependency. Each pass
//! is bounded by the query timeout and fails open, so it keeps running while
//! the dependency (or even the registry) is misbehaving.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tether_core::fail_open::fail_open_within;
use tether_core::{Clock, LifecycleSettings, Result, TetherConfig, WorkerId, WorkerRole};
use tether_registry::WorkerRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Result of one pruning pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Workers this pass moved ACTIVE -> TERMINATED
    pub terminated: Vec<WorkerId>,
    /// Stale candidates that had already left ACTIVE when we got to them
    pub skipped: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.terminated.extend(other.terminated);
        self.skipped += other.skipped;
    }
}

pub struct LifecycleManager {
    registry: Arc<dyn WorkerRegistry>,
    clock: Arc<dyn Clock>,
    roles: BTreeMap<String, WorkerRole>,
    settings: LifecycleSettings,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        clock: Arc<dyn Clock>,
        roles: Vec<WorkerRole>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            clock,
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
            settings,
        }
    }

    pub fn from_config(
        config: &TetherConfig,
        registry: Arc<dyn WorkerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(registry, clock, config.worker_roles(), config.lifecycle)
    }

    /// Update `last_heartbeat_at` only. `false` means the worker is no longer
    /// active and should stop.
    pub async fn heartbeat(&self, id: &WorkerId) -> Result<bool> {
        let alive = self.registry.update_heartbeat(id, self.clock.now()).await?;
        if !alive {
            debug!(worker = %id, "heartbeat from inactive worker");
        }
        Ok(alive)
    }

    /// Terminate every ACTIVE worker, of any role, created more than `max_age` ago
    pub async fn prune_stale(&self, max_age: Duration) -> Result<SweepReport> {
        self.prune(max_age, None).await
    }

    /// Prune each configured role by its own max age, and unconfigured roles by
    /// the default max age
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for role in self.roles.values() {
            report.merge(self.prune(role.max_worker_age, Some(&role.name)).await?);
        }

        let cutoff = self.cutoff(self.settings.default_max_worker_age());
        let strays = self.registry.select_stale_active(cutoff, None).await?;
        for worker in strays {
            if self.roles.contains_key(&worker.role) {
                continue;
            }
            report.merge(self.terminate(&worker.id, &worker.role).await?);
        }

        if !report.terminated.is_empty() {
            info!("sweep terminated {} stale worker(s)", report.terminated.len());
        }
        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `shutdown` flips
    /// to true (or its sender is dropped)
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.settings.sweep_interval().max(Duration::from_millis(10));
        let bound = self.settings.query_timeout();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        fail_open_within("lifecycle::sweep", bound, || self.sweep()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn cutoff(&self, max_age: Duration) -> chrono::DateTime<chrono::Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
    }

    async fn prune(&self, max_age: Duration, role: Option<&str>) -> Result<SweepReport> {
        let cutoff = self.cutoff(max_age);
        let stale = self.registry.select_stale_active(cutoff, role).await?;

        let mut report = SweepReport::default();
        for worker in stale {
            report.merge(self.terminate(&worker.id, &worker.role).await?);
        }
        Ok(report)
    }

    async fn terminate(&self, id: &WorkerId, role: &str) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        if self.registry.mark_terminated(id).await? {
            info!(worker = %id, role = %role, "pruned stale worker");
            report.terminated.push(id.clone());
        } else {
            report.skipped += 1;
        }
        Ok(report)
    }
}
