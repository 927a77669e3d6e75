//! Process-wide wiring
//!
//! Builds every shared component once from a [`TetherConfig`] and hands the
//! same `Arc`s to everything that needs them. Workers receive their breakers
//! through [`WorkerContext`], never by constructing their own. The registry
//! doubles as the breaker store, so every runtime opened on the same registry
//! reads and moves the same breaker rows.

use std::path::Path;
use std::sync::Arc;
use tether_core::{BreakerStore, Clock, Result, SystemClock, TetherConfig};
use tether_registry::{TursoRegistry, WorkerRegistry};
use tether_resilience::{BreakerRegistry, RetryEngine, RetryPolicy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::alerts::DegradeAlerter;
use crate::degrade::FileDegradeSink;
use crate::governor::SpawnGovernor;
use crate::lifecycle::LifecycleManager;
use crate::overrides::OverrideWatcher;
use crate::policy::PolicyLimits;
use crate::worker::WorkerContext;

pub struct Runtime {
    pub config: TetherConfig,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<dyn WorkerRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub governor: Arc<SpawnGovernor>,
    pub lifecycle: Arc<LifecycleManager>,
    pub overrides: Arc<OverrideWatcher>,
    pub sink: Arc<FileDegradeSink>,
    pub context: Arc<WorkerContext>,
}

/// Handles for the background loops started by [`Runtime::start_background`]
pub struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    /// Signal every loop to stop and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl Runtime {
    /// Open the durable registry under `root` and wire everything up
    pub async fn open(root: &Path, config: TetherConfig) -> Result<Self> {
        config.validate()?;
        let registry = TursoRegistry::open(root.join(&config.storage.db_path)).await?;
        let sink_path = root.join(&config.storage.degrade_log);
        let runtime = Self::assemble(config, Arc::new(registry), Arc::new(SystemClock), sink_path);

        // Apply persisted operator overrides before any worker runs
        runtime.overrides.sync_once().await?;
        Ok(runtime)
    }

    pub fn assemble<R>(
        config: TetherConfig,
        registry: Arc<R>,
        clock: Arc<dyn Clock>,
        degrade_log: impl AsRef<Path>,
    ) -> Self
    where
        R: WorkerRegistry + BreakerStore + 'static,
    {
        let store: Arc<dyn BreakerStore> = registry.clone();
        let registry: Arc<dyn WorkerRegistry> = registry;
        let breakers = Arc::new(
            BreakerRegistry::from_config(&config, Arc::clone(&clock)).with_store(store),
        );
        let governor = Arc::new(SpawnGovernor::from_config(
            &config,
            Arc::clone(&registry),
            Arc::clone(&breakers),
            Arc::clone(&clock),
        ));
        let lifecycle = Arc::new(LifecycleManager::from_config(
            &config,
            Arc::clone(&registry),
            Arc::clone(&clock),
        ));
        let overrides = Arc::new(OverrideWatcher::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            Arc::clone(&clock),
        ));
        let sink = Arc::new(FileDegradeSink::new(degrade_log.as_ref()));
        let alerter = Arc::new(DegradeAlerter::new(
            config.alerts,
            sink.clone(),
            Arc::clone(&clock),
        ));

        let context = Arc::new(WorkerContext {
            engine: RetryEngine::new(Arc::clone(&breakers)),
            retry_policy: RetryPolicy::from_settings(&config.retry),
            limits: PolicyLimits::from(&config.policy),
            helper_role: config.policy.helper_role.clone(),
            registry: Arc::clone(&registry),
            lifecycle: Arc::clone(&lifecycle),
            spawner: governor.clone(),
            sink: sink.clone(),
            alerter,
            clock: Arc::clone(&clock),
        });

        Self {
            config,
            clock,
            registry,
            breakers,
            governor,
            lifecycle,
            overrides,
            sink,
            context,
        }
    }

    /// Start the pruning sweeper and the override watcher
    pub fn start_background(&self) -> Background {
        let (tx, rx) = watch::channel(false);
        let sweeper = Arc::clone(&self.lifecycle).spawn_sweeper(rx.clone());
        let watcher = Arc::clone(&self.overrides)
            .spawn(self.config.lifecycle.override_poll_interval(), rx);

        info!(
            sweep_secs = self.config.lifecycle.sweep_interval_secs,
            override_poll_secs = self.config.lifecycle.override_poll_secs,
            "background maintenance started"
        );
        Background {
            shutdown: tx,
            handles: vec![sweeper, watcher],
        }
    }
}
