//! Operator emergency stop
//!
//! `trip` persists a force-open override in the registry and applies it to the
//! local breakers; other processes pick it up through the watcher. Overrides
//! never expire on their own: only `reset` clears them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tether_core::fail_open::fail_open;
use tether_core::{Clock, DependencyKey, DependencyOverride, Result};
use tether_registry::WorkerRegistry;
use tether_resilience::BreakerRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Changes applied by one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideSync {
    pub forced: Vec<DependencyKey>,
    pub cleared: Vec<DependencyKey>,
}

pub struct OverrideWatcher {
    registry: Arc<dyn WorkerRegistry>,
    breakers: Arc<BreakerRegistry>,
    clock: Arc<dyn Clock>,
}

impl OverrideWatcher {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        breakers: Arc<BreakerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            breakers,
            clock,
        }
    }

    /// Force `dependency` open everywhere
    pub async fn trip(&self, dependency: &DependencyKey, reason: Option<String>) -> Result<()> {
        self.registry
            .set_override(&DependencyOverride {
                dependency: dependency.clone(),
                reason,
                set_at: self.clock.now(),
            })
            .await?;
        self.breakers.force_open(dependency);
        Ok(())
    }

    /// Lift the override on `dependency`. `false` if none was set.
    pub async fn reset(&self, dependency: &DependencyKey) -> Result<bool> {
        let existed = self.registry.clear_override(dependency).await?;
        self.breakers.clear_override(dependency);
        Ok(existed)
    }

    /// Make the local breakers match the persisted overrides
    pub async fn sync_once(&self) -> Result<OverrideSync> {
        let persisted: BTreeSet<DependencyKey> = self
            .registry
            .list_overrides()
            .await?
            .into_iter()
            .map(|o| o.dependency)
            .collect();
        let local: BTreeSet<DependencyKey> = self.breakers.forced_keys().into_iter().collect();

        let mut sync = OverrideSync::default();
        for key in persisted.difference(&local) {
            warn!(dependency = %key, "applying operator force-open override");
            self.breakers.force_open(key);
            sync.forced.push(key.clone());
        }
        for key in local.difference(&persisted) {
            warn!(dependency = %key, "operator override lifted");
            self.breakers.clear_override(key);
            sync.cleared.push(key.clone());
        }
        Ok(sync)
    }

    /// Poll the registry every `interval` until shutdown
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        fail_open("overrides::sync", || self.sync_once()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("override watcher stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tether_core::{BreakerSettings, CircuitState, ManualClock};
    use tether_registry::MemoryRegistry;

    fn breakers(clock: Arc<dyn Clock>) -> Arc<BreakerRegistry> {
        Arc::new(BreakerRegistry::new(
            BreakerSettings::default(),
            BTreeMap::new(),
            clock,
        ))
    }

    #[tokio::test]
    async fn test_override_propagates_between_processes() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let shared = Arc::new(MemoryRegistry::new());
        let key = DependencyKey::new("primary-api");

        // Two processes share the registry but have their own breakers
        let operator = OverrideWatcher::new(shared.clone(), breakers(clock.clone()), clock.clone());
        let remote_breakers = breakers(clock.clone());
        let remote = OverrideWatcher::new(shared.clone(), remote_breakers.clone(), clock);

        operator.trip(&key, Some("incident".to_string())).await.unwrap();
        assert_eq!(remote_breakers.state(&key).await, CircuitState::Closed);

        let sync = remote.sync_once().await.unwrap();
        assert_eq!(sync.forced, vec![key.clone()]);
        assert_eq!(remote_breakers.state(&key).await, CircuitState::Open);
        assert!(!remote_breakers.get(&key).allow_request().await);

        // Nothing changes without a reset, no matter how long it stays tripped
        assert_eq!(remote.sync_once().await.unwrap(), OverrideSync::default());

        assert!(operator.reset(&key).await.unwrap());
        let sync = remote.sync_once().await.unwrap();
        assert_eq!(sync.cleared, vec![key.clone()]);
        assert_eq!(remote_breakers.state(&key).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_without_override() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let watcher = OverrideWatcher::new(
            Arc::new(MemoryRegistry::new()),
            breakers(clock.clone()),
            clock,
        );
        assert!(!watcher.reset(&DependencyKey::new("search")).await.unwrap());
    }
}
