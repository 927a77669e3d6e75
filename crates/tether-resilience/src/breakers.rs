//! Shared breaker registry
//!
//! Hands out exactly one [`CircuitBreaker`] per dependency. Every worker and
//! every helper receives the same `Arc`, so failure memory is never reset by
//! constructing a fresh breaker. With a [`BreakerStore`] attached, the breakers
//! of every process are handles to the same persisted rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tether_core::{
    BreakerSettings, BreakerStore, CircuitState, Clock, DependencyKey, TetherConfig,
};
use tracing::{debug, warn};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};

pub struct BreakerRegistry {
    breakers: RwLock<HashMap<DependencyKey, Arc<CircuitBreaker>>>,
    defaults: BreakerSettings,
    per_dependency: BTreeMap<String, BreakerSettings>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn BreakerStore>>,
}

impl BreakerRegistry {
    pub fn new(
        defaults: BreakerSettings,
        per_dependency: BTreeMap<String, BreakerSettings>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
            per_dependency,
            clock,
            store: None,
        }
    }

    /// Share breaker state through `store` (the durable registry)
    pub fn with_store(mut self, store: Arc<dyn BreakerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build from the `[breaker_defaults]` and `[dependencies]` sections
    pub fn from_config(config: &TetherConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.breaker_defaults, config.dependencies.clone(), clock)
    }

    fn settings_for(&self, key: &DependencyKey) -> BreakerSettings {
        self.per_dependency
            .get(key.as_str())
            .copied()
            .unwrap_or(self.defaults)
    }

    /// The breaker for `key`, created on first use
    pub fn get(&self, key: &DependencyKey) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = breakers.get(key) {
                return Arc::clone(existing);
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(key.clone()).or_insert_with(|| {
            debug!(dependency = %key, "creating circuit breaker");
            let breaker =
                CircuitBreaker::new(key.clone(), self.settings_for(key), Arc::clone(&self.clock));
            Arc::new(match &self.store {
                Some(store) => breaker.with_store(Arc::clone(store)),
                None => breaker,
            })
        });
        Arc::clone(breaker)
    }

    /// Current state for `key` (CLOSED for a dependency never called)
    pub async fn state(&self, key: &DependencyKey) -> CircuitState {
        self.get(key).state().await
    }

    /// Operator emergency stop for one dependency
    pub fn force_open(&self, key: &DependencyKey) {
        self.get(key).force_open();
    }

    pub fn clear_override(&self, key: &DependencyKey) {
        self.get(key).clear_override();
    }

    /// Dependencies currently under an operator override
    pub fn forced_keys(&self) -> Vec<DependencyKey> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = breakers
            .iter()
            .filter(|(_, b)| b.is_forced_open())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Snapshots of every breaker this process created or the store knows
    /// about, sorted by dependency
    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        if let Some(store) = &self.store {
            match store.list_breakers().await {
                Ok(rows) => {
                    for (key, _) in rows {
                        self.get(&key);
                    }
                }
                Err(e) => warn!(error = %e, "could not list shared breakers"),
            }
        }

        let handles: Vec<Arc<CircuitBreaker>> = {
            let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            breakers.values().cloned().collect()
        };
        let mut snaps = Vec::with_capacity(handles.len());
        for breaker in handles {
            snaps.push(breaker.snapshot().await);
        }
        snaps.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ManualClock;
    use tether_registry::MemoryRegistry;

    fn registry() -> BreakerRegistry {
        let mut per = BTreeMap::new();
        per.insert(
            "primary-api".to_string(),
            BreakerSettings {
                failure_threshold: 2,
                cooldown_secs: 30,
            },
        );
        BreakerRegistry::new(
            BreakerSettings::default(),
            per,
            Arc::new(ManualClock::default()),
        )
    }

    #[tokio::test]
    async fn test_same_breaker_is_shared() {
        let reg = registry();
        let key = DependencyKey::new("primary-api");

        let a = reg.get(&key);
        let b = reg.get(&key);
        assert!(Arc::ptr_eq(&a, &b));

        // Failures recorded through one handle are visible through the other
        a.record_failure().await;
        a.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Open);
        assert_eq!(reg.state(&key).await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_per_dependency_settings() {
        let reg = registry();
        let primary = reg.get(&DependencyKey::new("primary-api")).snapshot().await;
        let other = reg.get(&DependencyKey::new("search")).snapshot().await;

        assert_eq!(primary.failure_threshold, 2);
        assert_eq!(other.failure_threshold, BreakerSettings::default().failure_threshold);
    }

    #[tokio::test]
    async fn test_override_tracking() {
        let reg = registry();
        let key = DependencyKey::new("primary-api");
        reg.force_open(&key);
        assert_eq!(reg.forced_keys(), vec![key.clone()]);
        assert_eq!(reg.state(&key).await, CircuitState::Open);

        reg.clear_override(&key);
        assert!(reg.forced_keys().is_empty());
        assert_eq!(reg.state(&key).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_get_yields_one_instance() {
        let reg = registry();
        let key = DependencyKey::new("search");
        let handles: Vec<Arc<CircuitBreaker>> = std::thread::scope(|s| {
            let joins: Vec<_> = (0..8).map(|_| s.spawn(|| reg.get(&key))).collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });
        for h in &handles {
            assert!(Arc::ptr_eq(h, &handles[0]));
        }
        assert_eq!(reg.snapshots().await.len(), 1);
    }

    #[tokio::test]
    async fn test_registries_sharing_a_store_agree() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryRegistry::new());
        let a = BreakerRegistry::new(BreakerSettings::default(), BTreeMap::new(), clock.clone())
            .with_store(store.clone());
        let b = BreakerRegistry::new(BreakerSettings::default(), BTreeMap::new(), clock)
            .with_store(store);
        let key = DependencyKey::new("primary-api");

        for _ in 0..BreakerSettings::default().failure_threshold {
            a.get(&key).record_failure().await;
        }
        assert_eq!(b.state(&key).await, CircuitState::Open);

        // b never touched "search", but sees it once a records against it
        a.get(&DependencyKey::new("search")).record_failure().await;
        let snaps = b.snapshots().await;
        let keys: Vec<_> = snaps.iter().map(|s| s.dependency.as_str()).collect();
        assert_eq!(keys, vec!["primary-api", "search"]);
        assert_eq!(snaps[0].state, CircuitState::Open);
        assert_eq!(snaps[1].consecutive_failures, 1);
    }
}
