//! In-process registry
//!
//! Same contract as the durable registry, held behind one write lock so the
//! ceiling check and insert are atomic within the process. Used by tests and
//! single-process embeddings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tether_core::{
    BreakerRecord, BreakerStore, DependencyKey, DependencyOverride, NewWorker, Result,
    SpawnCeilings, WorkerId, WorkerRecord, WorkerState,
};
use tokio::sync::RwLock;

use crate::WorkerRegistry;

#[derive(Default)]
pub struct MemoryRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerRecord>>,
    overrides: RwLock<BTreeMap<DependencyKey, DependencyOverride>>,
    breakers: RwLock<BTreeMap<DependencyKey, BreakerRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first(mut workers: Vec<WorkerRecord>) -> Vec<WorkerRecord> {
    workers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    workers
}

#[async_trait]
impl WorkerRegistry for MemoryRegistry {
    async fn insert_if_under_ceiling(
        &self,
        worker: NewWorker,
        ceilings: SpawnCeilings,
    ) -> Result<Option<WorkerRecord>> {
        let mut workers = self.workers.write().await;

        let role_active = workers
            .values()
            .filter(|w| w.state.is_active() && w.role == worker.role)
            .count();
        let tree_active = workers
            .values()
            .filter(|w| w.state.is_active() && w.root_id == worker.root_id)
            .count();

        if role_active >= ceilings.role as usize
            || tree_active >= ceilings.tree as usize
            || workers.contains_key(&worker.id)
        {
            return Ok(None);
        }

        let record = worker.into_record();
        workers.insert(record.id.clone(), record.clone());
        Ok(Some(record))
    }

    async fn get(&self, id: &WorkerId) -> Result<Option<WorkerRecord>> {
        Ok(self.workers.read().await.get(id).cloned())
    }

    async fn update_heartbeat(&self, id: &WorkerId, at: DateTime<Utc>) -> Result<bool> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(id) {
            Some(w) if w.state.is_active() => {
                w.last_heartbeat_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_active(&self, role: &str) -> Result<u32> {
        let workers = self.workers.read().await;
        Ok(workers
            .values()
            .filter(|w| w.state.is_active() && w.role == role)
            .count() as u32)
    }

    async fn count_active_in_tree(&self, root: &WorkerId) -> Result<u32> {
        let workers = self.workers.read().await;
        Ok(workers
            .values()
            .filter(|w| w.state.is_active() && &w.root_id == root)
            .count() as u32)
    }

    async fn mark_terminated(&self, id: &WorkerId) -> Result<bool> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(id) {
            Some(w) if w.state.is_active() => {
                w.state = WorkerState::Terminated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_degraded(&self, id: &WorkerId) -> Result<bool> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(id) {
            Some(w) if w.state.is_active() => {
                w.state = WorkerState::Degraded;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn select_stale_active(
        &self,
        created_before: DateTime<Utc>,
        role: Option<&str>,
    ) -> Result<Vec<WorkerRecord>> {
        let workers = self.workers.read().await;
        let stale = workers
            .values()
            .filter(|w| w.state.is_active() && w.created_at < created_before)
            .filter(|w| role.map_or(true, |r| w.role == r))
            .cloned()
            .collect();
        Ok(oldest_first(stale))
    }

    async fn list(&self, state: Option<WorkerState>) -> Result<Vec<WorkerRecord>> {
        let workers = self.workers.read().await;
        let matching = workers
            .values()
            .filter(|w| state.map_or(true, |s| w.state == s))
            .cloned()
            .collect();
        Ok(oldest_first(matching))
    }

    async fn set_override(&self, entry: &DependencyOverride) -> Result<()> {
        self.overrides
            .write()
            .await
            .insert(entry.dependency.clone(), entry.clone());
        Ok(())
    }

    async fn clear_override(&self, dependency: &DependencyKey) -> Result<bool> {
        Ok(self.overrides.write().await.remove(dependency).is_some())
    }

    async fn list_overrides(&self) -> Result<Vec<DependencyOverride>> {
        Ok(self.overrides.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl BreakerStore for MemoryRegistry {
    async fn load_breaker(&self, dependency: &DependencyKey) -> Result<BreakerRecord> {
        Ok(self
            .breakers
            .read()
            .await
            .get(dependency)
            .copied()
            .unwrap_or_default())
    }

    async fn swap_breaker(
        &self,
        dependency: &DependencyKey,
        expected: &BreakerRecord,
        next: &BreakerRecord,
    ) -> Result<bool> {
        let mut breakers = self.breakers.write().await;
        let current = breakers.entry(dependency.clone()).or_default();
        if *current != *expected {
            return Ok(false);
        }
        *current = *next;
        Ok(true)
    }

    async fn list_breakers(&self) -> Result<Vec<(DependencyKey, BreakerRecord)>> {
        Ok(self
            .breakers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn root(role: &str, created_at: DateTime<Utc>) -> NewWorker {
        let id = WorkerId::generate();
        NewWorker {
            id: id.clone(),
            role: role.to_string(),
            parent_id: None,
            root_id: id,
            depth: 0,
            dependency: DependencyKey::new("primary-api"),
            created_at,
        }
    }

    const WIDE: SpawnCeilings = SpawnCeilings { role: 10, tree: 10 };

    #[tokio::test]
    async fn test_ceiling_refuses_then_frees_on_terminate() {
        let reg = MemoryRegistry::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let rec = reg
                .insert_if_under_ceiling(root("helper", now), SpawnCeilings { role: 3, tree: 10 })
                .await
                .unwrap()
                .unwrap();
            ids.push(rec.id);
        }

        let refused = reg
            .insert_if_under_ceiling(root("helper", now), SpawnCeilings { role: 3, tree: 10 })
            .await
            .unwrap();
        assert!(refused.is_none());

        assert!(reg.mark_terminated(&ids[0]).await.unwrap());
        assert!(!reg.mark_terminated(&ids[0]).await.unwrap());
        assert_eq!(reg.count_active("helper").await.unwrap(), 2);

        let granted = reg
            .insert_if_under_ceiling(root("helper", now), SpawnCeilings { role: 3, tree: 10 })
            .await
            .unwrap();
        assert!(granted.is_some());
    }

    #[tokio::test]
    async fn test_tree_ceiling_counts_descendants() {
        let reg = MemoryRegistry::new();
        let now = Utc::now();
        let parent = reg
            .insert_if_under_ceiling(root("worker", now), WIDE)
            .await
            .unwrap()
            .unwrap();

        let child = |depth| NewWorker {
            id: WorkerId::generate(),
            role: "helper".to_string(),
            parent_id: Some(parent.id.clone()),
            root_id: parent.id.clone(),
            depth,
            dependency: DependencyKey::new("primary-api"),
            created_at: now,
        };
        let tree_of_two = SpawnCeilings { role: 10, tree: 2 };

        assert!(reg.insert_if_under_ceiling(child(1), tree_of_two).await.unwrap().is_some());
        assert!(reg.insert_if_under_ceiling(child(2), tree_of_two).await.unwrap().is_none());
        assert_eq!(reg.count_active_in_tree(&parent.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_selection_ignores_heartbeats() {
        let reg = MemoryRegistry::new();
        let start = Utc::now();
        let old = reg
            .insert_if_under_ceiling(root("worker", start), WIDE)
            .await
            .unwrap()
            .unwrap();
        let fresh = reg
            .insert_if_under_ceiling(root("worker", start + ChronoDuration::minutes(50)), WIDE)
            .await
            .unwrap()
            .unwrap();

        assert!(reg
            .update_heartbeat(&old.id, start + ChronoDuration::minutes(59))
            .await
            .unwrap());

        let stale = reg
            .select_stale_active(start + ChronoDuration::minutes(30), None)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
        assert_ne!(stale[0].id, fresh.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_inserts_never_exceed_ceiling() {
        let reg = Arc::new(MemoryRegistry::new());
        let now = Utc::now();
        let ceilings = SpawnCeilings { role: 5, tree: 100 };

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let reg = Arc::clone(&reg);
                tokio::spawn(async move {
                    reg.insert_if_under_ceiling(root("helper", now), ceilings)
                        .await
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        assert_eq!(reg.count_active("helper").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_overrides_roundtrip() {
        let reg = MemoryRegistry::new();
        let key = DependencyKey::new("primary-api");
        reg.set_override(&DependencyOverride {
            dependency: key.clone(),
            reason: Some("incident".to_string()),
            set_at: Utc::now(),
        })
        .await
        .unwrap();

        assert_eq!(reg.list_overrides().await.unwrap().len(), 1);
        assert!(reg.clear_override(&key).await.unwrap());
        assert!(!reg.clear_override(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_breaker_swap_requires_matching_row() {
        let reg = MemoryRegistry::new();
        let key = DependencyKey::new("primary-api");
        assert_eq!(reg.load_breaker(&key).await.unwrap(), BreakerRecord::CLOSED);

        let one = BreakerRecord {
            consecutive_failures: 1,
            ..BreakerRecord::CLOSED
        };
        assert!(reg.swap_breaker(&key, &BreakerRecord::CLOSED, &one).await.unwrap());
        // A writer holding the stale CLOSED row loses
        assert!(!reg.swap_breaker(&key, &BreakerRecord::CLOSED, &one).await.unwrap());
        assert_eq!(reg.load_breaker(&key).await.unwrap(), one);
        assert_eq!(reg.list_breakers().await.unwrap(), vec![(key, one)]);
    }
}
