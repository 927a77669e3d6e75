//! Spawn governor
//!
//! The authoritative gate for creating workers. A request is refused outright
//! (never queued) when:
//! - the role has no configured ceiling
//! - the breaker for the dependency the new worker would call is not CLOSED
//! - the parent is unknown, inactive, or already at the maximum depth
//! - the role ceiling or the spawn-tree ceiling is reached
//!
//! The last check happens inside the registry's conditional insert, so racing
//! requesters cannot overshoot a ceiling.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_core::{
    CircuitState, Clock, DependencyKey, GovernorSettings, NewWorker, Result, SpawnCeilings,
    TetherConfig, WorkerId, WorkerRecord, WorkerRole,
};
use tether_registry::WorkerRegistry;
use tether_resilience::BreakerRegistry;
use tracing::{debug, info, warn};

/// A request to create one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub role: String,
    pub parent_id: Option<WorkerId>,
    /// The dependency the new worker would call
    pub dependency: DependencyKey,
}

/// Why a spawn was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnRefusal {
    UnknownRole(String),
    CircuitOpen {
        dependency: DependencyKey,
        state: CircuitState,
    },
    ParentNotFound(WorkerId),
    ParentInactive(WorkerId),
    DepthExceeded { depth: u32, max_depth: u32 },
    CeilingReached { role: String, ceiling: u32 },
}

impl std::fmt::Display for SpawnRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRole(role) => write!(f, "unknown role '{}'", role),
            Self::CircuitOpen { dependency, state } => {
                write!(f, "circuit for {} is {}", dependency, state)
            }
            Self::ParentNotFound(id) => write!(f, "parent {} not found", id),
            Self::ParentInactive(id) => write!(f, "parent {} is not active", id),
            Self::DepthExceeded { depth, max_depth } => {
                write!(f, "depth {} exceeds max depth {}", depth, max_depth)
            }
            Self::CeilingReached { role, ceiling } => write!(
                f,
                "ceiling reached for role '{}' ({}) or its spawn tree",
                role, ceiling
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnDecision {
    Granted(WorkerRecord),
    Refused(SpawnRefusal),
}

impl SpawnDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn granted(self) -> Option<WorkerRecord> {
        match self {
            Self::Granted(record) => Some(record),
            Self::Refused(_) => None,
        }
    }
}

/// Anything workers can ask for a helper
#[async_trait]
pub trait SpawnGate: Send + Sync {
    async fn request_spawn(&self, request: SpawnRequest) -> Result<SpawnDecision>;
}

pub struct SpawnGovernor {
    registry: Arc<dyn WorkerRegistry>,
    breakers: Arc<BreakerRegistry>,
    roles: BTreeMap<String, WorkerRole>,
    settings: GovernorSettings,
    clock: Arc<dyn Clock>,
}

impl SpawnGovernor {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        breakers: Arc<BreakerRegistry>,
        roles: Vec<WorkerRole>,
        settings: GovernorSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            breakers,
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
            settings,
            clock,
        }
    }

    pub fn from_config(
        config: &TetherConfig,
        registry: Arc<dyn WorkerRegistry>,
        breakers: Arc<BreakerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            registry,
            breakers,
            config.worker_roles(),
            config.governor,
            clock,
        )
    }

    pub fn role(&self, name: &str) -> Option<&WorkerRole> {
        self.roles.get(name)
    }

    /// Grant or refuse one spawn
    pub async fn request_spawn(&self, request: SpawnRequest) -> Result<SpawnDecision> {
        let Some(role) = self.roles.get(&request.role) else {
            return Ok(self.refuse(SpawnRefusal::UnknownRole(request.role)));
        };

        let state = self.breakers.state(&request.dependency).await;
        if state != CircuitState::Closed {
            return Ok(self.refuse(SpawnRefusal::CircuitOpen {
                dependency: request.dependency,
                state,
            }));
        }

        let id = WorkerId::generate();
        let (root_id, depth) = match &request.parent_id {
            None => (id.clone(), 0),
            Some(parent_id) => match self.registry.get(parent_id).await? {
                None => return Ok(self.refuse(SpawnRefusal::ParentNotFound(parent_id.clone()))),
                Some(parent) if !parent.state.is_active() => {
                    return Ok(self.refuse(SpawnRefusal::ParentInactive(parent_id.clone())))
                }
                Some(parent) => (parent.root_id, parent.depth + 1),
            },
        };

        if depth > self.settings.max_depth {
            return Ok(self.refuse(SpawnRefusal::DepthExceeded {
                depth,
                max_depth: self.settings.max_depth,
            }));
        }

        let worker = NewWorker {
            id,
            role: role.name.clone(),
            parent_id: request.parent_id,
            root_id,
            depth,
            dependency: request.dependency,
            created_at: self.clock.now(),
        };
        let ceilings = SpawnCeilings {
            role: role.ceiling,
            tree: self.settings.max_tree_size,
        };

        match self.registry.insert_if_under_ceiling(worker, ceilings).await? {
            Some(record) => {
                info!(
                    worker = %record.id,
                    role = %record.role,
                    depth = record.depth,
                    "spawn granted"
                );
                Ok(SpawnDecision::Granted(record))
            }
            None => Ok(self.refuse(SpawnRefusal::CeilingReached {
                role: role.name.clone(),
                ceiling: role.ceiling,
            })),
        }
    }

    fn refuse(&self, refusal: SpawnRefusal) -> SpawnDecision {
        match &refusal {
            SpawnRefusal::CircuitOpen { .. } | SpawnRefusal::CeilingReached { .. } => {
                warn!("spawn refused: {}", refusal)
            }
            _ => debug!("spawn refused: {}", refusal),
        }
        SpawnDecision::Refused(refusal)
    }
}

#[async_trait]
impl SpawnGate for SpawnGovernor {
    async fn request_spawn(&self, request: SpawnRequest) -> Result<SpawnDecision> {
        SpawnGovernor::request_spawn(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::{BreakerSettings, ManualClock};
    use tether_registry::MemoryRegistry;

    struct Fixture {
        governor: Arc<SpawnGovernor>,
        registry: Arc<MemoryRegistry>,
        breakers: Arc<BreakerRegistry>,
    }

    fn fixture(helper_ceiling: u32, settings: GovernorSettings) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let registry = Arc::new(MemoryRegistry::new());
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerSettings {
                failure_threshold: 1,
                cooldown_secs: 60,
            },
            BTreeMap::new(),
            Arc::clone(&clock),
        ));
        let roles = vec![
            WorkerRole {
                name: "worker".to_string(),
                ceiling: 100,
                max_worker_age: Duration::from_secs(1800),
            },
            WorkerRole {
                name: "helper".to_string(),
                ceiling: helper_ceiling,
                max_worker_age: Duration::from_secs(900),
            },
        ];
        let governor = SpawnGovernor::new(
            registry.clone(),
            Arc::clone(&breakers),
            roles,
            settings,
            clock,
        );
        Fixture {
            governor: Arc::new(governor),
            registry,
            breakers,
        }
    }

    fn wide() -> GovernorSettings {
        GovernorSettings {
            max_depth: 3,
            max_tree_size: 100,
        }
    }

    fn request(role: &str, parent: Option<&WorkerId>) -> SpawnRequest {
        SpawnRequest {
            role: role.to_string(),
            parent_id: parent.cloned(),
            dependency: DependencyKey::new("primary-api"),
        }
    }

    #[tokio::test]
    async fn test_helper_ceiling_scenario() {
        let fx = fixture(10, wide());
        let mut granted = Vec::new();
        for _ in 0..10 {
            let decision = fx.governor.request_spawn(request("helper", None)).await.unwrap();
            granted.push(decision.granted().expect("below ceiling"));
        }

        let decision = fx.governor.request_spawn(request("helper", None)).await.unwrap();
        assert!(matches!(
            decision,
            SpawnDecision::Refused(SpawnRefusal::CeilingReached { ceiling: 10, .. })
        ));

        assert!(fx.registry.mark_terminated(&granted[0].id).await.unwrap());

        let decision = fx.governor.request_spawn(request("helper", None)).await.unwrap();
        assert!(decision.is_granted());
    }

    #[tokio::test]
    async fn test_refused_while_breaker_open() {
        let fx = fixture(10, wide());
        let key = DependencyKey::new("primary-api");
        fx.breakers.get(&key).record_failure().await;

        let decision = fx.governor.request_spawn(request("helper", None)).await.unwrap();
        assert_eq!(
            decision,
            SpawnDecision::Refused(SpawnRefusal::CircuitOpen {
                dependency: key,
                state: CircuitState::Open,
            })
        );
        assert_eq!(fx.registry.count_active("helper").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_while_forced_open() {
        let fx = fixture(10, wide());
        fx.breakers.force_open(&DependencyKey::new("primary-api"));

        let decision = fx.governor.request_spawn(request("worker", None)).await.unwrap();
        assert!(matches!(
            decision,
            SpawnDecision::Refused(SpawnRefusal::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_role_refused() {
        let fx = fixture(10, wide());
        let decision = fx.governor.request_spawn(request("janitor", None)).await.unwrap();
        assert_eq!(
            decision,
            SpawnDecision::Refused(SpawnRefusal::UnknownRole("janitor".to_string()))
        );
    }

    #[tokio::test]
    async fn test_depth_and_tree_limits() {
        let fx = fixture(
            10,
            GovernorSettings {
                max_depth: 1,
                max_tree_size: 3,
            },
        );
        let root = fx
            .governor
            .request_spawn(request("worker", None))
            .await
            .unwrap()
            .granted()
            .unwrap();
        let child = fx
            .governor
            .request_spawn(request("helper", Some(&root.id)))
            .await
            .unwrap()
            .granted()
            .unwrap();
        assert_eq!(child.root_id, root.id);
        assert_eq!(child.depth, 1);

        let grandchild = fx
            .governor
            .request_spawn(request("helper", Some(&child.id)))
            .await
            .unwrap();
        assert_eq!(
            grandchild,
            SpawnDecision::Refused(SpawnRefusal::DepthExceeded {
                depth: 2,
                max_depth: 1
            })
        );

        // Siblings count against the same tree
        assert!(fx
            .governor
            .request_spawn(request("helper", Some(&root.id)))
            .await
            .unwrap()
            .is_granted());
        assert!(matches!(
            fx.governor
                .request_spawn(request("helper", Some(&root.id)))
                .await
                .unwrap(),
            SpawnDecision::Refused(SpawnRefusal::CeilingReached { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_parent_refused() {
        let fx = fixture(10, wide());
        let ghost = WorkerId::from_raw("w-ghost");
        let decision = fx
            .governor
            .request_spawn(request("helper", Some(&ghost)))
            .await
            .unwrap();
        assert_eq!(decision, SpawnDecision::Refused(SpawnRefusal::ParentNotFound(ghost)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_requesters_never_exceed_ceiling() {
        let fx = fixture(10, wide());
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let governor = Arc::clone(&fx.governor);
                tokio::spawn(async move {
                    governor
                        .request_spawn(request("helper", None))
                        .await
                        .unwrap()
                        .is_granted()
                })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 10);
        assert!(fx.registry.count_active("helper").await.unwrap() <= 10);
    }
}
