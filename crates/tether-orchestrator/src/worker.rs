//! Worker task runner
//!
//! Drives one task through the policy state machine, performing each action
//! the machine asks for:
//! - `RunRound`: heartbeat, then one Retry Engine round against the shared breaker
//! - `RequestSpawn`: ask the spawn gate for a helper
//! - `RunHelper`: run the same operation as a child worker (same breaker `Arc`)
//! - `WriteDegrade`: append a degrade artifact to the local sink
//!
//! When the machine reaches a terminal state the worker's registry record is
//! closed out and degraded completions are fed to the alerter.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tether_core::fail_open::fail_open;
use tether_core::{Clock, DependencyKey, OperationError, Result, WorkerRecord};
use tether_registry::WorkerRegistry;
use tether_resilience::{RetryEngine, RetryPolicy};
use tracing::{debug, info, warn};

use crate::alerts::{DegradeAlerter, OperatorAlert};
use crate::degrade::{DegradeArtifact, DegradeSink};
use crate::governor::{SpawnDecision, SpawnGate, SpawnRefusal, SpawnRequest};
use crate::lifecycle::LifecycleManager;
use crate::policy::{
    self, Action, DegradeReason, Event, FailureReport, PolicyLimits, SpawnTicket, TaskState,
};

/// Capabilities shared by every worker in a process
pub struct WorkerContext {
    pub engine: RetryEngine,
    pub retry_policy: RetryPolicy,
    pub limits: PolicyLimits,
    pub helper_role: String,
    pub registry: Arc<dyn WorkerRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub spawner: Arc<dyn SpawnGate>,
    pub sink: Arc<dyn DegradeSink>,
    pub alerter: Arc<DegradeAlerter>,
    pub clock: Arc<dyn Clock>,
}

/// A unit of work, as far as this core cares
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub name: String,
    /// Partial progress recorded with a degrade
    pub checkpoint: Option<serde_json::Value>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checkpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Degraded {
        reason: DegradeReason,
        alert: Option<OperatorAlert>,
    },
    Failed {
        error: String,
    },
}

impl<T> TaskOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    fn describe(&self) -> String {
        match self {
            Self::Completed(_) => "completed".to_string(),
            Self::Degraded { reason, .. } => format!("degraded: {}", reason),
            Self::Failed { error } => format!("failed: {}", error),
        }
    }
}

type BoxedOutcome<'a, T> = Pin<Box<dyn Future<Output = Result<TaskOutcome<T>>> + Send + 'a>>;

/// One registered worker
pub struct Worker {
    ctx: Arc<WorkerContext>,
    record: WorkerRecord,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>, record: WorkerRecord) -> Self {
        Self { ctx, record }
    }

    /// Register a root worker through the spawn gate
    pub async fn start(
        ctx: Arc<WorkerContext>,
        role: &str,
        dependency: DependencyKey,
    ) -> Result<std::result::Result<Self, SpawnRefusal>> {
        let decision = ctx
            .spawner
            .request_spawn(SpawnRequest {
                role: role.to_string(),
                parent_id: None,
                dependency,
            })
            .await?;
        Ok(match decision {
            SpawnDecision::Granted(record) => Ok(Self::new(ctx, record)),
            SpawnDecision::Refused(refusal) => Err(refusal),
        })
    }

    pub fn record(&self) -> &WorkerRecord {
        &self.record
    }

    /// Run `task`, calling `operation` for every attempt
    pub fn run<'a, T, F, Fut>(&'a self, task: &'a Task, operation: &'a F) -> BoxedOutcome<'a, T>
    where
        T: Send + 'a,
        F: Fn() -> Fut + Sync + 'a,
        Fut: Future<Output = std::result::Result<T, OperationError>> + Send + 'a,
    {
        Box::pin(async move {
            let started = self.ctx.clock.now();
            let (mut state, actions) = policy::start();
            let mut queue: VecDeque<Action> = actions.into();
            let mut value: Option<T> = None;
            let mut helper: Option<WorkerRecord> = None;

            debug!(worker = %self.record.id, task = %task.name, "task started");

            while let Some(action) = queue.pop_front() {
                let event = match action {
                    Action::RunRound { round } => {
                        self.run_round(operation, round, started, &mut value).await
                    }
                    Action::RequestSpawn { ticket } => self.request_helper(ticket, &mut helper).await,
                    Action::RunHelper { helper: id } => match helper.take() {
                        Some(record) if record.id == id => {
                            let child = Worker::new(Arc::clone(&self.ctx), record);
                            match child.run(task, operation).await {
                                Ok(TaskOutcome::Completed(v)) => {
                                    value = Some(v);
                                    Event::HelperFinished {
                                        succeeded: true,
                                        detail: String::new(),
                                    }
                                }
                                Ok(other) => Event::HelperFinished {
                                    succeeded: false,
                                    detail: other.describe(),
                                },
                                Err(e) => Event::HelperFinished {
                                    succeeded: false,
                                    detail: e.to_string(),
                                },
                            }
                        }
                        _ => Event::HelperFinished {
                            succeeded: false,
                            detail: format!("no granted helper {}", id),
                        },
                    },
                    Action::WriteDegrade { reason } => self.write_degrade(task, &reason).await,
                };

                let (next, more) = policy::transition(state, event, &self.ctx.limits);
                state = next;
                queue.extend(more);
            }

            Ok(self.finish(state, value).await)
        })
    }

    async fn run_round<T, F, Fut>(
        &self,
        operation: &F,
        round: u32,
        started: chrono::DateTime<chrono::Utc>,
        value: &mut Option<T>,
    ) -> Event
    where
        F: Fn() -> Fut + Sync,
        Fut: Future<Output = std::result::Result<T, OperationError>> + Send,
    {
        // A registry outage must not stop work; the sweeper is the backstop
        let alive = fail_open("worker::heartbeat", || {
            self.ctx.lifecycle.heartbeat(&self.record.id)
        })
        .await
        .unwrap_or(true);
        if !alive {
            warn!(worker = %self.record.id, "worker record is no longer active, stopping");
            return Event::Terminated;
        }

        let dependency = &self.record.dependency;
        match self
            .ctx
            .engine
            .execute(dependency, &self.ctx.retry_policy, || operation())
            .await
        {
            Ok(v) => {
                *value = Some(v);
                Event::RoundSucceeded
            }
            Err(failure) => {
                debug!(worker = %self.record.id, round, "round failed: {}", failure);
                Event::RoundFailed(FailureReport {
                    classification: failure.classification,
                    breaker: self.ctx.engine.breakers().state(dependency).await,
                    elapsed: self.elapsed_since(started),
                    round,
                })
            }
        }
    }

    async fn request_helper(&self, ticket: SpawnTicket, helper: &mut Option<WorkerRecord>) -> Event {
        info!(
            worker = %self.record.id,
            kind = %tether_core::ErrorKind::from(ticket.kind()),
            "requesting helper"
        );
        let request = SpawnRequest {
            role: self.ctx.helper_role.clone(),
            parent_id: Some(self.record.id.clone()),
            dependency: self.record.dependency.clone(),
        };
        match self.ctx.spawner.request_spawn(request).await {
            Ok(SpawnDecision::Granted(record)) => {
                let id = record.id.clone();
                *helper = Some(record);
                Event::SpawnGranted { helper: id }
            }
            Ok(SpawnDecision::Refused(refusal)) => Event::SpawnRefused {
                reason: refusal.to_string(),
            },
            Err(e) => Event::SpawnRefused {
                reason: format!("governor error: {}", e),
            },
        }
    }

    async fn write_degrade(&self, task: &Task, reason: &DegradeReason) -> Event {
        let artifact = DegradeArtifact {
            worker_id: self.record.id.clone(),
            role: self.record.role.clone(),
            dependency: self.record.dependency.clone(),
            task: task.name.clone(),
            reason: reason.to_string(),
            checkpoint: task.checkpoint.clone(),
            recorded_at: self.ctx.clock.now(),
        };
        match self.ctx.sink.append(&artifact).await {
            Ok(()) => Event::DegradeRecorded,
            Err(e) => Event::DegradeFailed {
                error: e.to_string(),
            },
        }
    }

    async fn finish<T>(&self, state: TaskState, value: Option<T>) -> TaskOutcome<T> {
        let id = &self.record.id;
        match state {
            TaskState::Completed => {
                self.close_record(false).await;
                match value {
                    Some(v) => {
                        debug!(worker = %id, "task completed");
                        TaskOutcome::Completed(v)
                    }
                    None => TaskOutcome::Failed {
                        error: "completed without a result".to_string(),
                    },
                }
            }
            TaskState::DegradedComplete { reason } => {
                self.close_record(true).await;
                warn!(worker = %id, role = %self.record.role, "task degraded: {}", reason);
                let alert = self.ctx.alerter.record(&self.record.role).await;
                TaskOutcome::Degraded { reason, alert }
            }
            TaskState::Failed { error } => {
                self.close_record(false).await;
                warn!(worker = %id, "task failed: {}", error);
                TaskOutcome::Failed { error }
            }
            other => TaskOutcome::Failed {
                error: format!("task stopped in non-terminal state {:?}", other),
            },
        }
    }

    async fn close_record(&self, degraded: bool) {
        let registry = &self.ctx.registry;
        let id = &self.record.id;
        if degraded {
            fail_open("worker::mark_degraded", || registry.mark_degraded(id)).await;
        } else {
            fail_open("worker::mark_terminated", || registry.mark_terminated(id)).await;
        }
    }

    fn elapsed_since(&self, started: chrono::DateTime<chrono::Utc>) -> Duration {
        (self.ctx.clock.now() - started)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
