//! Orchestration policy state machine
//!
//! Pure functions only: no async, no I/O, no clock. The worker runner feeds
//! events in and performs the returned actions.
//!
//! Key rules:
//! - Non-retryable kinds (DEPENDENCY_UNAVAILABLE, AUTH, FATAL) degrade at once
//! - A breaker that is not CLOSED degrades at once
//! - Local budget left: retry locally
//! - Local budget spent on a long-running task: ask for a helper
//! - Invalid transitions go to `Failed` (never panic)
//!
//! Asking for a helper requires a [`SpawnTicket`], which can only be minted
//! from a [`RetryableKind`]. `ErrorKind::DependencyUnavailable` has no
//! `RetryableKind`, so no path from it can produce `RequestSpawn`.

use std::time::Duration;
use tether_core::{
    CircuitState, Classification, ErrorKind, PolicySettings, RetryableKind, WorkerId,
};

/// Proof that a spawn request came from a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnTicket {
    kind: RetryableKind,
}

impl SpawnTicket {
    fn issue(kind: RetryableKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> RetryableKind {
        self.kind
    }
}

/// Budget knobs the policy reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyLimits {
    /// Retry engine rounds per task before local budget is exhausted
    pub local_rounds: u32,
    /// Minimum task duration before a helper may be requested
    pub spawn_after: Duration,
}

impl From<&PolicySettings> for PolicyLimits {
    fn from(settings: &PolicySettings) -> Self {
        Self {
            local_rounds: settings.local_rounds.max(1),
            spawn_after: settings.spawn_after(),
        }
    }
}

/// What the runner knows about a failed round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    pub classification: Classification,
    /// Breaker state for the task's dependency after the round
    pub breaker: CircuitState,
    /// Time since the task started
    pub elapsed: Duration,
    /// 1-based round that just failed
    pub round: u32,
}

/// Why a task ended degraded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeReason {
    DependencyUnavailable,
    NotRetryable(ErrorKind),
    BreakerNotClosed(CircuitState),
    SpawnRefused(String),
    HelperFailed(String),
}

impl std::fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DependencyUnavailable => write!(f, "dependency unavailable"),
            Self::NotRetryable(kind) => write!(f, "non-retryable failure ({})", kind),
            Self::BreakerNotClosed(state) => write!(f, "circuit {}", state),
            Self::SpawnRefused(why) => write!(f, "helper refused: {}", why),
            Self::HelperFailed(why) => write!(f, "helper failed: {}", why),
        }
    }
}

/// Outcome of consulting the policy after a failed round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    RetryLocal,
    SpawnHelper(SpawnTicket),
    Degrade(DegradeReason),
    /// Budget spent on a task too young to warrant a helper
    Fail,
}

/// The classification step: pure, stateless, total
pub fn decide(report: &FailureReport, limits: &PolicyLimits) -> Decision {
    let kind = report.classification.kind;
    let retryable = match kind.as_retryable() {
        Some(retryable) if report.classification.retryable => retryable,
        _ => {
            return Decision::Degrade(match kind {
                ErrorKind::DependencyUnavailable => DegradeReason::DependencyUnavailable,
                other => DegradeReason::NotRetryable(other),
            })
        }
    };

    if report.breaker != CircuitState::Closed {
        return Decision::Degrade(DegradeReason::BreakerNotClosed(report.breaker));
    }

    if report.round < limits.local_rounds {
        Decision::RetryLocal
    } else if report.elapsed >= limits.spawn_after {
        Decision::SpawnHelper(SpawnTicket::issue(retryable))
    } else {
        Decision::Fail
    }
}

/// Per-task state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running { round: u32 },
    RetryingLocal { round: u32 },
    AwaitingSpawn,
    HelperRunning { helper: WorkerId },
    Degrading { reason: DegradeReason },
    Completed,
    DegradedComplete { reason: DegradeReason },
    Failed { error: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::DegradedComplete { .. } | Self::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RoundSucceeded,
    RoundFailed(FailureReport),
    SpawnGranted { helper: WorkerId },
    SpawnRefused { reason: String },
    HelperFinished { succeeded: bool, detail: String },
    DegradeRecorded,
    DegradeFailed { error: String },
    /// The worker's registry record is no longer active (pruned)
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RunRound { round: u32 },
    RequestSpawn { ticket: SpawnTicket },
    RunHelper { helper: WorkerId },
    WriteDegrade { reason: DegradeReason },
}

/// Initial state and actions for a new task
pub fn start() -> (TaskState, Vec<Action>) {
    (
        TaskState::Running { round: 1 },
        vec![Action::RunRound { round: 1 }],
    )
}

fn degrade(reason: DegradeReason) -> (TaskState, Vec<Action>) {
    (
        TaskState::Degrading {
            reason: reason.clone(),
        },
        vec![Action::WriteDegrade { reason }],
    )
}

/// Pure state transition function
///
/// This function never panics; invalid transitions land in `Failed`.
pub fn transition(state: TaskState, event: Event, limits: &PolicyLimits) -> (TaskState, Vec<Action>) {
    match (state, event) {
        // A pruned worker stops wherever it is
        (state, Event::Terminated) if !state.is_terminal() => (
            TaskState::Failed {
                error: "worker record no longer active (pruned)".to_string(),
            },
            vec![],
        ),

        (TaskState::Running { .. } | TaskState::RetryingLocal { .. }, Event::RoundSucceeded) => {
            (TaskState::Completed, vec![])
        }

        (TaskState::Running { .. } | TaskState::RetryingLocal { .. }, Event::RoundFailed(report)) => {
            match decide(&report, limits) {
                Decision::RetryLocal => {
                    let round = report.round + 1;
                    (
                        TaskState::RetryingLocal { round },
                        vec![Action::RunRound { round }],
                    )
                }
                Decision::SpawnHelper(ticket) => (
                    TaskState::AwaitingSpawn,
                    vec![Action::RequestSpawn { ticket }],
                ),
                Decision::Degrade(reason) => degrade(reason),
                Decision::Fail => (
                    TaskState::Failed {
                        error: format!(
                            "{} after {} round(s); local budget exhausted",
                            report.classification.kind, report.round
                        ),
                    },
                    vec![],
                ),
            }
        }

        (TaskState::AwaitingSpawn, Event::SpawnGranted { helper }) => (
            TaskState::HelperRunning {
                helper: helper.clone(),
            },
            vec![Action::RunHelper { helper }],
        ),

        (TaskState::AwaitingSpawn, Event::SpawnRefused { reason }) => {
            degrade(DegradeReason::SpawnRefused(reason))
        }

        (TaskState::HelperRunning { .. }, Event::HelperFinished { succeeded: true, .. }) => {
            (TaskState::Completed, vec![])
        }

        (TaskState::HelperRunning { .. }, Event::HelperFinished { succeeded: false, detail }) => {
            degrade(DegradeReason::HelperFailed(detail))
        }

        (TaskState::Degrading { reason }, Event::DegradeRecorded) => {
            (TaskState::DegradedComplete { reason }, vec![])
        }

        // Degrade sink failures are fatal to the task
        (TaskState::Degrading { reason }, Event::DegradeFailed { error }) => (
            TaskState::Failed {
                error: format!("degrade write failed ({}): {}", reason, error),
            },
            vec![],
        ),

        (state, event) => (
            TaskState::Failed {
                error: format!(
                    "Invalid state transition: {:?} cannot handle event {:?}",
                    state, event
                ),
            },
            vec![],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: PolicyLimits = PolicyLimits {
        local_rounds: 2,
        spawn_after: Duration::from_secs(120),
    };

    fn classified(kind: ErrorKind) -> Classification {
        Classification {
            kind,
            retryable: kind.as_retryable().is_some(),
            suggested_delay: None,
        }
    }

    fn report(kind: ErrorKind, breaker: CircuitState, elapsed_secs: u64, round: u32) -> FailureReport {
        FailureReport {
            classification: classified(kind),
            breaker,
            elapsed: Duration::from_secs(elapsed_secs),
            round,
        }
    }

    fn requests_spawn(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::RequestSpawn { .. }))
    }

    const ALL_KINDS: [ErrorKind; 6] = [
        ErrorKind::Transient,
        ErrorKind::Timeout,
        ErrorKind::RateLimited,
        ErrorKind::Auth,
        ErrorKind::DependencyUnavailable,
        ErrorKind::Fatal,
    ];

    const ALL_STATES: [CircuitState; 3] =
        [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen];

    #[test]
    fn test_dependency_unavailable_degrades() {
        let (state, actions) = transition(
            TaskState::Running { round: 1 },
            Event::RoundFailed(report(
                ErrorKind::DependencyUnavailable,
                CircuitState::Open,
                600,
                5,
            )),
            &LIMITS,
        );
        assert_eq!(
            state,
            TaskState::Degrading {
                reason: DegradeReason::DependencyUnavailable
            }
        );
        assert_eq!(
            actions,
            vec![Action::WriteDegrade {
                reason: DegradeReason::DependencyUnavailable
            }]
        );
    }

    #[test]
    fn test_no_spawn_when_breaker_open() {
        // Exhaustive over kinds, rounds and durations: an OPEN breaker never
        // yields RequestSpawn
        for kind in ALL_KINDS {
            for round in 1..=4 {
                for elapsed in [0, 119, 120, 3600] {
                    for from in [
                        TaskState::Running { round },
                        TaskState::RetryingLocal { round },
                    ] {
                        let (_, actions) = transition(
                            from,
                            Event::RoundFailed(report(kind, CircuitState::Open, elapsed, round)),
                            &LIMITS,
                        );
                        assert!(!requests_spawn(&actions), "{:?} round {}", kind, round);
                    }
                }
            }
        }
    }

    #[test]
    fn test_dependency_unavailable_never_spawns() {
        for breaker in ALL_STATES {
            for round in 1..=4 {
                let decision = decide(
                    &report(ErrorKind::DependencyUnavailable, breaker, 3600, round),
                    &LIMITS,
                );
                assert_eq!(decision, Decision::Degrade(DegradeReason::DependencyUnavailable));
            }
        }
    }

    #[test]
    fn test_auth_and_fatal_degrade_immediately() {
        for kind in [ErrorKind::Auth, ErrorKind::Fatal] {
            let decision = decide(&report(kind, CircuitState::Closed, 0, 1), &LIMITS);
            assert_eq!(decision, Decision::Degrade(DegradeReason::NotRetryable(kind)));
        }
    }

    #[test]
    fn test_retry_local_while_budget_remains() {
        let (state, actions) = transition(
            TaskState::Running { round: 1 },
            Event::RoundFailed(report(ErrorKind::Transient, CircuitState::Closed, 5, 1)),
            &LIMITS,
        );
        assert_eq!(state, TaskState::RetryingLocal { round: 2 });
        assert_eq!(actions, vec![Action::RunRound { round: 2 }]);
    }

    #[test]
    fn test_spawn_after_budget_on_long_task() {
        let (state, actions) = transition(
            TaskState::RetryingLocal { round: 2 },
            Event::RoundFailed(report(ErrorKind::Timeout, CircuitState::Closed, 180, 2)),
            &LIMITS,
        );
        assert_eq!(state, TaskState::AwaitingSpawn);
        match actions.as_slice() {
            [Action::RequestSpawn { ticket }] => assert_eq!(ticket.kind(), RetryableKind::Timeout),
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn test_budget_spent_on_young_task_fails() {
        let (state, actions) = transition(
            TaskState::RetryingLocal { round: 2 },
            Event::RoundFailed(report(ErrorKind::Transient, CircuitState::Closed, 30, 2)),
            &LIMITS,
        );
        assert!(matches!(state, TaskState::Failed { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_half_open_degrades_instead_of_spawning() {
        let decision = decide(
            &report(ErrorKind::Transient, CircuitState::HalfOpen, 600, 2),
            &LIMITS,
        );
        assert_eq!(
            decision,
            Decision::Degrade(DegradeReason::BreakerNotClosed(CircuitState::HalfOpen))
        );
    }

    #[test]
    fn test_spawn_refused_falls_back_to_degrade() {
        let (state, actions) = transition(
            TaskState::AwaitingSpawn,
            Event::SpawnRefused {
                reason: "ceiling reached".to_string(),
            },
            &LIMITS,
        );
        let reason = DegradeReason::SpawnRefused("ceiling reached".to_string());
        assert_eq!(state, TaskState::Degrading { reason: reason.clone() });
        assert_eq!(actions, vec![Action::WriteDegrade { reason }]);
    }

    #[test]
    fn test_helper_flow() {
        let helper = WorkerId::from_raw("w-helper");
        let (state, actions) = transition(
            TaskState::AwaitingSpawn,
            Event::SpawnGranted {
                helper: helper.clone(),
            },
            &LIMITS,
        );
        assert_eq!(state, TaskState::HelperRunning { helper: helper.clone() });
        assert_eq!(actions, vec![Action::RunHelper { helper }]);

        let (done, _) = transition(
            state.clone(),
            Event::HelperFinished {
                succeeded: true,
                detail: String::new(),
            },
            &LIMITS,
        );
        assert_eq!(done, TaskState::Completed);

        let (degrading, actions) = transition(
            state,
            Event::HelperFinished {
                succeeded: false,
                detail: "timeout".to_string(),
            },
            &LIMITS,
        );
        assert!(matches!(degrading, TaskState::Degrading { .. }));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_degrade_write_outcomes() {
        let degrading = TaskState::Degrading {
            reason: DegradeReason::DependencyUnavailable,
        };
        let (state, _) = transition(degrading.clone(), Event::DegradeRecorded, &LIMITS);
        assert_eq!(
            state,
            TaskState::DegradedComplete {
                reason: DegradeReason::DependencyUnavailable
            }
        );

        let (state, _) = transition(
            degrading,
            Event::DegradeFailed {
                error: "disk full".to_string(),
            },
            &LIMITS,
        );
        assert!(matches!(state, TaskState::Failed { .. }));
    }

    #[test]
    fn test_pruned_worker_fails_from_any_active_state() {
        for state in [
            TaskState::Running { round: 1 },
            TaskState::RetryingLocal { round: 2 },
            TaskState::AwaitingSpawn,
        ] {
            let (next, actions) = transition(state, Event::Terminated, &LIMITS);
            assert!(matches!(next, TaskState::Failed { .. }));
            assert!(actions.is_empty());
        }
    }

    #[test]
    fn test_invalid_transition_never_panics() {
        let (state, _) = transition(TaskState::Completed, Event::RoundSucceeded, &LIMITS);
        assert!(matches!(state, TaskState::Failed { .. }));

        let (state, _) = transition(TaskState::AwaitingSpawn, Event::DegradeRecorded, &LIMITS);
        assert!(matches!(state, TaskState::Failed { .. }));
    }

    #[test]
    fn test_start() {
        let (state, actions) = start();
        assert_eq!(state, TaskState::Running { round: 1 });
        assert_eq!(actions, vec![Action::RunRound { round: 1 }]);
    }
}
