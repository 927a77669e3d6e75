//! Core type definitions for tether

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identifies one external dependency (e.g. "primary-api")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyKey(String);

impl DependencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DependencyKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DependencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Worker identifier (`w-` followed by a v4 UUID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Generate a fresh worker id
    pub fn generate() -> Self {
        Self(format!("w-{}", Uuid::new_v4()))
    }

    /// Wrap an existing id (e.g. one read back from the registry)
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(10);
        &self.0[..end]
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - reject requests immediately
    Open,
    /// Cooldown elapsed - exactly one probe admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" | "half-open" => Ok(Self::HalfOpen),
            _ => Err(format!("Invalid circuit state: {}", s)),
        }
    }
}

/// Persisted breaker state for one dependency
///
/// This is the row every worker process compares-and-swaps; the in-process
/// breaker is only a handle to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Millis since the epoch: `opened_at` while OPEN, probe start while HALF_OPEN
    pub stamp_ms: u64,
}

impl BreakerRecord {
    /// A dependency nobody has recorded anything against
    pub const CLOSED: BreakerRecord = BreakerRecord {
        state: CircuitState::Closed,
        consecutive_failures: 0,
        stamp_ms: 0,
    };
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self::CLOSED
    }
}

/// Lifecycle state of a registered worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Active,
    Degraded,
    Terminated,
}

impl WorkerState {
    /// Only ACTIVE workers occupy a ceiling slot
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "degraded" => Ok(Self::Degraded),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Invalid worker state: {}", s)),
        }
    }
}

/// A role name plus its configured ceiling and maximum worker age
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRole {
    pub name: String,
    /// Max concurrently ACTIVE workers of this role
    pub ceiling: u32,
    /// Age (from creation) after which an ACTIVE worker is pruned
    pub max_worker_age: Duration,
}

/// One row of the worker registry
///
/// `parent_id` links helpers to the worker that requested them; the links form
/// a forest. `root_id` and `depth` are derived from the parent at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub role: String,
    pub parent_id: Option<WorkerId>,
    pub root_id: WorkerId,
    pub depth: u32,
    pub dependency: DependencyKey,
    /// Immutable; the only input to age-based pruning
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub state: WorkerState,
}

impl WorkerRecord {
    /// Age of the worker measured from its creation time
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A worker about to be inserted by a granted spawn request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorker {
    pub id: WorkerId,
    pub role: String,
    pub parent_id: Option<WorkerId>,
    pub root_id: WorkerId,
    pub depth: u32,
    pub dependency: DependencyKey,
    pub created_at: DateTime<Utc>,
}

impl NewWorker {
    pub fn into_record(self) -> WorkerRecord {
        WorkerRecord {
            id: self.id,
            role: self.role,
            parent_id: self.parent_id,
            root_id: self.root_id,
            depth: self.depth,
            dependency: self.dependency,
            created_at: self.created_at,
            last_heartbeat_at: self.created_at,
            state: WorkerState::Active,
        }
    }
}

/// Ceilings checked atomically with the insert of a [`NewWorker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnCeilings {
    /// Max ACTIVE workers of the new worker's role
    pub role: u32,
    /// Max ACTIVE workers sharing the new worker's root
    pub tree: u32,
}

/// Operator emergency override on a dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyOverride {
    pub dependency: DependencyKey,
    pub reason: Option<String>,
    pub set_at: DateTime<Utc>,
}

/// Failure kinds produced by the error classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Timeout,
    RateLimited,
    Auth,
    DependencyUnavailable,
    Fatal,
}

/// The subset of [`ErrorKind`] that may ever be retried
///
/// `DependencyUnavailable` has no counterpart here, so anything that requires a
/// `RetryableKind` (local retry, spawn eligibility) cannot be reached from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableKind {
    Transient,
    Timeout,
    RateLimited,
}

impl ErrorKind {
    pub fn as_retryable(&self) -> Option<RetryableKind> {
        match self {
            Self::Transient => Some(RetryableKind::Transient),
            Self::Timeout => Some(RetryableKind::Timeout),
            Self::RateLimited => Some(RetryableKind::RateLimited),
            Self::Auth | Self::DependencyUnavailable | Self::Fatal => None,
        }
    }
}

impl From<RetryableKind> for ErrorKind {
    fn from(kind: RetryableKind) -> Self {
        match kind {
            RetryableKind::Transient => Self::Transient,
            RetryableKind::Timeout => Self::Timeout,
            RetryableKind::RateLimited => Self::RateLimited,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Auth => write!(f, "auth"),
            Self::DependencyUnavailable => write!(f, "dependency_unavailable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transient" => Ok(Self::Transient),
            "timeout" => Ok(Self::Timeout),
            "rate_limited" | "ratelimited" | "rate-limited" => Ok(Self::RateLimited),
            "auth" => Ok(Self::Auth),
            "dependency_unavailable" | "dependency-unavailable" => {
                Ok(Self::DependencyUnavailable)
            }
            "fatal" => Ok(Self::Fatal),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

/// Result of classifying one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// Hint from the failure itself (e.g. retry-after), not the backoff schedule
    pub suggested_delay: Option<Duration>,
}

/// A raw failure returned by an operation against an external dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The breaker refused the call; produced only by the retry engine
    CircuitOpen { dependency: DependencyKey },
    /// The attempt exceeded its timeout
    Timeout { after: Duration },
    /// The dependency asked us to slow down
    RateLimited { retry_after: Option<Duration> },
    /// The dependency answered with a non-success status
    Status { code: u16, message: String },
    /// Connection refused/reset/DNS and similar
    Connection(String),
    /// Credentials rejected
    Auth(String),
    /// Known-unrecoverable failure
    Fatal(String),
    /// Anything else; classified from its message
    Other(String),
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen { dependency } => write!(f, "circuit open for {}", dependency),
            Self::Timeout { after } => write!(f, "timed out after {}ms", after.as_millis()),
            Self::RateLimited { retry_after: Some(d) } => {
                write!(f, "rate limited (retry after {}ms)", d.as_millis())
            }
            Self::RateLimited { retry_after: None } => write!(f, "rate limited"),
            Self::Status { code, message } => write!(f, "status {}: {}", code, message),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Auth(msg) => write!(f, "auth error: {}", msg),
            Self::Fatal(msg) => write!(f, "fatal: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for OperationError {}
