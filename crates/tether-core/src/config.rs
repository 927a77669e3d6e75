//! Configuration management for tether
//!
//! Process-wide settings loaded once at startup: breaker thresholds per
//! dependency, ceilings and maximum ages per role, the retry policy, and the
//! knobs of the governor, lifecycle sweeper, orchestration policy and alerting.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{DependencyKey, ErrorKind, WorkerRole};
use crate::{Result, TetherError};

/// Repository-level tether configuration
///
/// Loaded from `.tether/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetherConfig {
    /// Where the registry and degrade artifacts live
    #[serde(default)]
    pub storage: StorageSettings,

    /// Retry engine policy
    #[serde(default)]
    pub retry: RetrySettings,

    /// Breaker settings for dependencies without their own entry
    #[serde(default)]
    pub breaker_defaults: BreakerSettings,

    /// Per-dependency breaker settings
    #[serde(default)]
    pub dependencies: BTreeMap<String, BreakerSettings>,

    /// Per-role ceilings and maximum ages
    #[serde(default = "default_roles")]
    pub roles: BTreeMap<String, RoleSettings>,

    /// Spawn tree limits
    #[serde(default)]
    pub governor: GovernorSettings,

    /// Pruning sweep
    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    /// Orchestration policy
    #[serde(default)]
    pub policy: PolicySettings,

    /// Operator alerting
    #[serde(default)]
    pub alerts: AlertSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Append-only JSON lines file written by the degrade path
    #[serde(default = "default_degrade_log")]
    pub degrade_log: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the initial call; each one is preceded by a backoff sleep
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the random multiplier added to each backoff
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Cap for attempt timeouts that grow after TIMEOUT failures
    #[serde(default = "default_max_attempt_timeout_ms")]
    pub max_attempt_timeout_ms: u64,

    #[serde(default = "default_retryable_kinds")]
    pub retryable_kinds: BTreeSet<ErrorKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSettings {
    pub ceiling: u32,

    #[serde(default = "default_max_worker_age_secs")]
    pub max_worker_age_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GovernorSettings {
    /// Deepest allowed helper generation (roots are depth 0)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Max ACTIVE workers sharing one root, across all roles
    #[serde(default = "default_max_tree_size")]
    pub max_tree_size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Bound on each registry scan made by the sweeper
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Max age for workers whose role has no entry
    #[serde(default = "default_max_worker_age_secs")]
    pub default_max_worker_age_secs: u64,

    #[serde(default = "default_override_poll_secs")]
    pub override_poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Retry engine rounds a task may run before it is out of local budget
    #[serde(default = "default_local_rounds")]
    pub local_rounds: u32,

    /// Tasks running longer than this may ask for a helper
    #[serde(default = "default_spawn_after_secs")]
    pub spawn_after_secs: u64,

    #[serde(default = "default_helper_role")]
    pub helper_role: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default = "default_alert_window_secs")]
    pub window_secs: u64,

    /// DEGRADED_COMPLETE outcomes per role within the window that raise an alert
    #[serde(default = "default_alert_threshold")]
    pub threshold: usize,
}

// Default value providers
fn default_db_path() -> PathBuf {
    PathBuf::from(".tether/registry.db")
}

fn default_degrade_log() -> PathBuf {
    PathBuf::from(".tether/degraded.jsonl")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_fraction() -> f64 {
    0.2
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempt_timeout_ms() -> u64 {
    120_000
}

fn default_retryable_kinds() -> BTreeSet<ErrorKind> {
    [ErrorKind::Transient, ErrorKind::Timeout, ErrorKind::RateLimited]
        .into_iter()
        .collect()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_max_worker_age_secs() -> u64 {
    30 * 60
}

fn default_roles() -> BTreeMap<String, RoleSettings> {
    let mut roles = BTreeMap::new();
    roles.insert(
        "worker".to_string(),
        RoleSettings {
            ceiling: 4,
            max_worker_age_secs: 30 * 60,
        },
    );
    roles.insert(
        "helper".to_string(),
        RoleSettings {
            ceiling: 10,
            max_worker_age_secs: 15 * 60,
        },
    );
    roles
}

fn default_max_depth() -> u32 {
    2
}

fn default_max_tree_size() -> u32 {
    8
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_override_poll_secs() -> u64 {
    5
}

fn default_local_rounds() -> u32 {
    2
}

fn default_spawn_after_secs() -> u64 {
    120
}

fn default_helper_role() -> String {
    "helper".to_string()
}

fn default_alert_window_secs() -> u64 {
    60 * 60
}

fn default_alert_threshold() -> usize {
    3
}

impl TetherConfig {
    /// Load configuration from `.tether/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".tether/config.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            TetherError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.tether/config.toml`
    pub fn write_default(root: &Path) -> Result<PathBuf> {
        let config_dir = root.join(".tether");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default()).map_err(|e| {
            TetherError::Config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Reject settings that would disable a safety property
    pub fn validate(&self) -> Result<()> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(TetherError::Config("retry.max_attempts must be >= 1".into()));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(TetherError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_fraction) {
            return Err(TetherError::Config(
                "retry.jitter_fraction must be within [0, 1]".into(),
            ));
        }
        if retry.attempt_timeout_ms == 0 || retry.attempt_timeout_ms > retry.max_attempt_timeout_ms
        {
            return Err(TetherError::Config(
                "retry.attempt_timeout_ms must be in 1..=max_attempt_timeout_ms".into(),
            ));
        }
        if retry.retryable_kinds.contains(&ErrorKind::DependencyUnavailable) {
            return Err(TetherError::Config(
                "dependency_unavailable can never be retryable".into(),
            ));
        }

        for (key, breaker) in std::iter::once(("breaker_defaults", &self.breaker_defaults))
            .chain(self.dependencies.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if breaker.failure_threshold == 0 {
                return Err(TetherError::Config(format!(
                    "{}: failure_threshold must be >= 1",
                    key
                )));
            }
        }

        for (name, role) in &self.roles {
            if role.ceiling == 0 {
                return Err(TetherError::Config(format!(
                    "roles.{}: ceiling must be >= 1",
                    name
                )));
            }
        }

        if !self.roles.contains_key(&self.policy.helper_role) {
            return Err(TetherError::Config(format!(
                "policy.helper_role '{}' has no [roles] entry",
                self.policy.helper_role
            )));
        }

        if self.alerts.threshold == 0 {
            return Err(TetherError::Config("alerts.threshold must be >= 1".into()));
        }

        Ok(())
    }

    /// Breaker settings for a dependency, falling back to the defaults
    pub fn breaker_for(&self, key: &DependencyKey) -> BreakerSettings {
        self.dependencies
            .get(key.as_str())
            .copied()
            .unwrap_or(self.breaker_defaults)
    }

    /// Role definition, if the role is configured
    pub fn role(&self, name: &str) -> Option<WorkerRole> {
        self.roles.get(name).map(|settings| WorkerRole {
            name: name.to_string(),
            ceiling: settings.ceiling,
            max_worker_age: Duration::from_secs(settings.max_worker_age_secs),
        })
    }

    /// All configured roles
    pub fn worker_roles(&self) -> Vec<WorkerRole> {
        self.roles
            .keys()
            .filter_map(|name| self.role(name))
            .collect()
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn max_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.max_attempt_timeout_ms)
    }
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl LifecycleSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn default_max_worker_age(&self) -> Duration {
        Duration::from_secs(self.default_max_worker_age_secs)
    }

    pub fn override_poll_interval(&self) -> Duration {
        Duration::from_secs(self.override_poll_secs)
    }
}

impl PolicySettings {
    pub fn spawn_after(&self) -> Duration {
        Duration::from_secs(self.spawn_after_secs)
    }
}

impl AlertSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            storage: StorageSettings::default(),
            retry: RetrySettings::default(),
            breaker_defaults: BreakerSettings::default(),
            dependencies: BTreeMap::new(),
            roles: default_roles(),
            governor: GovernorSettings::default(),
            lifecycle: LifecycleSettings::default(),
            policy: PolicySettings::default(),
            alerts: AlertSettings::default(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            degrade_log: default_degrade_log(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_attempt_timeout_ms: default_max_attempt_timeout_ms(),
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_tree_size: default_max_tree_size(),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            query_timeout_ms: default_query_timeout_ms(),
            default_max_worker_age_secs: default_max_worker_age_secs(),
            override_poll_secs: default_override_poll_secs(),
        }
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            local_rounds: default_local_rounds(),
            spawn_after_secs: default_spawn_after_secs(),
            helper_role: default_helper_role(),
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            window_secs: default_alert_window_secs(),
            threshold: default_alert_threshold(),
        }
    }
}
