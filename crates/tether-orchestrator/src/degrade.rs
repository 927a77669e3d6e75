//! Degrade sink
//!
//! Local append-only JSONL file recording what a degraded task managed to do.
//! It never touches the failing dependency. Write errors are returned to the
//! caller unchanged: they end the task, they are not retried. Every process
//! sharing a project root appends to the same log, which makes it the shared
//! record the operator alerter counts from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tether_core::{DependencyKey, Result, TetherError, WorkerId};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// One degraded task outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradeArtifact {
    pub worker_id: WorkerId,
    pub role: String,
    pub dependency: DependencyKey,
    pub task: String,
    pub reason: String,
    /// Partial progress supplied by the task, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait DegradeSink: Send + Sync {
    async fn append(&self, artifact: &DegradeArtifact) -> Result<()>;

    /// Artifacts for `role` recorded strictly after `since`
    async fn count_since(&self, role: &str, since: DateTime<Utc>) -> Result<usize>;
}

/// JSONL file sink
#[derive(Debug, Clone)]
pub struct FileDegradeSink {
    path: PathBuf,
}

impl FileDegradeSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every artifact in the file, oldest first. Unparseable lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<DegradeArtifact>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!("skipping degrade log line {}: {}", lineno + 1, e),
            }
        }
        Ok(artifacts)
    }
}

#[async_trait]
impl DegradeSink for FileDegradeSink {
    async fn append(&self, artifact: &DegradeArtifact) -> Result<()> {
        let mut line = serde_json::to_string(artifact)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TetherError::DegradeSink(e.to_string()))?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| TetherError::DegradeSink(format!("{}: {}", self.path.display(), e)))?;

        // One write per artifact keeps concurrent appenders line-atomic
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| TetherError::DegradeSink(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| TetherError::DegradeSink(e.to_string()))?;

        debug!(worker = %artifact.worker_id, "degrade artifact written to {:?}", self.path);
        Ok(())
    }

    async fn count_since(&self, role: &str, since: DateTime<Utc>) -> Result<usize> {
        let artifacts = self.read_all().await?;
        Ok(artifacts
            .iter()
            .filter(|a| a.role == role && a.recorded_at > since)
            .count())
    }
}
