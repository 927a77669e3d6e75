//! Turso-backed worker registry.
//!
//! Architecture:
//!   - Database file: .tether/registry.db
//!   - WAL mode so the sweeper can scan while workers heartbeat
//!   - Schema: workers, breakers, dependency_overrides
//!   - Timestamps are stored as integer milliseconds since the epoch
//!
//! The ceiling check is a single `INSERT ... SELECT ... WHERE (count) < ?`
//! statement, so two processes racing for the last slot cannot both win.
//! Breaker transitions follow the same rule: an `UPDATE ... WHERE` on the
//! full previous row, applied only if nobody changed it in between.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use tether_core::{
    BreakerRecord, BreakerStore, DependencyKey, DependencyOverride, NewWorker, SpawnCeilings,
    TetherError, WorkerId, WorkerRecord, WorkerState,
};
use tokio::sync::Mutex;
use tracing::debug;
use turso::{params, Builder, Connection};

use crate::WorkerRegistry;

/// Database errors
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("turso error: {0}")]
    Turso(#[from] turso::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<DbError> for TetherError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Io(e) => TetherError::Io(e),
            DbError::Json(e) => TetherError::Serialization(e),
            other => TetherError::Registry(other.to_string()),
        }
    }
}

type DbResult<T> = std::result::Result<T, DbError>;

const WORKER_COLUMNS: &str = "id, role, parent_id, root_id, depth, dependency, \
                              created_at, last_heartbeat_at, state";

/// Durable registry shared by every worker process
pub struct TursoRegistry {
    conn: Mutex<Connection>,
    path: String,
}

impl TursoRegistry {
    /// Open (and create if needed) the registry at `path`, then apply the schema.
    ///
    /// ```no_run
    /// use tether_registry::TursoRegistry;
    ///
    /// # async fn example() -> tether_core::Result<()> {
    /// let registry = TursoRegistry::open(".tether/registry.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open<P: AsRef<Path>>(path: P) -> tether_core::Result<Self> {
        Ok(Self::open_inner(path.as_ref()).await?)
    }

    async fn open_inner(path: &Path) -> DbResult<Self> {
        let path_str = path.to_string_lossy().to_string();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        // PRAGMA statements may return rows, so use query()
        let _ = conn.query("PRAGMA journal_mode=WAL", params![]).await?;
        let _ = conn.query("PRAGMA busy_timeout=5000", params![]).await?;

        let registry = Self {
            conn: Mutex::new(conn),
            path: path_str,
        };
        registry.init_schema().await?;
        Ok(registry)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Idempotent schema creation
    async fn init_schema(&self) -> DbResult<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                parent_id TEXT,
                root_id TEXT NOT NULL,
                depth INTEGER NOT NULL DEFAULT 0,
                dependency TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_heartbeat_at INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'active'
            )"#,
            r#"CREATE TABLE IF NOT EXISTS breakers (
                dependency TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'closed',
                failures INTEGER NOT NULL DEFAULT 0,
                stamp_ms INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS dependency_overrides (
                dependency TEXT PRIMARY KEY,
                reason TEXT,
                set_at INTEGER NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_workers_role_state ON workers(role, state)",
            "CREATE INDEX IF NOT EXISTS idx_workers_root_state ON workers(root_id, state)",
            "CREATE INDEX IF NOT EXISTS idx_workers_created ON workers(state, created_at)",
        ];

        let conn = self.conn.lock().await;
        for stmt in statements {
            conn.execute(stmt, params![]).await?;
        }
        Ok(())
    }

    async fn select_workers(
        &self,
        clause: &str,
        args: Vec<turso::Value>,
    ) -> DbResult<Vec<WorkerRecord>> {
        let query = format!("SELECT {} FROM workers {}", WORKER_COLUMNS, clause);
        let conn = self.conn.lock().await;
        let mut rows = conn.query(&query, args).await?;
        let mut workers = Vec::new();
        while let Some(row) = rows.next().await? {
            workers.push(parse_worker_row(&row)?);
        }
        Ok(workers)
    }

    async fn count(&self, query: &str, arg: String) -> DbResult<u32> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query(query, params![arg]).await?;
        match rows.next().await? {
            Some(row) => {
                let n: i64 = row.get(0)?;
                Ok(n.max(0) as u32)
            }
            None => Ok(0),
        }
    }

    async fn transition_from_active(&self, id: &WorkerId, to: WorkerState) -> DbResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE workers SET state = ? WHERE id = ? AND state = 'active'",
                params![to.to_string(), id.as_str()],
            )
            .await?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl WorkerRegistry for TursoRegistry {
    async fn insert_if_under_ceiling(
        &self,
        worker: NewWorker,
        ceilings: SpawnCeilings,
    ) -> tether_core::Result<Option<WorkerRecord>> {
        let query = format!(
            r#"INSERT INTO workers ({})
               SELECT ?, ?, ?, ?, ?, ?, ?, ?, 'active'
               WHERE (SELECT COUNT(*) FROM workers WHERE role = ? AND state = 'active') < ?
                 AND (SELECT COUNT(*) FROM workers WHERE root_id = ? AND state = 'active') < ?"#,
            WORKER_COLUMNS
        );
        let created = worker.created_at.timestamp_millis();

        let inserted = {
            let conn = self.conn.lock().await;
            conn.execute(
                &query,
                params![
                    worker.id.as_str(),
                    worker.role.clone(),
                    worker.parent_id.as_ref().map(|p| p.as_str().to_string()),
                    worker.root_id.as_str(),
                    worker.depth as i64,
                    worker.dependency.as_str(),
                    created,
                    created,
                    worker.role.clone(),
                    ceilings.role as i64,
                    worker.root_id.as_str(),
                    ceilings.tree as i64,
                ],
            )
            .await
            .map_err(DbError::from)?
        };

        if inserted == 0 {
            debug!(role = %worker.role, "conditional insert refused at ceiling");
            return Ok(None);
        }
        Ok(Some(worker.into_record()))
    }

    async fn get(&self, id: &WorkerId) -> tether_core::Result<Option<WorkerRecord>> {
        let mut found = self
            .select_workers("WHERE id = ?", vec![id.as_str().to_string().into()])
            .await?;
        Ok(found.pop())
    }

    async fn update_heartbeat(&self, id: &WorkerId, at: DateTime<Utc>) -> tether_core::Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE workers SET last_heartbeat_at = ? WHERE id = ? AND state = 'active'",
                params![at.timestamp_millis(), id.as_str()],
            )
            .await
            .map_err(DbError::from)?;
        Ok(changed > 0)
    }

    async fn count_active(&self, role: &str) -> tether_core::Result<u32> {
        Ok(self
            .count(
                "SELECT COUNT(*) FROM workers WHERE role = ? AND state = 'active'",
                role.to_string(),
            )
            .await?)
    }

    async fn count_active_in_tree(&self, root: &WorkerId) -> tether_core::Result<u32> {
        Ok(self
            .count(
                "SELECT COUNT(*) FROM workers WHERE root_id = ? AND state = 'active'",
                root.as_str().to_string(),
            )
            .await?)
    }

    async fn mark_terminated(&self, id: &WorkerId) -> tether_core::Result<bool> {
        Ok(self.transition_from_active(id, WorkerState::Terminated).await?)
    }

    async fn mark_degraded(&self, id: &WorkerId) -> tether_core::Result<bool> {
        Ok(self.transition_from_active(id, WorkerState::Degraded).await?)
    }

    async fn select_stale_active(
        &self,
        created_before: DateTime<Utc>,
        role: Option<&str>,
    ) -> tether_core::Result<Vec<WorkerRecord>> {
        let mut clause = String::from("WHERE state = 'active' AND created_at < ?");
        let mut args: Vec<turso::Value> = vec![created_before.timestamp_millis().into()];
        if let Some(role) = role {
            clause.push_str(" AND role = ?");
            args.push(role.to_string().into());
        }
        clause.push_str(" ORDER BY created_at ASC");
        Ok(self.select_workers(&clause, args).await?)
    }

    async fn list(&self, state: Option<WorkerState>) -> tether_core::Result<Vec<WorkerRecord>> {
        let workers = match state {
            Some(state) => {
                self.select_workers(
                    "WHERE state = ? ORDER BY created_at ASC",
                    vec![state.to_string().into()],
                )
                .await?
            }
            None => self.select_workers("ORDER BY created_at ASC", Vec::new()).await?,
        };
        Ok(workers)
    }

    async fn set_override(&self, entry: &DependencyOverride) -> tether_core::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO dependency_overrides (dependency, reason, set_at)
               VALUES (?, ?, ?)
               ON CONFLICT(dependency) DO UPDATE SET
                   reason = excluded.reason,
                   set_at = excluded.set_at"#,
            params![
                entry.dependency.as_str(),
                entry.reason.clone(),
                entry.set_at.timestamp_millis(),
            ],
        )
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn clear_override(&self, dependency: &DependencyKey) -> tether_core::Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM dependency_overrides WHERE dependency = ?",
                params![dependency.as_str()],
            )
            .await
            .map_err(DbError::from)?;
        Ok(removed > 0)
    }

    async fn list_overrides(&self) -> tether_core::Result<Vec<DependencyOverride>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT dependency, reason, set_at FROM dependency_overrides ORDER BY dependency",
                params![],
            )
            .await
            .map_err(DbError::from)?;

        let mut overrides = Vec::new();
        while let Some(row) = rows.next().await.map_err(DbError::from)? {
            let dependency: String = row.get(0).map_err(DbError::from)?;
            let reason: Option<String> = row.get(1).map_err(DbError::from)?;
            let set_at: i64 = row.get(2).map_err(DbError::from)?;
            overrides.push(DependencyOverride {
                dependency: DependencyKey::new(dependency),
                reason,
                set_at: from_millis(set_at)?,
            });
        }
        Ok(overrides)
    }
}

#[async_trait]
impl BreakerStore for TursoRegistry {
    async fn load_breaker(&self, dependency: &DependencyKey) -> tether_core::Result<BreakerRecord> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT state, failures, stamp_ms FROM breakers WHERE dependency = ?",
                params![dependency.as_str()],
            )
            .await
            .map_err(DbError::from)?;
        match rows.next().await.map_err(DbError::from)? {
            Some(row) => Ok(parse_breaker_row(&row, 0)?),
            None => Ok(BreakerRecord::CLOSED),
        }
    }

    async fn swap_breaker(
        &self,
        dependency: &DependencyKey,
        expected: &BreakerRecord,
        next: &BreakerRecord,
    ) -> tether_core::Result<bool> {
        let conn = self.conn.lock().await;

        // A missing row reads as CLOSED; seed it so the swap below has a row
        // to compare against
        if *expected == BreakerRecord::CLOSED {
            conn.execute(
                r#"INSERT INTO breakers (dependency, state, failures, stamp_ms)
                   VALUES (?, 'closed', 0, 0)
                   ON CONFLICT(dependency) DO NOTHING"#,
                params![dependency.as_str()],
            )
            .await
            .map_err(DbError::from)?;
        }

        let changed = conn
            .execute(
                r#"UPDATE breakers SET state = ?, failures = ?, stamp_ms = ?
                   WHERE dependency = ? AND state = ? AND failures = ? AND stamp_ms = ?"#,
                params![
                    next.state.to_string(),
                    next.consecutive_failures as i64,
                    next.stamp_ms as i64,
                    dependency.as_str(),
                    expected.state.to_string(),
                    expected.consecutive_failures as i64,
                    expected.stamp_ms as i64,
                ],
            )
            .await
            .map_err(DbError::from)?;
        Ok(changed > 0)
    }

    async fn list_breakers(&self) -> tether_core::Result<Vec<(DependencyKey, BreakerRecord)>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT dependency, state, failures, stamp_ms FROM breakers ORDER BY dependency",
                params![],
            )
            .await
            .map_err(DbError::from)?;

        let mut breakers = Vec::new();
        while let Some(row) = rows.next().await.map_err(DbError::from)? {
            let dependency: String = row.get(0).map_err(DbError::from)?;
            breakers.push((DependencyKey::new(dependency), parse_breaker_row(&row, 1)?));
        }
        Ok(breakers)
    }
}

fn from_millis(millis: i64) -> DbResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| DbError::Corrupt(format!("invalid timestamp: {}", millis)))
}

fn parse_worker_row(row: &turso::Row) -> DbResult<WorkerRecord> {
    let parent_id: Option<String> = row.get(2)?;
    let depth: i64 = row.get(4)?;
    let created_at: i64 = row.get(6)?;
    let last_heartbeat_at: i64 = row.get(7)?;
    let state: String = row.get(8)?;

    Ok(WorkerRecord {
        id: WorkerId::from_raw(row.get::<String>(0)?),
        role: row.get(1)?,
        parent_id: parent_id.map(WorkerId::from_raw),
        root_id: WorkerId::from_raw(row.get::<String>(3)?),
        depth: depth.max(0) as u32,
        dependency: DependencyKey::new(row.get::<String>(5)?),
        created_at: from_millis(created_at)?,
        last_heartbeat_at: from_millis(last_heartbeat_at)?,
        state: state.parse().map_err(DbError::Corrupt)?,
    })
}

/// Breaker columns `state, failures, stamp_ms` starting at `offset`
fn parse_breaker_row(row: &turso::Row, offset: usize) -> DbResult<BreakerRecord> {
    let state: String = row.get(offset)?;
    let failures: i64 = row.get(offset + 1)?;
    let stamp_ms: i64 = row.get(offset + 2)?;
    Ok(BreakerRecord {
        state: state.parse().map_err(DbError::Corrupt)?,
        consecutive_failures: failures.clamp(0, u32::MAX as i64) as u32,
        stamp_ms: stamp_ms.max(0) as u64,
    })
}
