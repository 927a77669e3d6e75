//! Tether CLI - operator surface for the worker resilience core
//!
//! Usage:
//!   tether init                       Write default config and create the registry
//!   tether status                     Roles, trees, overrides and shared breakers
//!   tether workers [--state active]   List registered workers
//!   tether spawn --role helper        Ask the governor for a worker
//!   tether trip <dependency>          Emergency force-open a dependency
//!   tether reset <dependency>         Lift an emergency override
//!   tether prune [--max-age-secs N]   Run one pruning pass
//!   tether daemon                     Run the sweeper and override watcher

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tether_core::{DependencyKey, TetherConfig, WorkerId, WorkerRecord, WorkerState};
use tether_orchestrator::{Runtime, SpawnDecision, SpawnRequest};
use tether_registry::WorkerRegistry;
use tether_resilience::BreakerSnapshot;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about = "Circuit breakers and spawn governance for autonomous workers")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project root holding the .tether directory
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default config and create the registry
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Show roles, worker trees, overrides and shared breakers
    Status,

    /// List registered workers
    Workers {
        /// Filter by state (active, degraded, terminated)
        #[arg(long)]
        state: Option<String>,

        /// Print JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Request a new worker through the spawn governor
    Spawn {
        #[arg(long)]
        role: String,

        /// Dependency the worker will call
        #[arg(long, default_value = "primary-api")]
        dependency: String,

        /// Parent worker id, for helpers
        #[arg(long)]
        parent: Option<String>,
    },

    /// Record a heartbeat for a worker
    Heartbeat { id: String },

    /// Mark a worker terminated
    Terminate { id: String },

    /// Run one pruning pass
    Prune {
        /// Prune every role at this age instead of the per-role limits
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Force a dependency's breaker open everywhere (emergency stop)
    Trip {
        dependency: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Lift an emergency override
    Reset { dependency: String },

    /// Show recorded degrade artifacts
    Degraded {
        /// Only the most recent N
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Run the pruning sweeper and override watcher until Ctrl-C
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(cli.root, force).await,
        Commands::Status => cmd_status(cli.root).await,
        Commands::Workers { state, json } => cmd_workers(cli.root, state, json).await,
        Commands::Spawn {
            role,
            dependency,
            parent,
        } => cmd_spawn(cli.root, role, dependency, parent).await,
        Commands::Heartbeat { id } => cmd_heartbeat(cli.root, id).await,
        Commands::Terminate { id } => cmd_terminate(cli.root, id).await,
        Commands::Prune { max_age_secs } => cmd_prune(cli.root, max_age_secs).await,
        Commands::Trip { dependency, reason } => cmd_trip(cli.root, dependency, reason).await,
        Commands::Reset { dependency } => cmd_reset(cli.root, dependency).await,
        Commands::Degraded { limit } => cmd_degraded(cli.root, limit).await,
        Commands::Daemon => cmd_daemon(cli.root).await,
    }
}

async fn open_runtime(root: &Path) -> Result<Runtime> {
    let config = TetherConfig::load_or_default(root).context("Failed to load config")?;
    Runtime::open(root, config)
        .await
        .context("Failed to open registry")
}

async fn cmd_init(root: PathBuf, force: bool) -> Result<()> {
    info!("Initializing tether in {:?}", root);

    let config_path = root.join(".tether").join("config.toml");
    if config_path.exists() && !force {
        println!("Config already exists at {:?} (use --force to overwrite)", config_path);
    } else {
        let written = TetherConfig::write_default(&root)?;
        println!("Wrote default config to {:?}", written);
    }

    let runtime = open_runtime(&root).await?;
    println!("Registry ready at {:?}", root.join(&runtime.config.storage.db_path));
    Ok(())
}

async fn cmd_status(root: PathBuf) -> Result<()> {
    let runtime = open_runtime(&root).await?;

    println!("Roles:");
    for role in runtime.config.worker_roles() {
        let active = runtime.registry.count_active(&role.name).await?;
        println!(
            "  {:<12} {:>3}/{:<3} active  (max age {}s)",
            role.name,
            active,
            role.ceiling,
            role.max_worker_age.as_secs()
        );
    }

    let active = runtime.registry.list(Some(WorkerState::Active)).await?;
    let roots: BTreeSet<&WorkerId> = active.iter().map(|w| &w.root_id).collect();
    println!("\nTrees:");
    if roots.is_empty() {
        println!("  (none)");
    }
    for root in roots {
        let size = runtime.registry.count_active_in_tree(root).await?;
        println!(
            "  {:<40} {:>3}/{:<3} active",
            root,
            size,
            runtime.config.governor.max_tree_size
        );
    }

    let overrides = runtime.registry.list_overrides().await?;
    println!("\nOverrides:");
    if overrides.is_empty() {
        println!("  (none)");
    }
    for o in &overrides {
        println!(
            "  {:<16} tripped {}  {}",
            o.dependency.as_str(),
            o.set_at.format("%Y-%m-%d %H:%M:%S UTC"),
            o.reason.as_deref().unwrap_or("")
        );
    }

    // Configured dependencies show up even before any worker has called them
    for key in runtime.config.dependencies.keys() {
        runtime.breakers.get(&DependencyKey::new(key.as_str()));
    }
    println!("\nBreakers (shared):");
    for snap in runtime.breakers.snapshots().await {
        print_breaker(&snap);
    }

    let degraded = runtime.sink.read_all().await?;
    println!("\nDegraded tasks recorded: {}", degraded.len());
    Ok(())
}

fn print_breaker(snap: &BreakerSnapshot) {
    println!(
        "  {:<16} {:<10} failures {}/{}  cooldown {}s{}",
        snap.dependency.as_str(),
        snap.state.to_string(),
        snap.consecutive_failures,
        snap.failure_threshold,
        snap.cooldown.as_secs(),
        if snap.forced_open { "  [forced]" } else { "" }
    );
}

async fn cmd_workers(root: PathBuf, state: Option<String>, json: bool) -> Result<()> {
    let state: Option<WorkerState> = match state {
        Some(s) => Some(s.parse().map_err(|e: String| anyhow::anyhow!(e))?),
        None => None,
    };
    let runtime = open_runtime(&root).await?;
    let workers = runtime.registry.list(state).await?;

    if json {
        for worker in &workers {
            println!("{}", serde_json::to_string(worker)?);
        }
        return Ok(());
    }

    if workers.is_empty() {
        println!("No workers");
        return Ok(());
    }
    let now = runtime.clock.now();
    for worker in &workers {
        print_worker(worker, now);
    }
    Ok(())
}

fn print_worker(worker: &WorkerRecord, now: chrono::DateTime<chrono::Utc>) {
    let parent = worker
        .parent_id
        .as_ref()
        .map(|p| p.short().to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<40} {:<10} {:<11} depth {} parent {:<10} age {:>6}s  last beat {}s ago  {}",
        worker.id,
        worker.role,
        worker.state.to_string(),
        worker.depth,
        parent,
        worker.age(now).as_secs(),
        (now - worker.last_heartbeat_at).num_seconds().max(0),
        worker.dependency
    );
}

async fn cmd_spawn(
    root: PathBuf,
    role: String,
    dependency: String,
    parent: Option<String>,
) -> Result<()> {
    let runtime = open_runtime(&root).await?;
    let decision = runtime
        .governor
        .request_spawn(SpawnRequest {
            role,
            parent_id: parent.map(WorkerId::from_raw),
            dependency: DependencyKey::new(dependency),
        })
        .await?;

    match decision {
        SpawnDecision::Granted(record) => {
            println!("{}", record.id);
            Ok(())
        }
        SpawnDecision::Refused(refusal) => bail!("spawn refused: {}", refusal),
    }
}

async fn cmd_heartbeat(root: PathBuf, id: String) -> Result<()> {
    let runtime = open_runtime(&root).await?;
    let id = WorkerId::from_raw(id);
    if !runtime.lifecycle.heartbeat(&id).await? {
        bail!("worker {} is not active", id);
    }
    Ok(())
}

async fn cmd_terminate(root: PathBuf, id: String) -> Result<()> {
    let runtime = open_runtime(&root).await?;
    let id = WorkerId::from_raw(id);
    if runtime.registry.mark_terminated(&id).await? {
        println!("Terminated {}", id);
    } else {
        println!("{} was not active", id);
    }
    Ok(())
}

async fn cmd_prune(root: PathBuf, max_age_secs: Option<u64>) -> Result<()> {
    let runtime = open_runtime(&root).await?;
    let report = match max_age_secs {
        Some(secs) => {
            runtime
                .lifecycle
                .prune_stale(std::time::Duration::from_secs(secs))
                .await?
        }
        None => runtime.lifecycle.sweep().await?,
    };

    for id in &report.terminated {
        println!("Pruned {}", id);
    }
    println!(
        "{} worker(s) pruned, {} already inactive",
        report.terminated.len(),
        report.skipped
    );
    Ok(())
}

async fn cmd_trip(root: PathBuf, dependency: String, reason: Option<String>) -> Result<()> {
    let runtime = open_runtime(&root).await?;
    let key = DependencyKey::new(dependency);
    runtime.overrides.trip(&key, reason).await?;
    println!("Tripped {}: every worker will degrade until `tether reset {}`", key, key);
    Ok(())
}

async fn cmd_reset(root: PathBuf, dependency: String) -> Result<()> {
    let runtime = open_runtime(&root).await?;
    let key = DependencyKey::new(dependency);
    if runtime.overrides.reset(&key).await? {
        println!("Override on {} lifted", key);
    } else {
        println!("No override on {}", key);
    }
    Ok(())
}

async fn cmd_degraded(root: PathBuf, limit: Option<usize>) -> Result<()> {
    let runtime = open_runtime(&root).await?;
    let artifacts = runtime.sink.read_all().await?;
    let skip = limit.map_or(0, |n| artifacts.len().saturating_sub(n));

    for artifact in artifacts.iter().skip(skip) {
        println!(
            "{}  {:<10} {:<16} {:<20} {}",
            artifact.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            artifact.role,
            artifact.dependency.as_str(),
            artifact.task,
            artifact.reason
        );
    }
    Ok(())
}

async fn cmd_daemon(root: PathBuf) -> Result<()> {
    let runtime = open_runtime(&root).await?;
    let background = runtime.start_background();
    info!("tether daemon running (Ctrl-C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("shutting down");
    background.shutdown().await;
    Ok(())
}
