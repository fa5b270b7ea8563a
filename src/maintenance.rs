//! Maintenance scheduler
//!
//! A small cron subset drives the background tasks: hourly project-index
//! refresh, daily reclustering, graph pruning, vector TTL cleanup, and a
//! weekly vacuum. Each task kind owns its dependencies, handlers never
//! throw (failures become recorded outcomes), runs are at most one per
//! task per minute, and the run history persists to a JSON state file
//! that resets itself when unreadable. Schedules evaluate in UTC.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::clustering::ClusterManager;
use crate::config::{MaintenanceConfig, VectorConfig};
use crate::db::{self, ChunkStore};
use crate::error::{EngramError, Result};
use crate::pruner::Pruner;
use crate::vectors::VectorStore;

/// Daemon tick interval
const TICK_SECONDS: u64 = 60;
/// A task idle longer than this is considered stale at startup
const STALE_HOURS: i64 = 24;

// ============================================================================
// Cron subset
// ============================================================================

/// One cron field: `*`, a plain integer, or `*/step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Any,
    Exact(u32),
    Step(u32),
}

impl CronField {
    fn parse(raw: &str) -> Result<Self> {
        if raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| EngramError::invalid(format!("bad cron step '{raw}'")))?;
            if step == 0 {
                return Err(EngramError::invalid("cron step must be positive"));
            }
            return Ok(Self::Step(step));
        }
        let value: u32 = raw
            .parse()
            .map_err(|_| EngramError::invalid(format!("bad cron field '{raw}'")))?;
        Ok(Self::Exact(value))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => *v == value,
            Self::Step(step) => value % step == 0,
        }
    }
}

/// Five-field schedule: minute hour day-of-month month day-of-week
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    /// # Errors
    ///
    /// Returns `InvalidArgument` for anything but five parseable fields.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngramError::invalid(format!(
                "cron expression needs 5 fields, got {}: '{expr}'",
                fields.len()
            )));
        }
        Ok(Self {
            minute: CronField::parse(fields[0])?,
            hour: CronField::parse(fields[1])?,
            day_of_month: CronField::parse(fields[2])?,
            month: CronField::parse(fields[3])?,
            day_of_week: CronField::parse(fields[4])?,
        })
    }

    /// Whether the given instant matches every field. Day-of-week counts
    /// from Sunday = 0.
    pub fn matches<T: Datelike + Timelike>(&self, time: &T) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.day_of_month.matches(time.day())
            && self.month.matches(time.month())
            && self.day_of_week.matches(time.weekday().num_days_from_sunday())
    }
}

/// A schedule fires when the time matches and the task has not already
/// started within the current minute.
pub fn should_run(
    schedule: &CronSchedule,
    now: DateTime<Utc>,
    last_run: Option<&TaskOutcome>,
) -> bool {
    if !schedule.matches(&now) {
        return false;
    }
    match last_run {
        Some(outcome) => outcome.start.timestamp() / 60 != now.timestamp() / 60,
        None => true,
    }
}

// ============================================================================
// State file
// ============================================================================

/// Recorded result of one task run
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskOutcome {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Persisted run history. Unparseable files reset to empty; losing run
/// history is always safe.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MaintenanceState {
    pub last_runs: HashMap<String, TaskOutcome>,
}

impl MaintenanceState {
    pub fn load(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => state,
                Err(e) => {
                    warn!("maintenance state unreadable, resetting: {}", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// What a task does, carrying exactly the handles it needs
pub enum TaskKind {
    /// Rebuild the chunk -> project side index for filtered search
    ScanProjects {
        chunks: ChunkStore,
        vectors: Arc<VectorStore>,
    },
    /// Re-run HDBSCAN and swap the cluster tables
    UpdateClusters { manager: Arc<ClusterManager> },
    /// Flush the dead-edge queue
    PruneGraph { pruner: Arc<Pruner> },
    /// Evict stale orphaned vectors (and their chunks), enforce the cap
    CleanupVectors {
        chunks: ChunkStore,
        vectors: Arc<VectorStore>,
        config: VectorConfig,
    },
    /// Compact the database and rewrite the vector file
    Vacuum {
        pool: SqlitePool,
        vectors: Arc<VectorStore>,
    },
}

/// A named, scheduled task
pub struct MaintenanceTask {
    pub name: &'static str,
    pub schedule: CronSchedule,
    pub kind: TaskKind,
}

impl TaskKind {
    async fn run(&self) -> Result<(String, Option<serde_json::Value>)> {
        match self {
            TaskKind::ScanProjects { chunks, vectors } => {
                let index = chunks.project_index().await?;
                let count = index.len();
                vectors.set_project_index(index);
                Ok((format!("indexed {count} chunks"), None))
            }
            TaskKind::UpdateClusters { manager } => {
                let report = manager.recluster().await?;
                let message = format!(
                    "{} clusters, {} noise",
                    report.num_clusters, report.noise_chunks
                );
                Ok((message, Some(serde_json::to_value(report)?)))
            }
            TaskKind::PruneGraph { pruner } => {
                let report = pruner.flush_now().await?;
                let message = format!(
                    "{} edges pruned, {} chunks orphaned",
                    report.edges_deleted, report.chunks_orphaned
                );
                Ok((message, Some(serde_json::to_value(report)?)))
            }
            TaskKind::CleanupVectors {
                chunks,
                vectors,
                config,
            } => {
                let now = Utc::now();
                let cutoff = now - chrono::Duration::days(config.ttl_days as i64);
                let orphaned: HashSet<String> =
                    chunks.orphaned_before(cutoff).await?.into_iter().collect();
                let expired = vectors.cleanup_expired(config.ttl_days, &orphaned, now);
                for id in &expired {
                    // The vector is already gone; drop the chunk row too.
                    if let Err(e) = chunks.delete(id).await {
                        warn!("cleanup could not delete chunk {}: {}", id, e);
                    }
                }
                let capped = vectors.evict_oldest_by_count(config.max_count);
                Ok((
                    format!("{} expired, {} over cap", expired.len(), capped.len()),
                    None,
                ))
            }
            TaskKind::Vacuum { pool, vectors } => {
                db::compact(pool).await?;
                let reclaimed = vectors.vacuum()?;
                Ok((format!("reclaimed {reclaimed} vector rows"), None))
            }
        }
    }
}

/// The standard task table for one engine instance.
pub fn standard_tasks(
    maintenance: &MaintenanceConfig,
    vector_config: VectorConfig,
    pool: SqlitePool,
    chunks: ChunkStore,
    vectors: Arc<VectorStore>,
    manager: Arc<ClusterManager>,
    pruner: Arc<Pruner>,
) -> Vec<MaintenanceTask> {
    let cluster_hour = maintenance.cluster_hour % 24;
    let after_hour = (cluster_hour + 1) % 24;
    let parse = |expr: String| CronSchedule::parse(&expr).expect("static schedule");

    vec![
        MaintenanceTask {
            name: "scan-projects",
            schedule: parse("0 * * * *".to_string()),
            kind: TaskKind::ScanProjects {
                chunks: chunks.clone(),
                vectors: vectors.clone(),
            },
        },
        MaintenanceTask {
            name: "update-clusters",
            schedule: parse(format!("0 {cluster_hour} * * *")),
            kind: TaskKind::UpdateClusters { manager },
        },
        MaintenanceTask {
            name: "prune-graph",
            schedule: parse(format!("0 {after_hour} * * *")),
            kind: TaskKind::PruneGraph { pruner },
        },
        MaintenanceTask {
            name: "cleanup-vectors",
            schedule: parse(format!("30 {after_hour} * * *")),
            kind: TaskKind::CleanupVectors {
                chunks,
                vectors: vectors.clone(),
                config: vector_config,
            },
        },
        MaintenanceTask {
            name: "vacuum",
            schedule: parse(format!("0 {cluster_hour} * * 0")),
            kind: TaskKind::Vacuum { pool, vectors },
        },
    ]
}

// ============================================================================
// Scheduler
// ============================================================================

/// Owns the task table and run history
pub struct Scheduler {
    tasks: Vec<MaintenanceTask>,
    state: Mutex<MaintenanceState>,
    state_path: PathBuf,
}

impl Scheduler {
    pub fn new(tasks: Vec<MaintenanceTask>, state_path: PathBuf) -> Self {
        let state = MaintenanceState::load(&state_path);
        Self {
            tasks,
            state: Mutex::new(state),
            state_path,
        }
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name).collect()
    }

    /// Run one task by name, recording the outcome. Handler failures
    /// become `success = false`; they never propagate.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` only for an unknown task name.
    pub async fn run_task(&self, name: &str) -> Result<TaskOutcome> {
        let task = self
            .tasks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| EngramError::invalid(format!("unknown task '{name}'")))?;

        let start = Utc::now();
        info!("maintenance task {} starting", name);
        let outcome = match task.kind.run().await {
            Ok((message, details)) => TaskOutcome {
                start,
                end: Utc::now(),
                success: true,
                message,
                details,
            },
            Err(e) => TaskOutcome {
                start,
                end: Utc::now(),
                success: false,
                message: e.to_string(),
                details: None,
            },
        };
        info!(
            "maintenance task {} finished: success={} ({})",
            name, outcome.success, outcome.message
        );

        let mut state = self.state.lock().await;
        state.last_runs.insert(name.to_string(), outcome.clone());
        if let Err(e) = state.save(&self.state_path) {
            warn!("could not persist maintenance state: {}", e);
        }
        Ok(outcome)
    }

    /// Task names that never ran or last ran more than a day ago
    pub async fn stale_tasks(&self, now: DateTime<Utc>) -> Vec<&'static str> {
        let state = self.state.lock().await;
        self.tasks
            .iter()
            .filter(|task| match state.last_runs.get(task.name) {
                Some(outcome) => now - outcome.start > chrono::Duration::hours(STALE_HOURS),
                None => true,
            })
            .map(|t| t.name)
            .collect()
    }

    /// Tick every minute, firing whichever schedules match, until the
    /// shutdown signal flips. Stale tasks are caught up at startup.
    /// Tasks run sequentially, so one task never overlaps itself.
    pub async fn run_daemon(&self, mut shutdown: watch::Receiver<bool>) {
        for name in self.stale_tasks(Utc::now()).await {
            info!("running stale maintenance task {} at startup", name);
            let _ = self.run_task(name).await;
        }

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(TICK_SECONDS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    for task in &self.tasks {
                        let due = {
                            let state = self.state.lock().await;
                            should_run(&task.schedule, now, state.last_runs.get(task.name))
                        };
                        if due {
                            let _ = self.run_task(task.name).await;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("maintenance daemon stopping");
                        return;
                    }
                }
            }
        }
    }
}
