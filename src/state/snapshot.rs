//! JSON snapshots of plan execution.
//!
//! One file per plan, `<dir>/<plan_id>.json`, replaced atomically through a
//! temporary file. Snapshots are written when a plan finishes and can be
//! listed or loaded later for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::plan::plan_id_problem;
use crate::core::{ExecutionStore, Plan, PlanStatus, TaskExecutionState, TaskId};
use crate::error::ValidationError;
use crate::util::blocking;
use crate::Result;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub state: TaskExecutionState,
}

/// Point-in-time record of a plan and every task's execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub version: u32,
    pub plan_id: String,
    pub status: PlanStatus,
    pub saved_at: DateTime<Utc>,
    pub plan: Plan,
    pub tasks: Vec<TaskSnapshot>,
}

impl PlanSnapshot {
    pub fn capture(plan: &Plan, store: &ExecutionStore, status: PlanStatus) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            plan_id: plan.plan_id.clone(),
            status,
            saved_at: Utc::now(),
            plan: plan.clone(),
            tasks: store
                .snapshot()
                .into_iter()
                .map(|(task_id, state)| TaskSnapshot { task_id, state })
                .collect(),
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskExecutionState> {
        self.tasks.iter().find(|t| &t.task_id == id).map(|t| &t.state)
    }
}

/// Directory of plan snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot file of a plan. Ids that would leave the directory are refused.
    pub fn path_for(&self, plan_id: &str) -> Result<PathBuf> {
        if let Some(reason) = plan_id_problem(plan_id) {
            return Err(ValidationError::InvalidPlanId {
                plan_id: plan_id.to_string(),
                reason,
            }
            .into());
        }
        Ok(self.dir.join(format!("{}.json", plan_id)))
    }

    pub async fn save(&self, snapshot: &PlanSnapshot) -> Result<PathBuf> {
        let contents = serde_json::to_string_pretty(snapshot)?;
        let dir = self.dir.clone();
        let path = self.path_for(&snapshot.plan_id)?;
        blocking(move || {
            write_atomic(&dir, &path, &contents)?;
            Ok(path)
        })
        .await
    }

    pub fn save_sync(&self, snapshot: &PlanSnapshot) -> Result<PathBuf> {
        let contents = serde_json::to_string_pretty(snapshot)?;
        let path = self.path_for(&snapshot.plan_id)?;
        write_atomic(&self.dir, &path, &contents)?;
        Ok(path)
    }

    /// Load a plan's snapshot, `None` if it was never saved.
    pub fn load(&self, plan_id: &str) -> Result<Option<PlanSnapshot>> {
        let path = self.path_for(plan_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Plan ids with a saved snapshot, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn write_atomic(dir: &Path, path: &Path, contents: &str) -> Result<()> {
    if !dir.exists() {
        debug!("Creating snapshot directory: {}", dir.display());
        fs::create_dir_all(dir)?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    debug!("Snapshot saved: {}", path.display());
    Ok(())
}
