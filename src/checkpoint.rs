//! Workspace checkpoints.
//!
//! The engine only decides *when* to checkpoint (at most once per turn that ran a
//! workspace-modifying tool); snapshot storage belongs to the implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::task::TaskId;

#[async_trait]
pub trait CheckpointService: Send + Sync {
    /// Snapshot the workspace. Returns the new reference, or `None` when nothing changed
    /// and `force` is false.
    async fn save(&self, task_id: TaskId, force: bool) -> anyhow::Result<Option<String>>;

    async fn restore(&self, task_id: TaskId, reference: &str) -> anyhow::Result<()>;

    /// Human-readable diff between two references.
    async fn diff(&self, task_id: TaskId, from: &str, to: &str) -> anyhow::Result<String>;
}

/// Checkpointing turned off.
#[derive(Debug, Default)]
pub struct NoopCheckpoints;

#[async_trait]
impl CheckpointService for NoopCheckpoints {
    async fn save(&self, _task_id: TaskId, _force: bool) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn restore(&self, _task_id: TaskId, _reference: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn diff(&self, _task_id: TaskId, _from: &str, _to: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Keeps an ordered list of references per task without touching the filesystem.
#[derive(Debug, Default)]
pub struct RecordingCheckpoints {
    saves: Mutex<HashMap<TaskId, Vec<String>>>,
}

impl RecordingCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self, task_id: TaskId) -> Vec<String> {
        self.saves
            .lock()
            .map(|saves| saves.get(&task_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointService for RecordingCheckpoints {
    async fn save(&self, task_id: TaskId, _force: bool) -> anyhow::Result<Option<String>> {
        let mut saves = self
            .saves
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint registry poisoned"))?;
        let refs = saves.entry(task_id).or_default();
        let reference = format!("checkpoint-{}", refs.len() + 1);
        refs.push(reference.clone());
        Ok(Some(reference))
    }

    async fn restore(&self, task_id: TaskId, reference: &str) -> anyhow::Result<()> {
        if self.saved(task_id).iter().any(|r| r == reference) {
            Ok(())
        } else {
            anyhow::bail!("unknown checkpoint {} for task {}", reference, task_id)
        }
    }

    async fn diff(&self, task_id: TaskId, from: &str, to: &str) -> anyhow::Result<String> {
        let saved = self.saved(task_id);
        let position = |r: &str| saved.iter().position(|s| s == r);
        match (position(from), position(to)) {
            (Some(a), Some(b)) => Ok(format!("{} checkpoint(s) between {} and {}", b.abs_diff(a), from, to)),
            _ => anyhow::bail!("unknown checkpoint range {}..{}", from, to),
        }
    }
}
