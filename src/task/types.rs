//! Identity, mode and history-record types shared by tasks and their owners.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cost::TokenUsage;

/// Unique identifier for a task.
///
/// # Properties
/// - Globally unique within an engine
/// - Shared by every re-construction of the same task (see [`InstanceId`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Distinguishes two in-memory constructions of the same [`TaskId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution mode slug such as `code`, `architect` or `ask`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(String);

impl Mode {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self("code".to_string())
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The caller-side "current mode" a task inherits when no explicit mode is given.
///
/// The user stack shares one of these; every agent root group owns its own.
#[derive(Debug)]
pub struct ModeState {
    current: RwLock<Mode>,
}

impl ModeState {
    pub fn new(mode: Mode) -> Self {
        Self {
            current: RwLock::new(mode),
        }
    }

    pub fn get(&self) -> Mode {
        match self.current.read() {
            Ok(mode) => mode.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, mode: Mode) {
        match self.current.write() {
            Ok(mut current) => *current = mode,
            Err(poisoned) => *poisoned.into_inner() = mode,
        }
    }
}

/// Who started a task tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    #[default]
    User,
    Agent,
}

/// Marks a task as owned by the agent pool instead of the user stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundContext {
    /// Free-form label of the automated caller, used in logs
    pub caller: String,
}

impl BackgroundContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
        }
    }
}

/// Coarse status stored on the history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    #[default]
    Active,
    Completed,
    Aborted,
}

/// Attempts and failures of one tool within a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStats {
    pub attempts: u32,
    pub failures: u32,
}

pub type ToolUsage = HashMap<String, ToolStats>;

/// Persisted summary of a task, enough to list it and to reconstruct it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: TaskId,
    /// Position in the owning stack when the task was created (1-based)
    pub number: u32,
    /// Creation time, milliseconds since the epoch
    pub ts: i64,
    /// Last update time, milliseconds since the epoch
    pub updated_ts: i64,
    /// Initial task text
    pub task: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    pub total_cost: f64,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<TaskId>,
    pub source: TaskSource,
    #[serde(default)]
    pub status: HistoryStatus,
}

impl HistoryItem {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.tokens_in,
            output_tokens: self.tokens_out,
            cache_write_tokens: self.cache_writes,
            cache_read_tokens: self.cache_reads,
            total_cost: self.total_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_round_trips_through_string() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_mode_state_is_shared_and_mutable() {
        let state = ModeState::new(Mode::new("architect"));
        assert_eq!(state.get(), Mode::new("architect"));
        state.set(Mode::new("code"));
        assert_eq!(state.get().as_str(), "code");
    }

    #[test]
    fn test_history_item_json_shape() {
        let root = TaskId::new();
        let item = HistoryItem {
            id: TaskId::new(),
            number: 2,
            ts: 1,
            updated_ts: 2,
            task: "fix the bug".to_string(),
            tokens_in: 10,
            tokens_out: 5,
            cache_writes: 0,
            cache_reads: 3,
            total_cost: 0.01,
            mode: Mode::new("debug"),
            parent_id: Some(root),
            root_id: Some(root),
            source: TaskSource::Agent,
            status: HistoryStatus::Completed,
        };

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["source"], "agent");
        assert_eq!(value["mode"], "debug");
        assert_eq!(value["root_id"], root.to_string());

        let back: HistoryItem = serde_json::from_value(value).unwrap();
        assert_eq!(back, item);
        assert_eq!(back.usage().cache_read_tokens, 3);
    }
}
