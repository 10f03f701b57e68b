//! Lifecycle notifications from a task to its owner.

use serde::Serialize;
use tokio::sync::oneshot;

use super::{InstanceId, Mode, TaskError, TaskId, ToolUsage};
use crate::cost::TokenUsage;
use crate::messages::DisplayMessage;

/// Why a task stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The caller cancelled; the owner rebuilds the task from its history
    UserCancelled,
    /// The response stream broke after its first chunk; the owner rebuilds the task
    StreamingFailed,
    /// The task was replaced or discarded and must not touch shared state again
    Abandoned,
    /// The loop failed for good
    Failed,
}

/// What a task reports about itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Started,
    Completed {
        result: String,
        token_usage: TokenUsage,
        tool_usage: ToolUsage,
    },
    Aborted {
        reason: AbortReason,
    },
    Focused,
    Unfocused,
    /// A blocking ask was answered
    Active,
    /// A blocking ask is pending
    Idle,
    Paused,
    Unpaused,
    Spawned {
        child_id: TaskId,
    },
    ToolFailed {
        tool: String,
        error: String,
    },
    TokenUsageUpdated {
        usage: TokenUsage,
    },
    /// A display message was created or updated
    Message {
        message: DisplayMessage,
    },
}

/// Events fanned out by the engine to its subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub task_id: TaskId,
    pub instance_id: InstanceId,
    pub event: TaskEvent,
}

/// Everything a task sends to its owner.
#[derive(Debug)]
pub enum TaskSignal {
    Event(TaskEvent),
    /// Ask the owner to pause this task and start a subtask under it
    SpawnSubtask {
        message: String,
        mode: Option<Mode>,
        reply: oneshot::Sender<Result<TaskId, TaskError>>,
    },
}
