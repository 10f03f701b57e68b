use thiserror::Error;

use super::TaskId;
use crate::llm::LlmError;
use crate::store::StoreError;

/// Errors raised while driving a task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {0} was aborted")]
    Aborted(TaskId),

    #[error("Task {0} was abandoned")]
    Abandoned(TaskId),

    #[error("Ask was superseded by a newer message")]
    AskSuperseded,

    #[error("Partial ask does not wait for a response")]
    AskIgnored,

    /// Programming error: something read the mode before it was resolved.
    #[error("Task mode accessed before initialization")]
    ModeNotInitialized,

    #[error("API request failed: {0}")]
    ApiRequestFailed(#[from] LlmError),

    #[error("Stream failed: {0}")]
    StreamFailed(String),

    #[error("The language model did not provide any assistant messages")]
    EmptyResponse,

    #[error("Caller declined to continue: {0}")]
    Declined(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to spawn subtask: {0}")]
    SubtaskSpawn(String),

    #[error("Task owner is no longer available")]
    ManagerUnavailable,

    #[error("Tool {tool} failed: {message}")]
    Tool { tool: String, message: String },
}

impl TaskError {
    /// Whether the error is the task being stopped rather than something going wrong.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            TaskError::Aborted(_) | TaskError::Abandoned(_) | TaskError::StreamFailed(_)
        )
    }
}
