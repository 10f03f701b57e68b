//! `new_task`: delegates work to a subtask and pauses until it completes.

use async_trait::async_trait;

use super::{Tool, ToolCall, ToolContext, ToolOutcome, ToolParam};
use crate::task::{Mode, TaskError};

const PARAMETERS: &[ToolParam] = &[
    ToolParam::required("mode", "Slug of the mode the subtask starts in (e.g. \"code\", \"ask\")."),
    ToolParam::required("message", "Initial instructions for the subtask."),
];

pub struct NewTask;

#[async_trait]
impl Tool for NewTask {
    fn name(&self) -> &str {
        "new_task"
    }

    fn description(&self) -> &str {
        "Create a subtask with its own conversation. This task pauses until the subtask completes and then receives the subtask's result."
    }

    fn parameters(&self) -> &[ToolParam] {
        PARAMETERS
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome, TaskError> {
        let mode = Mode::new(call.params.non_empty("mode").unwrap_or_default().trim());
        let message = call.params.non_empty("message").unwrap_or_default().to_string();

        match ctx.task.spawn_subtask(message.clone(), Some(mode.clone())).await {
            Ok(child_id) => {
                tracing::info!(task_id = %ctx.task.id(), child_id = %child_id, "Subtask created");
                Ok(ToolOutcome::Output(format!(
                    "Successfully created new task in {} mode with message: {}",
                    mode, message
                )))
            }
            Err(TaskError::SubtaskSpawn(reason)) => Ok(ToolOutcome::Failed(format!(
                "Failed to create subtask: {}",
                reason
            ))),
            Err(e) => Err(e),
        }
    }
}
