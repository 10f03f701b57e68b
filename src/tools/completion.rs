//! `attempt_completion`: ends the task with a final result.

use async_trait::async_trait;

use super::{format_feedback, Tool, ToolCall, ToolContext, ToolOutcome, ToolParam};
use crate::messages::{AskKind, AskResponse, MessageContent, SayKind};
use crate::task::TaskError;

const PARAMETERS: &[ToolParam] = &[ToolParam::required(
    "result",
    "The final result of the task. Formulate it so it is final and does not require further input.",
)];

pub struct AttemptCompletion;

#[async_trait]
impl Tool for AttemptCompletion {
    fn name(&self) -> &str {
        "attempt_completion"
    }

    fn description(&self) -> &str {
        "Present the result of your work once the task is complete. A subtask hands this result back to the task that created it."
    }

    fn parameters(&self) -> &[ToolParam] {
        PARAMETERS
    }

    /// Subtasks finish immediately. A root task waits for the caller to accept the result;
    /// feedback instead of acceptance sends the task back to work.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome, TaskError> {
        let result = call.params.non_empty("result").unwrap_or_default().to_string();
        ctx.task
            .say(SayKind::CompletionResult, MessageContent::text(result.clone()), None)
            .await?;

        if ctx.task.has_parent() {
            return Ok(ToolOutcome::Completed { result });
        }

        let reply = ctx
            .task
            .ask(AskKind::CompletionResult, Some(String::new()), None)
            .await?;

        match (reply.response, reply.feedback()) {
            (AskResponse::MessageResponse, Some(feedback)) => {
                ctx.task
                    .say(
                        SayKind::UserFeedback,
                        MessageContent::text(feedback).with_images(reply.images.clone()),
                        None,
                    )
                    .await?;
                Ok(ToolOutcome::Output(format!(
                    "The user has provided feedback on the results. Consider their input to continue the task, and then attempt completion again.\n{}",
                    format_feedback(feedback)
                )))
            }
            _ => Ok(ToolOutcome::Completed { result }),
        }
    }
}
