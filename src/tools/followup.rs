//! `ask_followup_question`: asks the caller for missing information.

use async_trait::async_trait;

use super::{Tool, ToolCall, ToolContext, ToolOutcome, ToolParam};
use crate::messages::{AskKind, MessageContent, SayKind};
use crate::task::TaskError;

const PARAMETERS: &[ToolParam] = &[ToolParam::required(
    "question",
    "A clear, specific question addressing the information you need.",
)];

pub struct AskFollowupQuestion;

#[async_trait]
impl Tool for AskFollowupQuestion {
    fn name(&self) -> &str {
        "ask_followup_question"
    }

    fn description(&self) -> &str {
        "Ask the user a question to gather information needed to complete the task. Use only when the answer cannot be found with other tools."
    }

    fn parameters(&self) -> &[ToolParam] {
        PARAMETERS
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome, TaskError> {
        let question = call.params.non_empty("question").unwrap_or_default();
        let reply = ctx
            .task
            .ask(AskKind::Followup, Some(question.to_string()), None)
            .await?;

        let answer = reply.text.clone().unwrap_or_default();
        ctx.task
            .say(
                SayKind::UserFeedback,
                MessageContent::text(answer.clone()).with_images(reply.images.clone()),
                None,
            )
            .await?;

        Ok(ToolOutcome::Output(format!("<answer>\n{}\n</answer>", answer)))
    }
}
