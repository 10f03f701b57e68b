//! The recursive request loop, unrolled into iteration.
//!
//! Each turn: check the mistake counter, wait out a running subtask, append environment
//! details, send the request, present the streamed response block by block (running at most
//! one tool), and feed the tool results into the next turn.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::oneshot;

use super::{AbortReason, EnvironmentDetails, Task, TaskError, TaskEvent};
use crate::cost::TokenUsage;
use crate::llm::{ApiChunk, ApiMessage, ApiStream, ContentBlock, Role};
use crate::messages::{
    AskKind, AskResponse, CancelReason, MessageContent, MessageDetail, MessageKind, SayKind,
};
use crate::tools::parser::{display_text, finalize_blocks, parse_assistant_message};
use crate::tools::{format_feedback, AssistantBlock, RepetitionCheck, ToolCall, ToolContext, ToolOutcome, ToolUseBlock};

pub(super) const RESUMPTION_NOTICE: &str = "[TASK RESUMPTION] This task was interrupted. It may or may not be complete, so please reassess the task context. Be aware that the project state may have changed since then. If the task has not been completed, retry the last step before interruption and proceed with completing the task.";

pub(super) const INTERRUPTED_TOOL_RESULT: &str =
    "Task was interrupted before this tool call could be completed.";

const NO_TOOLS_USED: &str = "[ERROR] You did not use a tool in your previous response! Please retry with a tool use.

# Reminder: Instructions for Tool Use

Tool uses are formatted using XML-style tags. The tool name is enclosed in opening and closing tags, and each parameter is similarly enclosed within its own set of tags.

# Next Steps

If you have completed the user's task, use the attempt_completion tool.
If you require additional information from the user, use the ask_followup_question tool.
Otherwise, if you have not completed the task and do not need additional information, then proceed with the next step of the task.
(This is an automated message, so do not respond to it conversationally.)";

const MISTAKE_GUIDANCE: &str = "This may indicate a failure in the model's thought process or inability to use a tool properly, which can be mitigated with some user guidance (e.g. \"Try breaking down the task into smaller steps\").";

/// What one streamed response produced.
#[derive(Default)]
struct Turn {
    /// Blocks recorded as the assistant message
    assistant_blocks: Vec<ContentBlock>,
    /// Content for the next user message
    results: Vec<ContentBlock>,
    /// Number of parsed blocks already presented
    presented: usize,
    did_use_tool: bool,
    did_reject: bool,
    modified_workspace: bool,
    completion: Option<String>,
}

impl Turn {
    fn push_result(&mut self, tool_use_id: &str, content: impl Into<String>, is_error: bool) {
        self.results.push(ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: content.into(),
            is_error,
        });
    }

    fn is_done_presenting(&self) -> bool {
        self.did_use_tool || self.did_reject
    }
}

enum StreamEnd {
    Finished,
    /// A tool ran or was rejected; the rest of the response is not presented
    ToolUsed,
    Cancelled,
    Failed(String),
}

impl Task {
    pub(super) async fn run_loop(
        self: &Arc<Self>,
        mut user_content: Vec<ContentBlock>,
    ) -> Result<String, TaskError> {
        let mut include_file_details = true;

        loop {
            self.ensure_running()?;
            let mode = self.mode()?;

            self.check_mistake_limit(&mut user_content).await?;

            if let Some(result) = self.wait_for_resume().await? {
                self.say(SayKind::SubtaskResult, MessageContent::text(result.clone()), None)
                    .await?;
                user_content.push(ContentBlock::text(format!(
                    "[new_task completed] Result: {}",
                    result
                )));
            }

            let details = EnvironmentDetails::collect(
                &self.ctx.config.working_dir,
                mode,
                &self.token_usage(),
                self.last_context_tokens(),
                include_file_details,
            )
            .await;
            include_file_details = false;
            user_content.push(ContentBlock::text(details.format()));
            self.add_to_history(ApiMessage::user(std::mem::take(&mut user_content)))
                .await?;

            let api_req_ts = self
                .say(
                    SayKind::ApiReqStarted,
                    MessageContent::default().with_detail(MessageDetail::ApiRequest {
                        usage: TokenUsage::default(),
                        cancel_reason: None,
                        streaming_failed_message: None,
                    }),
                    None,
                )
                .await?;

            let turn = self.stream_turn(api_req_ts).await?;

            if turn.assistant_blocks.is_empty() {
                self.say(
                    SayKind::Error,
                    MessageContent::text(
                        "Unexpected API Response: The language model did not provide any assistant messages. This may indicate an issue with the API or the model's output.",
                    ),
                    None,
                )
                .await?;
                self.add_to_history(ApiMessage::assistant_text("Failure: I did not provide a response."))
                    .await?;
                return Err(TaskError::EmptyResponse);
            }

            self.add_to_history(ApiMessage::assistant(turn.assistant_blocks))
                .await?;

            if let Some(result) = turn.completion {
                return Ok(result);
            }

            if turn.modified_workspace && self.ctx.config.checkpoints_enabled {
                self.save_checkpoint().await?;
            }

            if turn.did_use_tool || turn.did_reject {
                user_content = turn.results;
            } else {
                let mistakes = self.increment_mistakes();
                tracing::debug!(task_id = %self.id(), mistakes, "Response used no tool");
                user_content = vec![ContentBlock::text(NO_TOOLS_USED)];
            }
        }
    }

    /// Ask the caller for guidance once too many mistakes happened in a row.
    async fn check_mistake_limit(&self, user_content: &mut Vec<ContentBlock>) -> Result<(), TaskError> {
        let limit = self.ctx.config.mistake_limit;
        if limit == 0 || self.consecutive_mistakes() < limit {
            return Ok(());
        }

        tracing::warn!(task_id = %self.id(), limit, "Consecutive mistake limit reached");
        let reply = self
            .ask(AskKind::MistakeLimitReached, Some(MISTAKE_GUIDANCE.to_string()), None)
            .await?;

        let feedback = match reply.response {
            AskResponse::MessageResponse => reply.feedback(),
            AskResponse::YesButtonClicked | AskResponse::NoButtonClicked => None,
        };
        let Some(feedback) = feedback else {
            return Err(TaskError::Declined("consecutive mistake limit reached".to_string()));
        };
        self.say(
            SayKind::UserFeedback,
            MessageContent::text(feedback).with_images(reply.images.clone()),
            None,
        )
        .await?;
        user_content.push(ContentBlock::text(format!(
            "You seem to be having trouble proceeding. The user has provided the following feedback to help guide you:\n{}",
            format_feedback(feedback)
        )));
        user_content.extend(
            reply
                .images
                .iter()
                .filter_map(|url| ContentBlock::image_from_data_url(url)),
        );

        self.reset_mistakes();
        Ok(())
    }

    /// Send the request and present its response.
    async fn stream_turn(self: &Arc<Self>, api_req_ts: i64) -> Result<Turn, TaskError> {
        let (mut stream, first_chunk) = self.attempt_api_request().await?;
        let grammar = self.ctx.tools.grammar();

        let mut turn = Turn::default();
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut reasoning_open = false;
        let mut usage = TokenUsage::default();
        let mut next = first_chunk;

        let streaming = self.streaming_guard();
        let end = loop {
            let item = match next.take() {
                Some(chunk) => Some(Ok(chunk)),
                None => tokio::select! {
                    _ = self.cancel.cancelled() => break StreamEnd::Cancelled,
                    item = stream.next() => item,
                },
            };

            match item {
                None => break StreamEnd::Finished,
                Some(Err(e)) => break StreamEnd::Failed(e.to_string()),
                Some(Ok(ApiChunk::Usage(chunk_usage))) => usage.add(&chunk_usage),
                Some(Ok(ApiChunk::Reasoning(delta))) => {
                    reasoning.push_str(&delta);
                    reasoning_open = true;
                    self.say(SayKind::Reasoning, MessageContent::text(reasoning.clone()), Some(true))
                        .await?;
                }
                Some(Ok(ApiChunk::Text(delta))) => {
                    if reasoning_open {
                        reasoning_open = false;
                        self.say(SayKind::Reasoning, MessageContent::text(reasoning.clone()), Some(false))
                            .await?;
                    }
                    text.push_str(&delta);
                    let blocks = parse_assistant_message(&text, &grammar);
                    self.present_blocks(&blocks, &mut turn).await?;
                    if turn.is_done_presenting() {
                        break StreamEnd::ToolUsed;
                    }
                }
            }
        };

        if reasoning_open && !matches!(end, StreamEnd::Cancelled) {
            self.say(SayKind::Reasoning, MessageContent::text(reasoning), Some(false))
                .await?;
        }

        match end {
            StreamEnd::Finished => {
                let mut blocks = parse_assistant_message(&text, &grammar);
                finalize_blocks(&mut blocks);
                self.present_blocks(&blocks, &mut turn).await?;
                self.record_request_usage(api_req_ts, usage).await;
            }
            StreamEnd::ToolUsed => {
                self.drain_usage_in_background(stream, usage, api_req_ts);
            }
            StreamEnd::Cancelled => {
                self.record_interruption(api_req_ts, &text, usage, CancelReason::UserCancelled, None)
                    .await;
                return Err(TaskError::Aborted(self.id()));
            }
            StreamEnd::Failed(message) => {
                tracing::warn!(task_id = %self.id(), "Response stream failed: {}", message);
                self.record_interruption(
                    api_req_ts,
                    &text,
                    usage,
                    CancelReason::StreamingFailed,
                    Some(message.clone()),
                )
                .await;
                self.abort_with(AbortReason::StreamingFailed).await;
                return Err(TaskError::StreamFailed(message));
            }
        }

        drop(streaming);
        Ok(turn)
    }

    /// Present parsed blocks in order, starting after the ones already shown.
    ///
    /// Partial blocks update the display; a complete tool block runs the tool. Nothing after
    /// the first tool is presented.
    async fn present_blocks(
        self: &Arc<Self>,
        blocks: &[AssistantBlock],
        turn: &mut Turn,
    ) -> Result<(), TaskError> {
        while let Some(block) = blocks.get(turn.presented) {
            if turn.is_done_presenting() {
                break;
            }

            match block {
                AssistantBlock::Text { content, partial } => {
                    let shown = display_text(content, *partial);
                    if !shown.is_empty() {
                        self.say(SayKind::Text, MessageContent::text(shown), Some(*partial))
                            .await?;
                    }
                    if !partial && !content.trim().is_empty() {
                        turn.assistant_blocks.push(ContentBlock::text(content.trim()));
                    }
                }
                AssistantBlock::ToolUse(tool) => {
                    let display = MessageContent::text(tool.name.clone()).with_detail(MessageDetail::Tool {
                        tool: tool.name.clone(),
                        params: tool.params.to_vec(),
                    });
                    self.say(SayKind::Tool, display, Some(tool.partial)).await?;
                    if !tool.partial {
                        self.execute_tool(tool, turn).await?;
                    }
                }
            }

            if block.is_partial() {
                break;
            }
            turn.presented += 1;
        }
        Ok(())
    }

    /// Validate and run one complete tool block.
    async fn execute_tool(self: &Arc<Self>, block: &ToolUseBlock, turn: &mut Turn) -> Result<(), TaskError> {
        let call = ToolCall {
            id: self.next_tool_use_id(),
            name: block.name.clone(),
            params: block.params.clone(),
        };
        turn.assistant_blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.params.to_json(),
        });
        turn.did_use_tool = true;
        self.record_tool_attempt(&call.name);

        let Some(tool) = self.ctx.tools.get(&call.name) else {
            self.increment_mistakes();
            self.tool_failed(turn, &call, format!("Unknown tool: {}", call.name));
            return Ok(());
        };

        let missing = tool
            .parameters()
            .iter()
            .find(|p| p.required && call.params.non_empty(p.name).is_none());
        if let Some(param) = missing {
            self.increment_mistakes();
            self.say(
                SayKind::Error,
                MessageContent::text(format!(
                    "Tried to use {} without value for required parameter '{}'. Retrying...",
                    call.name, param.name
                )),
                None,
            )
            .await?;
            self.tool_failed(
                turn,
                &call,
                format!(
                    "Missing value for required parameter '{}'. Please retry with complete response.",
                    param.name
                ),
            );
            return Ok(());
        }

        if let RepetitionCheck::LimitReached { tool: name } = self.with_repetition(|d| d.check(block)) {
            self.increment_mistakes();
            let reply = self
                .ask(
                    AskKind::MistakeLimitReached,
                    Some(format!("Repeated identical calls to {} were stopped.", name)),
                    None,
                )
                .await?;
            if let Some(feedback) = reply.feedback() {
                self.say(SayKind::UserFeedback, MessageContent::text(feedback), None)
                    .await?;
                turn.results.push(ContentBlock::text(format_feedback(feedback)));
            }
            self.tool_failed(
                turn,
                &call,
                format!(
                    "Tool call repetition limit reached for {}. Please try a different approach.",
                    name
                ),
            );
            return Ok(());
        }

        tracing::debug!(task_id = %self.id(), tool = %call.name, "Executing tool");
        let ctx = ToolContext {
            task: self,
            working_dir: &self.ctx.config.working_dir,
        };
        let outcome = match tool.execute(&call, &ctx).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_abort() || self.is_aborted() => return Err(e),
            Err(e) => ToolOutcome::Failed(e.to_string()),
        };

        match outcome {
            ToolOutcome::Output(output) => {
                self.reset_mistakes();
                if tool.modifies_workspace() {
                    turn.modified_workspace = true;
                }
                turn.push_result(&call.id, output, false);
            }
            ToolOutcome::Failed(message) => {
                self.say(SayKind::Error, MessageContent::text(message.clone()), None)
                    .await?;
                self.tool_failed(turn, &call, message);
            }
            ToolOutcome::Rejected { feedback } => {
                turn.did_reject = true;
                let content = match feedback {
                    Some(feedback) => format!(
                        "The user denied this operation and provided the following feedback:\n{}",
                        format_feedback(&feedback)
                    ),
                    None => "The user denied this operation.".to_string(),
                };
                turn.push_result(&call.id, content, true);
            }
            ToolOutcome::Completed { result } => {
                turn.completion = Some(result);
            }
        }
        Ok(())
    }

    fn tool_failed(&self, turn: &mut Turn, call: &ToolCall, message: String) {
        tracing::debug!(task_id = %self.id(), tool = %call.name, "Tool failed: {}", message);
        self.record_tool_failure(&call.name);
        self.emit(TaskEvent::ToolFailed {
            tool: call.name.clone(),
            error: message.clone(),
        });
        turn.push_result(
            &call.id,
            format!("The tool execution failed with the following error:\n<error>\n{}\n</error>", message),
            true,
        );
    }

    /// Record a response that ended early, annotating what the model had said so far.
    async fn record_interruption(
        &self,
        api_req_ts: i64,
        text: &str,
        usage: TokenUsage,
        reason: CancelReason,
        failure: Option<String>,
    ) {
        self.with_messages(|log| {
            log.set_detail(
                api_req_ts,
                MessageDetail::ApiRequest {
                    usage: usage.clone(),
                    cancel_reason: Some(reason),
                    streaming_failed_message: failure,
                },
            );
            log.pop_trailing_while(|m| m.is_partial() && matches!(m.kind, MessageKind::Say(SayKind::Reasoning)));
        });
        if usage.has_usage() {
            self.add_usage(&usage);
        }

        let note = match reason {
            CancelReason::UserCancelled => "[Response interrupted by user]",
            CancelReason::StreamingFailed => "[Response interrupted by API Error]",
        };
        let content = if text.trim().is_empty() {
            note.to_string()
        } else {
            format!("{}\n\n{}", text, note)
        };
        if let Err(e) = self.add_to_history(ApiMessage::assistant_text(content)).await {
            tracing::debug!(task_id = %self.id(), "Interrupted response not recorded: {}", e);
        }
        self.save_messages().await;
    }

    /// Record the usage of a finished request on its `api_req_started` message.
    pub(super) async fn record_request_usage(&self, api_req_ts: i64, usage: TokenUsage) {
        if self.is_abandoned() {
            return;
        }
        self.with_messages(|log| {
            log.set_detail(
                api_req_ts,
                MessageDetail::ApiRequest {
                    usage: usage.clone(),
                    cancel_reason: None,
                    streaming_failed_message: None,
                },
            )
        });
        if usage.has_usage() {
            self.add_usage(&usage);
        }
        self.save_messages().await;
        self.save_history_item().await;
    }

    /// Keep reading the rest of a response for its usage after a tool ended the turn.
    ///
    /// Bounded by the configured timeout; on timeout the request records no further usage.
    fn drain_usage_in_background(self: &Arc<Self>, mut stream: ApiStream, collected: TokenUsage, api_req_ts: i64) {
        let task = Arc::downgrade(self);
        let task_id = self.id();
        let timeout = self.ctx.config.usage_drain_timeout;
        let (done_tx, done_rx) = oneshot::channel();
        self.track_usage_drain(done_rx);

        let handle = tokio::spawn(async move {
            let mut trailing = TokenUsage::default();
            let drained = tokio::time::timeout(timeout, async {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(ApiChunk::Usage(usage)) => trailing.add(&usage),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(task_id = %task_id, "Usage drain stopped: {}", e);
                            break;
                        }
                    }
                }
            })
            .await;

            let mut usage = collected;
            match drained {
                Ok(()) => usage.add(&trailing),
                Err(_) => {
                    tracing::warn!(task_id = %task_id, "Timed out waiting for usage after tool use")
                }
            }
            if let Some(task) = task.upgrade() {
                task.record_request_usage(api_req_ts, usage).await;
            }
            let _ = done_tx.send(());
        });
        self.resources().register(Box::new(handle));
    }

    async fn save_checkpoint(&self) -> Result<(), TaskError> {
        match self.ctx.checkpoints.save(self.id(), false).await {
            Ok(Some(reference)) => {
                self.say(
                    SayKind::CheckpointSaved,
                    MessageContent::text(reference.clone())
                        .with_detail(MessageDetail::Checkpoint { reference }),
                    None,
                )
                .await?;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(task_id = %self.id(), "Checkpoint failed: {}", e),
        }
        Ok(())
    }
}

/// Prepare a persisted history for resumption.
///
/// A trailing user message is taken off the history and carried into the next turn, minus
/// the environment details and resumption notices it was decorated with and minus tool
/// results that answer nothing. Tool calls of the last assistant message that never got a
/// result are answered with an interruption notice.
pub(super) fn reconcile_history(mut history: Vec<ApiMessage>) -> (Vec<ApiMessage>, Vec<ContentBlock>) {
    let mut carried = Vec::new();
    if history.last().is_some_and(|m| m.role == Role::User) {
        if let Some(last) = history.pop() {
            carried = last.content;
        }
    }

    let tool_use_ids: Vec<String> = history
        .last()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| {
            m.content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    carried.retain(|block| match block {
        ContentBlock::Text { text } => {
            !text.starts_with("<environment_details>") && !text.starts_with("[TASK RESUMPTION]")
        }
        ContentBlock::ToolResult { tool_use_id, .. } => tool_use_ids.contains(tool_use_id),
        _ => true,
    });

    for id in &tool_use_ids {
        let answered = carried.iter().any(|block| {
            matches!(block, ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == id)
        });
        if !answered {
            carried.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: INTERRUPTED_TOOL_RESULT.to_string(),
                is_error: true,
            });
        }
    }

    (history, carried)
}
