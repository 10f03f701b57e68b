//! One API request: approval gate, context management, pacing and first-chunk retries.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use super::{retry_delay, Task, TaskError};
use crate::condense::{self, ContextDecision};
use crate::cost::TokenUsage;
use crate::llm::{ApiChunk, ApiMessage, ApiStream, LlmError, ModelClient, RequestMetadata};
use crate::messages::{AskKind, AskResponse, MessageContent, MessageDetail, SayKind};

/// Open a stream and wait for its first event.
///
/// Errors up to and including the first event are retryable; the stream is returned together
/// with that event (or `None` for an empty response).
async fn first_chunk(
    client: &dyn ModelClient,
    system_prompt: &str,
    history: &[ApiMessage],
    metadata: &RequestMetadata,
) -> Result<(ApiStream, Option<ApiChunk>), LlmError> {
    let mut stream = client.create_message(system_prompt, history, metadata).await?;
    match stream.next().await {
        Some(Ok(chunk)) => Ok((stream, Some(chunk))),
        Some(Err(e)) => Err(e),
        None => Ok((stream, None)),
    }
}

impl Task {
    /// Get a stream whose first event has arrived.
    ///
    /// First-chunk failures are retried with exponential backoff while automatic resubmission
    /// is on; otherwise the caller decides through an `api_req_failed` ask.
    pub(super) async fn attempt_api_request(
        self: &Arc<Self>,
    ) -> Result<(ApiStream, Option<ApiChunk>), TaskError> {
        self.check_approval_gate().await?;
        self.manage_context_window().await?;

        let mode = self.mode()?;
        let metadata = RequestMetadata {
            task_id: self.id(),
            mode: mode.clone(),
        };
        let system_prompt = self.ctx.tools.system_prompt(&mode, &self.ctx.config.working_dir);
        let retry = self.ctx.config.retry.clone();
        let mut attempt: u32 = 0;

        loop {
            self.ensure_running()?;

            let waited = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TaskError::Aborted(self.id())),
                waited = self.ctx.pacer.wait() => waited,
            };
            if !waited.is_zero() {
                self.say(
                    SayKind::RateLimitWait,
                    MessageContent::text(format!("Rate limiting for {:.1} seconds...", waited.as_secs_f64())),
                    None,
                )
                .await?;
            }

            let history = self.history().await;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TaskError::Aborted(self.id())),
                result = first_chunk(self.ctx.client.as_ref(), &system_prompt, &history, &metadata) => result,
            };
            let error = match result {
                Ok(opened) => return Ok(opened),
                Err(e) => e,
            };

            self.ensure_running()?;
            tracing::warn!(task_id = %self.id(), attempt, "API request failed: {}", error);

            let auto_retry = retry.auto_resubmit && retry.max_auto_retries.map_or(true, |max| attempt < max);
            if auto_retry {
                let delay = retry_delay(retry.base_delay_secs, attempt, error.retry_after);
                attempt += 1;
                self.count_down_retry(attempt, delay, &error).await?;
                continue;
            }

            let reply = self
                .ask(AskKind::ApiReqFailed, Some(error.to_string()), None)
                .await?;
            if reply.response != AskResponse::YesButtonClicked {
                return Err(TaskError::ApiRequestFailed(error));
            }
            self.say(SayKind::ApiReqRetried, MessageContent::default(), None)
                .await?;
        }
    }

    /// Show a once-per-second countdown before retry `attempt`, then a final "retrying now".
    async fn count_down_retry(&self, attempt: u32, delay_secs: u64, error: &LlmError) -> Result<(), TaskError> {
        tracing::info!(task_id = %self.id(), attempt, delay_secs, "Retrying API request");
        let detail = MessageDetail::Retry { attempt, delay_secs };

        for remaining in (1..=delay_secs).rev() {
            self.say(
                SayKind::ApiReqRetryDelayed,
                MessageContent::text(format!(
                    "{}\n\nRetry attempt {}\nRetrying in {} seconds...",
                    error, attempt, remaining
                ))
                .with_detail(MessageDetail::Retry {
                    attempt,
                    delay_secs: remaining,
                }),
                Some(true),
            )
            .await?;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TaskError::Aborted(self.id())),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }

        self.say(
            SayKind::ApiReqRetryDelayed,
            MessageContent::text(format!("{}\n\nRetry attempt {}\nRetrying now...", error, attempt))
                .with_detail(detail),
            Some(false),
        )
        .await?;
        Ok(())
    }

    /// Ask the caller once a request or cost ceiling is crossed.
    async fn check_approval_gate(&self) -> Result<(), TaskError> {
        let total_cost = self.token_usage().total_cost;
        let decision = self.with_gate(|gate| gate.check(total_cost));
        let Some(kind) = decision.ask_kind() else {
            return Ok(());
        };

        tracing::info!(task_id = %self.id(), "Auto-approval limit reached: {}", decision.describe());
        let reply = self.ask(kind, Some(decision.describe()), None).await?;
        if reply.response == AskResponse::NoButtonClicked {
            return Err(TaskError::Declined(decision.describe()));
        }
        self.with_gate(|gate| gate.reset(total_cost));
        Ok(())
    }

    /// Condense or truncate the history when the next request would not fit.
    async fn manage_context_window(&self) -> Result<(), TaskError> {
        let history = self.history().await;
        let metadata = RequestMetadata {
            task_id: self.id(),
            mode: self.mode()?,
        };
        let model = self.ctx.client.model_info();
        let decision = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TaskError::Aborted(self.id())),
            decision = condense::manage_context(
                &history,
                self.last_context_tokens(),
                &self.ctx.config.context,
                &model,
                self.ctx.client.as_ref(),
                &self.ctx.pacer,
                &metadata,
            ) => decision,
        };

        let (outcome, error) = match decision {
            ContextDecision::Unchanged { error } => (None, error),
            ContextDecision::Replaced { outcome, error } => (Some(outcome), error),
        };

        if let Some(error) = error {
            tracing::warn!(task_id = %self.id(), "Context condensation failed: {}", error);
            self.say(SayKind::CondenseContextError, MessageContent::text(error), None)
                .await?;
        }

        let Some(outcome) = outcome else {
            return Ok(());
        };

        tracing::info!(
            task_id = %self.id(),
            strategy = ?outcome.strategy,
            prev_tokens = outcome.prev_context_tokens,
            new_tokens = outcome.new_context_tokens,
            "Context window reduced"
        );
        self.overwrite_history(outcome.messages).await?;
        if outcome.cost > 0.0 {
            self.add_usage(&TokenUsage::default().with_cost(outcome.cost));
        }
        self.set_last_context_tokens(outcome.new_context_tokens);
        self.say(
            SayKind::CondenseContext,
            MessageContent::default().with_detail(MessageDetail::Condense {
                cost: outcome.cost,
                prev_context_tokens: outcome.prev_context_tokens,
                new_context_tokens: outcome.new_context_tokens,
                summary: outcome.summary,
            }),
            None,
        )
        .await?;
        Ok(())
    }
}
