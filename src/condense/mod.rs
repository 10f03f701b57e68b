//! Context window management.
//!
//! Before each request the task asks [`manage_context`] whether the history still fits. When
//! it does not, the history is either summarized into a synthetic summary turn or truncated
//! with a sliding window. Either way the caller receives a complete replacement history and
//! swaps it in as one operation.
//!
//! # Invariants
//! - The first message (the original task) always survives.
//! - Truncation removes an even number of messages, preserving role alternation.
//! - A summary never replaces history with something larger than what it summarized.

use futures::StreamExt;

use crate::config::ContextSettings;
use crate::llm::{ApiChunk, ApiMessage, ContentBlock, ModelClient, ModelInfo, RequestMetadata, Role};
use crate::task::RequestPacer;

/// Share of the context window kept free as a safety margin.
pub const TOKEN_BUFFER_PERCENTAGE: f64 = 0.1;

/// Trailing messages kept verbatim by summarization.
pub const MESSAGES_TO_KEEP: usize = 3;

const SUMMARY_PROMPT: &str = "You are a helpful assistant tasked with summarizing a conversation \
between a user and a coding agent. Produce a detailed summary covering: the user's explicit \
requests and intent, key technical concepts, files and code sections touched, problems solved, \
pending tasks, and the exact work in progress with the next step. Output only the summary.";

const SUMMARY_REQUEST: &str =
    "Summarize the conversation so far, as described in the prompt instructions.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondenseStrategy {
    Truncate,
    Summarize,
}

/// A replacement history plus the bookkeeping the task records about it.
#[derive(Debug, Clone)]
pub struct CondenseOutcome {
    pub messages: Vec<ApiMessage>,
    pub strategy: CondenseStrategy,
    pub prev_context_tokens: u64,
    pub new_context_tokens: u64,
    /// Cost of the summarization request in USD
    pub cost: f64,
    pub summary: Option<String>,
}

/// What [`manage_context`] decided.
#[derive(Debug, Clone)]
pub enum ContextDecision {
    /// Keep the history as is. Carries the summarization error, if one was attempted.
    Unchanged { error: Option<String> },
    Replaced {
        outcome: CondenseOutcome,
        /// A summarization failure that led to falling back on truncation
        error: Option<String>,
    },
}

/// Estimate tokens for a slice of messages at roughly four characters per token.
pub fn estimate_tokens(messages: &[ApiMessage]) -> u64 {
    let chars: usize = messages
        .iter()
        .flat_map(|m| m.content.iter())
        .map(ContentBlock::char_len)
        .sum();
    (chars as u64).div_ceil(4)
}

/// Drop a fraction of the conversation after the first message.
///
/// The number removed is rounded down to an even count so user/assistant alternation holds.
pub fn truncate_conversation(messages: &[ApiMessage], frac_to_remove: f64) -> Vec<ApiMessage> {
    let Some(first) = messages.first() else {
        return Vec::new();
    };
    let raw = ((messages.len() - 1) as f64 * frac_to_remove.clamp(0.0, 1.0)).floor() as usize;
    let to_remove = raw - raw % 2;

    let mut truncated = Vec::with_capacity(messages.len() - to_remove);
    truncated.push(first.clone());
    truncated.extend(messages.iter().skip(to_remove + 1).cloned());
    detach_orphan_results(&mut truncated);
    truncated
}

/// Turn tool results whose call is no longer in the history into plain text.
fn detach_orphan_results(messages: &mut [ApiMessage]) {
    let mut known_ids = std::collections::HashSet::new();
    for message in messages.iter_mut() {
        for block in message.content.iter_mut() {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    known_ids.insert(id.clone());
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } if !known_ids.contains(tool_use_id.as_str()) => {
                    *block = ContentBlock::text(format!("[earlier tool result] {}", content));
                }
                _ => {}
            }
        }
    }
}

/// Summarize everything but the first and the last [`MESSAGES_TO_KEEP`] messages.
pub async fn summarize_conversation(
    messages: &[ApiMessage],
    client: &dyn ModelClient,
    pacer: &RequestPacer,
    metadata: &RequestMetadata,
    prev_context_tokens: u64,
) -> Result<CondenseOutcome, String> {
    if messages.len() <= MESSAGES_TO_KEEP + 1 {
        return Err("Not enough messages to condense".to_string());
    }
    let split = messages.len() - MESSAGES_TO_KEEP;
    let keep = &messages[split..];
    if keep.iter().any(|m| m.is_summary) {
        return Err("Context was condensed recently; skipping".to_string());
    }

    let mut request: Vec<ApiMessage> = messages[..split].to_vec();
    if request.last().map(|m| m.role) == Some(Role::User) {
        request.push(ApiMessage::assistant_text("Understood."));
    }
    request.push(ApiMessage::user_text(SUMMARY_REQUEST));

    pacer.wait().await;
    let mut stream = client
        .create_message(SUMMARY_PROMPT, &request, metadata)
        .await
        .map_err(|e| format!("Summarization request failed: {}", e))?;

    let mut summary = String::new();
    let mut cost = 0.0;
    while let Some(chunk) = stream.next().await {
        match chunk.map_err(|e| format!("Summarization stream failed: {}", e))? {
            ApiChunk::Text(text) => summary.push_str(&text),
            ApiChunk::Usage(usage) => cost += usage.total_cost,
            ApiChunk::Reasoning(_) => {}
        }
    }

    let summary = summary.trim().to_string();
    if summary.is_empty() {
        return Err("Summarization produced no text".to_string());
    }

    let mut condensed = Vec::with_capacity(MESSAGES_TO_KEEP + 2);
    condensed.push(messages[0].clone());
    condensed.push(ApiMessage {
        is_summary: true,
        ..ApiMessage::assistant_text(summary.clone())
    });
    condensed.extend(keep.iter().cloned());
    detach_orphan_results(&mut condensed);

    let new_context_tokens = estimate_tokens(&condensed);
    if new_context_tokens >= prev_context_tokens {
        return Err(format!(
            "Condensing did not shrink the context ({} -> {} tokens)",
            prev_context_tokens, new_context_tokens
        ));
    }

    Ok(CondenseOutcome {
        messages: condensed,
        strategy: CondenseStrategy::Summarize,
        prev_context_tokens,
        new_context_tokens,
        cost,
        summary: Some(summary),
    })
}

/// Decide whether `history` needs condensing before the next request.
///
/// `last_request_tokens` is the context size reported for the previous request (zero before
/// the first one); the newest message is estimated on top of it.
pub async fn manage_context(
    history: &[ApiMessage],
    last_request_tokens: u64,
    settings: &ContextSettings,
    model: &ModelInfo,
    client: &dyn ModelClient,
    pacer: &RequestPacer,
    metadata: &RequestMetadata,
) -> ContextDecision {
    let prev_context_tokens = if last_request_tokens == 0 {
        estimate_tokens(history)
    } else {
        last_request_tokens + history.last().map(|m| estimate_tokens(std::slice::from_ref(m))).unwrap_or(0)
    };

    let window = model.context_window.max(1);
    let allowed = ((window as f64) * (1.0 - TOKEN_BUFFER_PERCENTAGE)) as u64;
    let allowed = allowed.saturating_sub(model.max_output_tokens);
    let percent = prev_context_tokens.saturating_mul(100) / window;

    let mut error = None;
    if settings.auto_condense
        && (percent >= u64::from(settings.condense_threshold_percent) || prev_context_tokens > allowed)
    {
        tracing::info!(
            task_id = %metadata.task_id,
            prev_context_tokens,
            percent,
            "Condensing context"
        );
        match summarize_conversation(history, client, pacer, metadata, prev_context_tokens).await {
            Ok(outcome) => return ContextDecision::Replaced { outcome, error: None },
            Err(e) => {
                tracing::warn!(task_id = %metadata.task_id, "Context summarization failed: {}", e);
                error = Some(e);
            }
        }
    }

    if prev_context_tokens > allowed {
        let messages = truncate_conversation(history, 0.5);
        let new_context_tokens = estimate_tokens(&messages);
        return ContextDecision::Replaced {
            outcome: CondenseOutcome {
                messages,
                strategy: CondenseStrategy::Truncate,
                prev_context_tokens,
                new_context_tokens,
                cost: 0.0,
                summary: None,
            },
            error,
        };
    }

    ContextDecision::Unchanged { error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::TokenUsage;
    use crate::task::{Mode, TaskId};
    use crate::testing::ScriptedClient;
    use serde_json::json;
    use std::time::Duration;

    fn conversation(turns: usize) -> Vec<ApiMessage> {
        let mut messages = vec![ApiMessage::user_text("<task>\nfix the bug\n</task>")];
        for i in 0..turns {
            messages.push(ApiMessage::assistant_text(format!("step {} {}", i, "x".repeat(400))));
            messages.push(ApiMessage::user_text(format!("result {} {}", i, "y".repeat(400))));
        }
        messages
    }

    fn metadata() -> RequestMetadata {
        RequestMetadata {
            task_id: TaskId::new(),
            mode: Mode::default(),
        }
    }

    fn model(context_window: u64) -> ModelInfo {
        ModelInfo {
            id: "test/model".to_string(),
            context_window,
            max_output_tokens: 100,
        }
    }

    #[test]
    fn test_truncation_keeps_first_and_removes_even_count() {
        let messages = conversation(5);
        let truncated = truncate_conversation(&messages, 0.5);

        assert_eq!(truncated[0], messages[0]);
        assert_eq!((messages.len() - truncated.len()) % 2, 0);
        assert_eq!(truncated.len(), 7);
        assert_eq!(truncated[1].role, Role::Assistant);
        assert_eq!(truncated.last(), messages.last());
    }

    #[test]
    fn test_truncation_detaches_orphaned_results() {
        let messages = vec![
            ApiMessage::user_text("task"),
            ApiMessage::assistant(vec![ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "read_file".to_string(),
                input: json!({ "path": "a" }),
            }]),
            ApiMessage::user(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: "contents".to_string(),
                is_error: false,
            }]),
            ApiMessage::assistant_text("ok"),
            ApiMessage::user(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: "again".to_string(),
                is_error: false,
            }]),
        ];
        let truncated = truncate_conversation(&messages, 0.5);
        assert_eq!(truncated.len(), 3);
        assert_eq!(
            truncated[2].content[0],
            ContentBlock::text("[earlier tool result] again")
        );
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(&[ApiMessage::user_text("abcde")]), 2);
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[tokio::test]
    async fn test_small_history_is_left_alone() {
        let client = ScriptedClient::new();
        let history = conversation(1);
        let decision = manage_context(
            &history,
            0,
            &ContextSettings::default(),
            &model(200_000),
            &client,
            &RequestPacer::new(Duration::ZERO),
            &metadata(),
        )
        .await;
        assert!(matches!(decision, ContextDecision::Unchanged { error: None }));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_summarization_replaces_middle_of_history() {
        let client = ScriptedClient::new();
        client.push_chunks(vec![
            ApiChunk::Text("The user asked to fix a bug.".to_string()),
            ApiChunk::Usage(TokenUsage::new(500, 20).with_cost(0.002)),
        ]);
        let history = conversation(6);
        let decision = manage_context(
            &history,
            0,
            &ContextSettings::default(),
            &model(1_000),
            &client,
            &RequestPacer::new(Duration::ZERO),
            &metadata(),
        )
        .await;

        let ContextDecision::Replaced { outcome, error } = decision else {
            panic!("expected a replacement");
        };
        assert!(error.is_none());
        assert_eq!(outcome.strategy, CondenseStrategy::Summarize);
        assert_eq!(outcome.messages.len(), 2 + MESSAGES_TO_KEEP);
        assert!(outcome.messages[1].is_summary);
        assert_eq!(outcome.messages[0], history[0]);
        assert!(outcome.new_context_tokens < outcome.prev_context_tokens);
        assert!((outcome.cost - 0.002).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failed_summary_falls_back_to_truncation() {
        let client = ScriptedClient::new();
        client.push_chunks(vec![]);
        let history = conversation(6);
        let decision = manage_context(
            &history,
            0,
            &ContextSettings::default(),
            &model(1_000),
            &client,
            &RequestPacer::new(Duration::ZERO),
            &metadata(),
        )
        .await;

        let ContextDecision::Replaced { outcome, error } = decision else {
            panic!("expected a replacement");
        };
        assert_eq!(outcome.strategy, CondenseStrategy::Truncate);
        assert_eq!(error.as_deref(), Some("Summarization produced no text"));
    }
}
