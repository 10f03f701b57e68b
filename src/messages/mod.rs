//! Ask/say display messages.
//!
//! A task talks to its caller only through these records: `say` emits progress, `ask`
//! requests input. Each kind is a closed enumeration and structured payloads travel in
//! [`MessageDetail`] rather than in loosely typed optional fields.

mod channel;
mod responder;

pub use channel::{MessageLog, UpdateOutcome};
pub use responder::{AskResponder, AutoResponder};

use serde::{Deserialize, Serialize};

use crate::cost::TokenUsage;

/// Kinds of input a task can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Command,
    CommandOutput,
    CompletionResult,
    Tool,
    ApiReqFailed,
    ResumeTask,
    ResumeCompletedTask,
    MistakeLimitReached,
    AutoApprovalMaxReqReached,
    AutoApprovalMaxCostReached,
}

impl AskKind {
    /// Whether a pending ask of this kind makes the task externally idle.
    ///
    /// Approval prompts (`Tool`, `Command`), follow-up questions and streamed command output
    /// are part of an active exchange and leave the task active.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            AskKind::CompletionResult
                | AskKind::ApiReqFailed
                | AskKind::ResumeTask
                | AskKind::ResumeCompletedTask
                | AskKind::MistakeLimitReached
                | AskKind::AutoApprovalMaxReqReached
                | AskKind::AutoApprovalMaxCostReached
        )
    }
}

/// Kinds of progress a task can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Text,
    Reasoning,
    Error,
    ApiReqStarted,
    ApiReqRetried,
    ApiReqRetryDelayed,
    RateLimitWait,
    Tool,
    UserFeedback,
    CompletionResult,
    SubtaskResult,
    CondenseContext,
    CondenseContextError,
    CheckpointSaved,
}

/// Whether a display message asks or says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "subtype", rename_all = "snake_case")]
pub enum MessageKind {
    Ask(AskKind),
    Say(SayKind),
}

/// The caller's answer to an ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskResponse {
    YesButtonClicked,
    NoButtonClicked,
    MessageResponse,
}

/// A resolved ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskReply {
    pub response: AskResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AskReply {
    pub fn yes() -> Self {
        Self {
            response: AskResponse::YesButtonClicked,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn no() -> Self {
        Self {
            response: AskResponse::NoButtonClicked,
            ..Self::yes()
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            response: AskResponse::MessageResponse,
            text: Some(text.into()),
            images: Vec::new(),
        }
    }

    /// Text the caller typed, if any.
    pub fn feedback(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Spinner text attached to in-progress messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressStatus {
    pub text: String,
    #[serde(default)]
    pub spin: bool,
}

/// Why an API request ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserCancelled,
    StreamingFailed,
}

/// Structured payload of a display message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detail", rename_all = "snake_case")]
pub enum MessageDetail {
    ApiRequest {
        #[serde(default)]
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cancel_reason: Option<CancelReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        streaming_failed_message: Option<String>,
    },
    Retry {
        attempt: u32,
        delay_secs: u64,
    },
    Condense {
        cost: f64,
        prev_context_tokens: u64,
        new_context_tokens: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Tool {
        tool: String,
        params: Vec<(String, String)>,
    },
    Checkpoint {
        reference: String,
    },
}

/// One ask/say record in a task's display log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    /// Milliseconds since the epoch, strictly increasing within one log
    pub ts: i64,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// `Some(true)` while streaming, `Some(false)` once finalized, `None` for atomic events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_status: Option<ProgressStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<MessageDetail>,
}

impl DisplayMessage {
    pub fn is_partial(&self) -> bool {
        self.partial == Some(true)
    }

    pub fn is_ask(&self) -> bool {
        matches!(self.kind, MessageKind::Ask(_))
    }
}

/// Everything needed to append or update one display message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageContent {
    pub text: Option<String>,
    pub images: Vec<String>,
    pub progress_status: Option<ProgressStatus>,
    pub detail: Option<MessageDetail>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_detail(mut self, detail: MessageDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_progress(mut self, progress: ProgressStatus) -> Self {
        self.progress_status = Some(progress);
        self
    }
}

impl From<Option<String>> for MessageContent {
    fn from(text: Option<String>) -> Self {
        Self {
            text,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_allowlist() {
        assert!(AskKind::CompletionResult.is_blocking());
        assert!(AskKind::MistakeLimitReached.is_blocking());
        assert!(AskKind::ApiReqFailed.is_blocking());
        assert!(!AskKind::Tool.is_blocking());
        assert!(!AskKind::Followup.is_blocking());
        assert!(!AskKind::CommandOutput.is_blocking());
    }

    #[test]
    fn test_display_message_json_shape() {
        let message = DisplayMessage {
            ts: 42,
            kind: MessageKind::Say(SayKind::ApiReqRetryDelayed),
            text: Some("Retrying in 5 seconds...".to_string()),
            images: Vec::new(),
            partial: Some(true),
            progress_status: None,
            detail: Some(MessageDetail::Retry {
                attempt: 1,
                delay_secs: 5,
            }),
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["kind"]["type"], "say");
        assert_eq!(value["kind"]["subtype"], "api_req_retry_delayed");
        assert_eq!(value["detail"]["detail"], "retry");
        assert_eq!(value["detail"]["delay_secs"], 5);

        let back: DisplayMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_reply_feedback_ignores_blank_text() {
        assert_eq!(AskReply::message("  ").feedback(), None);
        assert_eq!(AskReply::message("try again").feedback(), Some("try again"));
        assert_eq!(AskReply::yes().feedback(), None);
    }
}
