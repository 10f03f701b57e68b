//! Model client module.
//!
//! Defines the streaming contract every model client satisfies and the structured
//! conversation history exchanged with it. OpenRouter is the bundled implementation.
//!
//! Tools are invoked through an XML-style text protocol. History keeps tool calls and their
//! results as structured [`ContentBlock`]s; clients render them back to text with
//! [`ApiMessage::render_text`] when building a provider request.

mod error;
mod openrouter;

pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use openrouter::OpenRouterClient;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::cost::TokenUsage;
use crate::task::{Mode, TaskId};

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Base64 image data
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Parameters as a JSON object of raw string values, in call order
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Parse a `data:<media>;base64,<data>` URL into an image block.
    pub fn image_from_data_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (media_type, data) = rest.split_once(";base64,")?;
        Some(ContentBlock::Image {
            media_type: media_type.to_string(),
            data: data.to_string(),
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Rough size of the block in characters, used for token estimation.
    pub fn char_len(&self) -> usize {
        match self {
            ContentBlock::Text { text } => text.len(),
            // Images are billed by dimension, not by payload size.
            ContentBlock::Image { .. } => 4_000,
            ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
            ContentBlock::ToolResult { content, .. } => content.len(),
        }
    }
}

/// A message in the persisted conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    /// Set on the synthetic turn produced by context summarization
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_summary: bool,
}

impl ApiMessage {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
            ts: Some(chrono::Utc::now().timestamp_millis()),
            is_summary: false,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            ..Self::user(content)
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![ContentBlock::text(text)])
    }

    /// Render the message as plain text in the tool protocol the model reads and writes.
    pub fn render_text(&self) -> String {
        let mut parts = Vec::with_capacity(self.content.len());
        for block in &self.content {
            match block {
                ContentBlock::Text { text } => parts.push(text.clone()),
                ContentBlock::Image { .. } => {}
                ContentBlock::ToolUse { name, input, .. } => {
                    let mut xml = format!("<{}>\n", name);
                    if let Some(params) = input.as_object() {
                        for (key, value) in params {
                            let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                            xml.push_str(&format!("<{}>{}</{}>\n", key, value, key));
                        }
                    }
                    xml.push_str(&format!("</{}>", name));
                    parts.push(xml);
                }
                ContentBlock::ToolResult {
                    content, is_error, ..
                } => {
                    if *is_error {
                        parts.push(format!("[ERROR] {}", content));
                    } else {
                        parts.push(content.clone());
                    }
                }
            }
        }
        parts.join("\n\n")
    }

    pub fn images(&self) -> impl Iterator<Item = (&str, &str)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::Image { media_type, data } => Some((media_type.as_str(), data.as_str())),
            _ => None,
        })
    }
}

/// One event of a model response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiChunk {
    Text(String),
    Reasoning(String),
    Usage(TokenUsage),
}

/// The stream returned by [`ModelClient::create_message`].
///
/// Dropping the stream cancels the underlying request.
pub type ApiStream = Pin<Box<dyn Stream<Item = Result<ApiChunk, LlmError>> + Send>>;

/// Per-request metadata handed to the client.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub task_id: TaskId,
    pub mode: Mode,
}

/// Static facts about the model behind a client.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub context_window: u64,
    pub max_output_tokens: u64,
}

/// Trait for streaming model clients.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start a streaming completion.
    ///
    /// Errors returned here or as the first stream item are retryable at the task level.
    /// Errors after the first chunk abort the attempt.
    async fn create_message(
        &self,
        system_prompt: &str,
        history: &[ApiMessage],
        metadata: &RequestMetadata,
    ) -> Result<ApiStream, LlmError>;

    fn model_info(&self) -> ModelInfo;
}
