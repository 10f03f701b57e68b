//! OpenRouter streaming client.
//!
//! Speaks the OpenAI-compatible `chat/completions` endpoint with `stream: true` and turns the
//! server-sent events into [`ApiChunk`]s. HTTP failures surface as the first stream item so the
//! task can retry them like any other first-chunk failure.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as EventSourceError, Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};

use super::error::LlmError;
use super::{ApiChunk, ApiMessage, ApiStream, ModelClient, ModelInfo, RequestMetadata, Role};
use crate::cost::{cost_usd_from_usage, TokenUsage};

/// OpenRouter API client.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    context_window: u64,
    max_output_tokens: u64,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: model.into(),
            context_window: 200_000,
            max_output_tokens: 8_192,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_limits(mut self, context_window: u64, max_output_tokens: u64) -> Self {
        self.context_window = context_window;
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn build_request(&self, system_prompt: &str, history: &[ApiMessage]) -> ChatRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: WireContent::Text(system_prompt.to_string()),
        });

        for message in history {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let text = message.render_text();
            let images: Vec<_> = message.images().collect();
            let content = if images.is_empty() {
                WireContent::Text(text)
            } else {
                let mut parts = vec![WirePart::Text { text }];
                parts.extend(images.into_iter().map(|(media_type, data)| WirePart::ImageUrl {
                    image_url: WireImageUrl {
                        url: format!("data:{};base64,{}", media_type, data),
                    },
                }));
                WireContent::Parts(parts)
            };
            messages.push(WireMessage { role, content });
        }

        ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            max_tokens: self.max_output_tokens,
            usage: UsageRequest { include: true },
        }
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn create_message(
        &self,
        system_prompt: &str,
        history: &[ApiMessage],
        metadata: &RequestMetadata,
    ) -> Result<ApiStream, LlmError> {
        let request = self.build_request(system_prompt, history);
        tracing::debug!(
            task_id = %metadata.task_id,
            mode = %metadata.mode,
            model = %self.model,
            messages = request.messages.len(),
            "Opening OpenRouter stream"
        );

        let mut source = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "https://github.com/task-engine")
            .header("X-Title", "task-engine")
            .json(&request)
            .eventsource()
            .map_err(|e| LlmError::network_error(format!("Failed to open event stream: {}", e)))?;

        let model = self.model.clone();
        let stream = async_stream::stream! {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        if message.data.trim() == "[DONE]" {
                            break;
                        }
                        let chunk: StreamChunk = match serde_json::from_str(&message.data) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                yield Err(LlmError::parse_error(format!(
                                    "Failed to parse stream chunk: {}, data: {}",
                                    e, message.data
                                )));
                                break;
                            }
                        };
                        if let Some(error) = chunk.error {
                            yield Err(LlmError::stream_error(error.message));
                            break;
                        }
                        for choice in chunk.choices {
                            if let Some(reasoning) = choice.delta.reasoning.filter(|r| !r.is_empty()) {
                                yield Ok(ApiChunk::Reasoning(reasoning));
                            }
                            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                                yield Ok(ApiChunk::Text(content));
                            }
                        }
                        if let Some(usage) = chunk.usage {
                            yield Ok(ApiChunk::Usage(usage.into_token_usage(&model)));
                        }
                    }
                    Err(EventSourceError::StreamEnded) => break,
                    Err(EventSourceError::InvalidStatusCode(status, response)) => {
                        let retry_after = OpenRouterClient::parse_retry_after(response.headers());
                        let body = response.text().await.unwrap_or_default();
                        yield Err(LlmError::from_status(status.as_u16(), body, retry_after));
                        break;
                    }
                    Err(EventSourceError::Transport(e)) => {
                        yield Err(LlmError::from_reqwest(&e));
                        break;
                    }
                    Err(other) => {
                        yield Err(LlmError::network_error(other.to_string()));
                        break;
                    }
                }
            }
            source.close();
        };

        Ok(Box::pin(stream))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            id: self.model.clone(),
            context_window: self.context_window,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

// OpenRouter wire types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    max_tokens: u64,
    usage: UsageRequest,
}

#[derive(Debug, Serialize)]
struct UsageRequest {
    include: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    prompt_tokens_details: Option<PromptTokensDetails>,
    cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl WireUsage {
    fn into_token_usage(self, model: &str) -> TokenUsage {
        let cached = self
            .prompt_tokens_details
            .map(|d| d.cached_tokens)
            .unwrap_or(0);
        let mut usage = TokenUsage {
            input_tokens: self.prompt_tokens.saturating_sub(cached),
            output_tokens: self.completion_tokens,
            cache_write_tokens: 0,
            cache_read_tokens: cached,
            total_cost: 0.0,
        };
        usage.total_cost = match self.cost {
            Some(cost) => cost,
            None => cost_usd_from_usage(model, &usage),
        };
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ContentBlock;

    #[test]
    fn test_build_request_prepends_system_prompt() {
        let client = OpenRouterClient::new("key", "anthropic/claude-sonnet-4");
        let history = vec![
            ApiMessage::user_text("<task>\nfix the bug\n</task>"),
            ApiMessage::assistant_text("On it."),
        ];
        let request = client.build_request("You are helpful.", &history);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][0]["content"], "You are helpful.");
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["messages"][2]["content"], "On it.");
        assert_eq!(value["stream"], true);
        assert_eq!(value["usage"]["include"], true);
    }

    #[test]
    fn test_images_become_content_parts() {
        let client = OpenRouterClient::new("key", "openai/gpt-4o");
        let history = vec![ApiMessage::user(vec![
            ContentBlock::text("what is this"),
            ContentBlock::Image {
                media_type: "image/png".to_string(),
                data: "AAAA".to_string(),
            },
        ])];
        let value = serde_json::to_value(client.build_request("sys", &history)).unwrap();
        let parts = &value["messages"][1]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_usage_splits_cached_prompt_tokens() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":1200,"completion_tokens":40,
               "prompt_tokens_details":{"cached_tokens":1000},"cost":0.0123}}"#,
        )
        .unwrap();
        let usage = chunk.usage.unwrap().into_token_usage("anthropic/claude-sonnet-4");
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.cache_read_tokens, 1000);
        assert_eq!(usage.output_tokens, 40);
        assert!((usage.total_cost - 0.0123).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stream_delta_parses_reasoning_and_content() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"reasoning":"hmm","content":"Hello"}}]}"#,
        )
        .unwrap();
        let delta = &chunk.choices[0].delta;
        assert_eq!(delta.reasoning.as_deref(), Some("hmm"));
        assert_eq!(delta.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "17".parse().unwrap());
        assert_eq!(
            OpenRouterClient::parse_retry_after(&headers),
            Some(Duration::from_secs(17))
        );
    }
}
