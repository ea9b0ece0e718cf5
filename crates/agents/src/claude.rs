//! Anthropic messages-API chat client

use crate::provider::{classify_status, ChatRequest, ChatResponse, ChunkSink, LlmClient, TokenUsage};
use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::llm::{LlmMessage, LlmRole, ToolCall, ToolCallFunction};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct ClaudeClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "is_false")]
    stream: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl ClaudeClient {
    pub fn new(api_key: String, base_url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    /// Map the session into Anthropic's shape: system messages hoist into
    /// the `system` field, tool results become `tool_result` user blocks,
    /// and assistant tool calls become `tool_use` blocks.
    fn build_body(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        let mut system = None;
        let mut messages = Vec::new();

        for message in &request.messages {
            match message.role {
                LlmRole::System => {
                    if system.is_none() {
                        system = Some(message.content.clone());
                    }
                }
                LlmRole::User => {
                    messages.push(json!({"role": "user", "content": message.content}));
                }
                LlmRole::Assistant => {
                    let mut blocks = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": message.content}));
                    }
                    for call in &message.tool_calls {
                        let input: serde_json::Value =
                            serde_json::from_str(&call.function.arguments)
                                .unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
                LlmRole::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                            "content": message.content,
                        }],
                    }));
                }
            }
        }

        WireRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            tools: request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect(),
            temperature: request.temperature,
            top_p: request.top_p,
            stream,
        }
    }

    async fn post(&self, body: &WireRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("anthropic", status, &body));
        }
        Ok(response)
    }

    fn from_wire(wire: WireResponse) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in wire.content {
            match block {
                ContentBlock::Text { text } => content.push_str(&text),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        call_type: "function".to_string(),
                        function: ToolCallFunction {
                            name,
                            arguments: input.to_string(),
                        },
                    });
                }
                ContentBlock::Other => {}
            }
        }

        let mut message = LlmMessage::assistant(content);
        message.tool_calls = tool_calls;

        ChatResponse {
            message,
            usage: TokenUsage {
                prompt_tokens: wire.usage.input_tokens,
                completion_tokens: wire.usage.output_tokens,
                total_tokens: wire.usage.input_tokens + wire.usage.output_tokens,
            },
        }
    }
}

#[async_trait]
impl LlmClient for ClaudeClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        Self::validate_request(request)?;
        let body = self.build_body(request, false);
        let wire: WireResponse = self.post(&body).await?.json().await?;
        Ok(Self::from_wire(wire))
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        sink: ChunkSink<'_>,
    ) -> Result<ChatResponse> {
        #[derive(Deserialize)]
        struct StreamEvent {
            #[serde(rename = "type")]
            event_type: String,
            #[serde(default)]
            delta: Option<StreamDelta>,
        }

        #[derive(Deserialize)]
        struct StreamDelta {
            #[serde(default)]
            text: Option<String>,
        }

        Self::validate_request(request)?;
        let body = self.build_body(request, true);
        let response = self.post(&body).await?;

        let mut content = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
                    continue;
                };
                if event.event_type == "content_block_delta" {
                    if let Some(text) = event.delta.and_then(|d| d.text) {
                        sink(&text);
                        content.push_str(&text);
                    }
                }
            }
        }

        Ok(ChatResponse {
            message: LlmMessage::assistant(content),
            usage: TokenUsage::default(),
        })
    }
}

// Anthropic rejects requests whose messages list is empty
impl ClaudeClient {
    pub(crate) fn validate_request(request: &ChatRequest) -> Result<()> {
        if request
            .messages
            .iter()
            .all(|m| m.role == LlmRole::System)
        {
            return Err(Error::Validation(
                "chat request needs at least one non-system message".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_common::llm::ToolDefinition;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ClaudeClient {
        ClaudeClient::new(
            "sk-ant-test".to_string(),
            Some(server.uri()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet-4-0".to_string(),
            messages: vec![
                LlmMessage::system("be brief"),
                LlmMessage::user("hello"),
            ],
            tools: vec![],
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    #[tokio::test]
    async fn text_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "hi"}],
                "usage": {"input_tokens": 12, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let response = client(&server).chat(&request()).await.unwrap();
        assert_eq!(response.message.content, "hi");
        assert_eq!(response.usage.total_tokens, 14);
    }

    #[tokio::test]
    async fn tool_use_blocks_become_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "text", "text": "let me check"},
                    {"type": "tool_use", "id": "toolu_1", "name": "compute", "input": {"x": 1}}
                ],
                "usage": {"input_tokens": 5, "output_tokens": 5}
            })))
            .mount(&server)
            .await;

        let mut req = request();
        req.tools = vec![ToolDefinition {
            name: "compute".to_string(),
            description: "computes".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }];

        let response = client(&server).chat(&req).await.unwrap();
        assert_eq!(response.message.tool_calls.len(), 1);
        assert_eq!(response.message.tool_calls[0].id, "toolu_1");
        assert_eq!(
            response.message.tool_calls[0].function.arguments,
            r#"{"x":1}"#
        );
    }

    #[test]
    fn system_messages_hoist_into_system_field() {
        let c = ClaudeClient::new("k".to_string(), None, Duration::from_secs(1)).unwrap();
        let body = c.build_body(&request(), false);
        assert_eq!(body.system.as_deref(), Some("be brief"));
        assert_eq!(body.messages.len(), 1);
    }

    #[test]
    fn tool_results_become_user_blocks() {
        let c = ClaudeClient::new("k".to_string(), None, Duration::from_secs(1)).unwrap();
        let mut req = request();
        req.messages.push(LlmMessage::tool("toolu_1", "{\"OUT\":\"42\"}"));
        let body = c.build_body(&req, false);

        let last = body.messages.last().unwrap();
        assert_eq!(last["role"], "user");
        assert_eq!(last["content"][0]["type"], "tool_result");
        assert_eq!(last["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn system_only_request_rejected() {
        let mut req = request();
        req.messages.retain(|m| m.role == LlmRole::System);
        assert!(ClaudeClient::validate_request(&req).is_err());
    }
}
