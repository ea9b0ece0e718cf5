//! LLM message model shared between the chat executor and persisted statuses

use serde::{Deserialize, Serialize};

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

impl ToolCall {
    pub fn function_call(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Function name and raw JSON arguments of a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

fn cost_is_zero(cost: &f64) -> bool {
    *cost == 0.0
}

/// Provider/usage metadata recorded on assistant messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmMessageMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "u32_is_zero")]
    pub prompt_tokens: u32,
    #[serde(default, skip_serializing_if = "u32_is_zero")]
    pub completion_tokens: u32,
    #[serde(default, skip_serializing_if = "u32_is_zero")]
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "cost_is_zero")]
    pub cost: f64,
}

fn u32_is_zero(v: &u32) -> bool {
    *v == 0
}

/// One message in a chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<LlmMessageMetadata>,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(LlmRole::Tool, content)
        }
    }

    fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            metadata: None,
        }
    }
}

/// Tool surface published to the provider for one DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Keep only the first system message, preserving the order of everything else
pub fn deduplicate_system_messages(messages: Vec<LlmMessage>) -> Vec<LlmMessage> {
    let mut seen_system = false;
    messages
        .into_iter()
        .filter(|m| {
            if m.role == LlmRole::System {
                if seen_system {
                    return false;
                }
                seen_system = true;
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_system_only() {
        let messages = vec![
            LlmMessage::user("a"),
            LlmMessage::system("first"),
            LlmMessage::assistant("b"),
            LlmMessage::system("second"),
            LlmMessage::user("c"),
            LlmMessage::system("third"),
        ];

        let deduped = deduplicate_system_messages(messages);
        let systems: Vec<_> = deduped
            .iter()
            .filter(|m| m.role == LlmRole::System)
            .collect();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].content, "first");

        let non_system: Vec<_> = deduped
            .iter()
            .filter(|m| m.role != LlmRole::System)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(non_system, ["a", "b", "c"]);
    }

    #[test]
    fn dedup_without_system_is_identity() {
        let messages = vec![LlmMessage::user("a"), LlmMessage::assistant("b")];
        assert_eq!(deduplicate_system_messages(messages.clone()), messages);
    }

    #[test]
    fn zero_cost_omitted_on_serialization() {
        let mut metadata = LlmMessageMetadata {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost: 0.0,
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(!json.contains("cost"));

        metadata.cost = 0.0125;
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("cost"));
    }

    #[test]
    fn tool_message_round_trip() {
        let mut msg = LlmMessage::assistant("");
        msg.tool_calls = vec![ToolCall::function_call("call_1", "compute", r#"{"x":1}"#)];
        let json = serde_json::to_string(&msg).unwrap();
        let back: LlmMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.tool_calls[0].call_type, "function");
    }
}
