//! Secret masking at the provider boundary.
//!
//! What is sent to a provider is the masked message list; the unmasked local
//! version stays in the attempt for UI display. Roles, tool-call structure,
//! and metadata survive masking unchanged.

use dagflow_common::llm::LlmMessage;

/// Fixed replacement token for masked secret values
pub const MASK_TOKEN: &str = "******";

/// Replace every occurrence of every secret value in `text`
pub fn mask_text(text: &str, secrets: &[String]) -> String {
    let mut masked = text.to_string();
    for secret in secrets {
        if secret.is_empty() {
            continue;
        }
        masked = masked.replace(secret.as_str(), MASK_TOKEN);
    }
    masked
}

/// Mask message content and tool-call arguments; everything else is cloned
/// untouched
pub fn mask_messages(messages: &[LlmMessage], secrets: &[String]) -> Vec<LlmMessage> {
    if secrets.is_empty() {
        return messages.to_vec();
    }
    messages
        .iter()
        .map(|message| {
            let mut masked = message.clone();
            masked.content = mask_text(&message.content, secrets);
            for call in &mut masked.tool_calls {
                call.function.arguments = mask_text(&call.function.arguments, secrets);
            }
            masked
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_common::llm::{LlmMessageMetadata, ToolCall};

    fn secrets() -> Vec<String> {
        vec!["sk-live-abc123".to_string(), "hunter2".to_string()]
    }

    #[test]
    fn masks_every_occurrence() {
        let text = "key sk-live-abc123 and again sk-live-abc123, pass hunter2";
        let masked = mask_text(text, &secrets());
        assert!(!masked.contains("sk-live-abc123"));
        assert!(!masked.contains("hunter2"));
        assert_eq!(masked.matches(MASK_TOKEN).count(), 3);
    }

    #[test]
    fn masks_tool_call_arguments() {
        let mut message = LlmMessage::assistant("using key sk-live-abc123");
        message.tool_calls = vec![ToolCall::function_call(
            "call_1",
            "deploy",
            r#"{"token":"hunter2"}"#,
        )];
        message.metadata = Some(LlmMessageMetadata {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
            cost: 0.0,
        });

        let masked = &mask_messages(&[message.clone()], &secrets())[0];
        let serialized = serde_json::to_string(masked).unwrap();
        for secret in secrets() {
            assert!(!serialized.contains(&secret));
        }

        // Structure and metadata preserved
        assert_eq!(masked.role, message.role);
        assert_eq!(masked.tool_calls[0].id, "call_1");
        assert_eq!(masked.tool_calls[0].function.name, "deploy");
        assert_eq!(masked.metadata, message.metadata);
    }

    #[test]
    fn overlapping_secrets_masked_longest_first() {
        // Caller orders secrets longest-first (EnvScope::all_secrets does);
        // verify the masking holds for the contained shorter secret too
        let secrets = vec!["token-abcdef".to_string(), "token".to_string()];
        let masked = mask_text("value token-abcdef tail", &secrets);
        assert!(!masked.contains("token-abcdef"));
        assert!(!masked.contains("token"));
    }

    #[test]
    fn no_secrets_is_identity() {
        let messages = vec![LlmMessage::user("plain text")];
        assert_eq!(mask_messages(&messages, &[]), messages);
    }
}
