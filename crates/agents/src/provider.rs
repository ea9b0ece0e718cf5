//! Provider client contract and model-entry resolution

use crate::claude::ClaudeClient;
use crate::openai::OpenAiClient;
use async_trait::async_trait;
use dagflow_common::config::Config;
use dagflow_common::error::{Error, Result};
use dagflow_common::llm::{LlmMessage, ToolDefinition};
use dagflow_core::context::EnvScope;
use dagflow_core::dag::ModelEntry;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;

/// Default per-call timeout for provider requests
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(300);

/// One chat completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Final message plus usage for one completion
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: LlmMessage,
    pub usage: TokenUsage,
}

/// Callback receiving streamed content chunks as they arrive
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// A chat-capable LLM provider client
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> &str;

    /// Non-streaming completion
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Streaming completion: chunks flow to `sink`, the aggregated response
    /// is returned
    async fn chat_stream(&self, request: &ChatRequest, sink: ChunkSink<'_>)
        -> Result<ChatResponse>;
}

/// Builds a client for one model entry; injected so tests can substitute
/// scripted clients
pub type ClientFactory =
    Arc<dyn Fn(&ModelEntry) -> Result<Box<dyn LlmClient>> + Send + Sync>;

/// Resolve the API key for a model entry: the entry's named env variable
/// first, then the configured provider entry
pub fn resolve_api_key(entry: &ModelEntry, env: &EnvScope, config: &Config) -> Result<String> {
    if let Some(key_name) = &entry.api_key_name {
        if let Some(value) = env.get(key_name) {
            return Ok(value.to_string());
        }
        return Err(Error::Auth(format!(
            "API key variable {key_name} is not set for provider {}",
            entry.provider
        )));
    }
    if let Some(provider) = config.providers.get(&entry.provider) {
        return Ok(provider.api_key.expose_secret().clone());
    }
    Err(Error::Auth(format!(
        "no API key configured for provider {}",
        entry.provider
    )))
}

/// Default factory over the built-in provider clients
pub fn default_client_factory(env: EnvScope, config: Config) -> ClientFactory {
    Arc::new(move |entry: &ModelEntry| {
        let api_key = resolve_api_key(entry, &env, &config)?;
        let timeout = config
            .providers
            .get(&entry.provider)
            .and_then(|p| p.timeout_ms)
            .map_or(DEFAULT_PROVIDER_TIMEOUT, Duration::from_millis);
        let base_url = entry.base_url.clone().or_else(|| {
            config
                .providers
                .get(&entry.provider)
                .and_then(|p| p.base_url.clone())
        });

        match entry.provider.as_str() {
            "anthropic" | "claude" => Ok(Box::new(ClaudeClient::new(
                api_key, base_url, timeout,
            )?) as Box<dyn LlmClient>),
            // OpenAI-compatible endpoints are the default wire shape
            _ => Ok(Box::new(OpenAiClient::new(
                entry.provider.clone(),
                api_key,
                base_url,
                timeout,
            )?) as Box<dyn LlmClient>),
        }
    })
}

/// Map an HTTP status from a provider into the error taxonomy
pub fn classify_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::Auth(format!("{provider} rejected credentials: {body}")),
        429 => Error::RateLimit(format!("{provider}: {body}")),
        s if status.is_server_error() => {
            Error::Timeout(format!("{provider} returned {s}: {body}"))
        }
        s => Error::NonRetriable(Box::new(Error::Provider(format!(
            "{provider} returned {s}: {body}"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_common::config::ProviderConfig;
    use secrecy::Secret;
    use std::collections::HashMap;

    fn entry(provider: &str) -> ModelEntry {
        ModelEntry {
            provider: provider.to_string(),
            name: "model-x".to_string(),
            api_key_name: None,
            base_url: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    #[test]
    fn api_key_from_named_env_var() {
        let mut e = entry("openai");
        e.api_key_name = Some("MY_KEY".to_string());
        let env = EnvScope::empty().with_secrets(HashMap::from([(
            "MY_KEY".to_string(),
            "sk-from-env".to_string(),
        )]));
        let key = resolve_api_key(&e, &env, &Config::default()).unwrap();
        assert_eq!(key, "sk-from-env");
    }

    #[test]
    fn api_key_from_config_fallback() {
        let mut config = Config::default();
        config.providers.insert(
            "openai".to_string(),
            ProviderConfig {
                api_key: Secret::new("sk-from-config".to_string()),
                base_url: None,
                default_model: None,
                timeout_ms: None,
                enabled: true,
            },
        );
        let key = resolve_api_key(&entry("openai"), &EnvScope::empty(), &config).unwrap();
        assert_eq!(key, "sk-from-config");
    }

    #[test]
    fn missing_key_is_auth_error() {
        let err = resolve_api_key(&entry("openai"), &EnvScope::empty(), &Config::default())
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn status_classification() {
        let auth = classify_status("openai", reqwest::StatusCode::UNAUTHORIZED, "no");
        assert!(!auth.is_retryable());
        assert!(matches!(auth, Error::Auth(_)));

        let limited = classify_status("openai", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow");
        assert!(limited.is_retryable());

        let server = classify_status("openai", reqwest::StatusCode::BAD_GATEWAY, "oops");
        assert!(server.is_retryable());

        let bad_request = classify_status("openai", reqwest::StatusCode::BAD_REQUEST, "nope");
        assert!(!bad_request.is_retryable());
    }
}
