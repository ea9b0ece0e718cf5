#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

//! LLM provider clients and the chat step executor

pub mod chat;
pub mod claude;
pub mod masking;
pub mod openai;
pub mod provider;
pub mod schema;
pub mod tools;

pub use chat::{ChatExecutor, ToolDagRunner};
pub use claude::ClaudeClient;
pub use masking::{mask_messages, mask_text, MASK_TOKEN};
pub use openai::OpenAiClient;
pub use provider::{default_client_factory, ChatRequest, ChatResponse, ClientFactory, LlmClient};
pub use tools::{args_to_params, ToolRegistry};
