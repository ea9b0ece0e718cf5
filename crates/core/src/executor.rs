//! Step executor capabilities.
//!
//! Executors are capability-tagged variants; callers dispatch on the
//! capabilities a variant exposes rather than on inheritance.

use crate::context::RunContext;
use crate::status::{Node, SubDagRun};
use async_trait::async_trait;
use dagflow_common::error::Result;
use dagflow_common::llm::{LlmMessage, ToolDefinition};

/// Drives one step to completion, mutating its node record in place
#[async_trait]
pub trait StepExecutor: Send {
    /// Run the step. On error the caller marks the node Failed and applies
    /// retry policy; executors must not panic on runtime failures.
    async fn execute(&mut self, ctx: &RunContext, node: &mut Node) -> Result<()>;

    /// OS-level escalation delivered to whatever the executor is running
    fn kill(&mut self, signal: i32);
}

/// Capability: the executor holds a chat session whose messages flow between
/// steps of the same DAG
pub trait ChatMessageHandler {
    /// Inject messages saved by preceding chat steps
    fn set_context(&mut self, messages: Vec<LlmMessage>);

    /// The session after execution, for persistence and inheritance
    fn chat_messages(&self) -> Vec<LlmMessage>;
}

/// Capability: the executor spawned sub-DAG runs that belong on the node
pub trait SubRunProvider {
    fn collected_sub_runs(&self) -> Vec<SubDagRun>;
}

/// Capability: the executor published tool definitions worth persisting
pub trait ToolDefinitionProvider {
    fn tool_definitions(&self) -> Vec<ToolDefinition>;
}
