//! The chat step executor: a multi-turn LLM session that can invoke other
//! DAGs as tools, with secret masking at the provider boundary and fallback
//! across a model list.

use crate::masking::mask_messages;
use crate::provider::{ChatRequest, ChatResponse, ClientFactory, LlmClient};
use crate::tools::{args_to_params, ToolRegistry};
use async_trait::async_trait;
use dagflow_common::error::{Error, Result, ResultExt};
use dagflow_common::keys::sub_run_id;
use dagflow_common::llm::{
    deduplicate_system_messages, LlmMessage, LlmMessageMetadata, LlmRole, ToolDefinition,
};
use dagflow_common::retry::{retry_with_backoff, BackoffPolicy};
use dagflow_core::context::RunContext;
use dagflow_core::dag::{ChatStepConfig, Dag, ModelEntry};
use dagflow_core::executor::{
    ChatMessageHandler, StepExecutor, SubRunProvider, ToolDefinitionProvider,
};
use dagflow_core::status::{Node, OutputVariables, SubDagRun};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Runs a tool DAG synchronously as a child attempt under the same root
#[async_trait]
pub trait ToolDagRunner: Send + Sync {
    async fn run_tool_dag(
        &self,
        ctx: &RunContext,
        dag: &Dag,
        dag_run_id: &str,
        params: &str,
    ) -> Result<OutputVariables>;

    /// Signal every in-flight child execution started by this runner
    fn kill(&self, signal: i32);
}

pub struct ChatExecutor {
    step_name: String,
    config: ChatStepConfig,
    parent_dag: Dag,
    inherited: Vec<LlmMessage>,
    saved_messages: Vec<LlmMessage>,
    collected_sub_runs: Vec<SubDagRun>,
    tool_defs: Vec<ToolDefinition>,
    runner: Arc<dyn ToolDagRunner>,
    clients: ClientFactory,
}

impl ChatExecutor {
    pub fn new(
        step_name: impl Into<String>,
        config: ChatStepConfig,
        parent_dag: Dag,
        runner: Arc<dyn ToolDagRunner>,
        clients: ClientFactory,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            config,
            parent_dag,
            inherited: Vec::new(),
            saved_messages: Vec::new(),
            collected_sub_runs: Vec::new(),
            tool_defs: Vec::new(),
            runner,
            clients,
        }
    }

    /// Compose the session: the step's own system message takes precedence,
    /// inherited non-system messages come next, then the step's own
    /// messages; duplicate system messages collapse to the first.
    fn compose_messages(&self, ctx: &RunContext) -> Vec<LlmMessage> {
        let mut session = Vec::new();
        if let Some(system) = &self.config.system {
            session.push(LlmMessage::system(system.clone()));
        }
        session.extend(self.inherited.iter().cloned());
        session.extend(
            self.config
                .messages
                .iter()
                .filter(|m| m.role != LlmRole::System)
                .cloned(),
        );

        let mut session = deduplicate_system_messages(session);
        for message in &mut session {
            message.content = ctx.env.expand(&message.content);
        }
        session
    }

    fn build_request(&self, entry: &ModelEntry, messages: Vec<LlmMessage>) -> ChatRequest {
        ChatRequest {
            model: entry.name.clone(),
            messages,
            tools: self.tool_defs.clone(),
            temperature: entry.temperature,
            max_tokens: entry.max_tokens,
            top_p: entry.top_p,
        }
    }

    async fn call_provider(
        &self,
        client: &dyn LlmClient,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<ChatResponse> {
        if stream {
            let sink = |chunk: &str| print!("{chunk}");
            retry_with_backoff(BackoffPolicy::default(), "provider chat", || {
                client.chat_stream(request, &sink)
            })
            .await
        } else {
            retry_with_backoff(BackoffPolicy::default(), "provider chat", || {
                client.chat(request)
            })
            .await
        }
    }

    fn metadata_for(client: &dyn LlmClient, entry: &ModelEntry, response: &ChatResponse)
        -> LlmMessageMetadata {
        LlmMessageMetadata {
            provider: client.provider().to_string(),
            model: entry.name.clone(),
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            total_tokens: response.usage.total_tokens,
            cost: 0.0,
        }
    }

    /// One tool call: resolve, execute the sub-DAG, reply with a tool-role
    /// message. A failed child still contributes a sub-run entry so the UI
    /// can drill into it.
    async fn execute_tool_call(
        &mut self,
        ctx: &RunContext,
        registry: &ToolRegistry,
        call: &dagflow_common::llm::ToolCall,
    ) -> LlmMessage {
        let name = &call.function.name;
        let Some(entry) = registry.get(name) else {
            return LlmMessage::tool(call.id.clone(), format!("Error: unknown tool {name}"));
        };

        let params = match serde_json::from_str::<serde_json::Value>(&call.function.arguments)
            .map_err(Error::from)
            .and_then(|args| args_to_params(&args))
        {
            Ok(params) => params,
            Err(e) => {
                return LlmMessage::tool(
                    call.id.clone(),
                    format!("Error: invalid arguments for {name}: {e}"),
                );
            }
        };

        // The call id is the nonce, so one session can invoke the same tool
        // with identical params more than once
        let child_id = sub_run_id(&ctx.dag_run_id, &self.step_name, &params, call.id.as_bytes());
        self.collected_sub_runs.push(SubDagRun {
            dag_run_id: child_id.clone(),
            params: params.clone(),
            dag_name: entry.dag.name.clone(),
        });

        match self
            .runner
            .run_tool_dag(ctx, &entry.dag, &child_id, &params)
            .await
        {
            Ok(outputs) => {
                let content = serde_json::to_string(&outputs)
                    .unwrap_or_else(|e| format!("Error: unserializable outputs: {e}"));
                LlmMessage::tool(call.id.clone(), content)
            }
            Err(e) => {
                warn!(tool = %name, child = %child_id, error = %e, "tool DAG failed");
                LlmMessage::tool(call.id.clone(), format!("Error: {e}"))
            }
        }
    }

    /// Bounded tool loop for one model; at most `max_tool_iterations`
    /// provider calls regardless of model behavior.
    async fn run_tool_loop(
        &mut self,
        ctx: &RunContext,
        client: &dyn LlmClient,
        entry: &ModelEntry,
        registry: &ToolRegistry,
        mut session: Vec<LlmMessage>,
    ) -> Result<Vec<LlmMessage>> {
        let secrets = ctx.env.all_secrets();

        for _iteration in 0..self.config.max_tool_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Timeout("chat step cancelled".to_string()));
            }

            let masked = mask_messages(&session, &secrets);
            let request = self.build_request(entry, masked);
            let response = self.call_provider(client, &request, false).await?;

            let mut assistant = response.message.clone();
            assistant.metadata = Some(Self::metadata_for(client, entry, &response));

            if assistant.tool_calls.is_empty() {
                println!("{}", assistant.content);
                session.push(assistant);
                return Ok(session);
            }

            let calls = assistant.tool_calls.clone();
            session.push(assistant);
            // Sequential execution keeps session ordering deterministic
            for call in &calls {
                let reply = self.execute_tool_call(ctx, registry, call).await;
                session.push(reply);
            }
        }

        warn!(
            step = %self.step_name,
            limit = self.config.max_tool_iterations,
            "tool loop hit iteration limit without a final response"
        );
        let last_content = session
            .iter()
            .rev()
            .find(|m| m.role == LlmRole::Assistant && !m.content.is_empty())
            .map(|m| m.content.clone())
            .unwrap_or_else(|| {
                format!(
                    "The conversation was truncated after {} tool iterations.",
                    self.config.max_tool_iterations
                )
            });
        session.push(LlmMessage::assistant(last_content));
        Ok(session)
    }

    /// Run the session with one model entry, resetting per-attempt state
    async fn run_with_model(
        &mut self,
        ctx: &RunContext,
        entry: &ModelEntry,
        registry: &ToolRegistry,
        allow_stream: bool,
    ) -> Result<()> {
        self.saved_messages.clear();
        self.collected_sub_runs.clear();

        let client = (self.clients)(entry)?;
        let session = self.compose_messages(ctx);

        let session = if registry.is_empty() {
            let secrets = ctx.env.all_secrets();
            let masked = mask_messages(&session, &secrets);
            let request = self.build_request(entry, masked);
            let stream = allow_stream && self.config.stream;
            let response = self.call_provider(client.as_ref(), &request, stream).await?;

            let mut assistant = response.message.clone();
            assistant.metadata = Some(Self::metadata_for(client.as_ref(), entry, &response));
            if !stream {
                println!("{}", assistant.content);
            }

            let mut session = session;
            session.push(assistant);
            session
        } else {
            self.run_tool_loop(ctx, client.as_ref(), entry, registry, session)
                .await?
        };

        self.saved_messages = session;
        Ok(())
    }
}

#[async_trait]
impl StepExecutor for ChatExecutor {
    #[instrument(skip(self, ctx, node), fields(step = %self.step_name))]
    async fn execute(&mut self, ctx: &RunContext, node: &mut Node) -> Result<()> {
        if self.config.models.is_empty() {
            return Err(Error::Validation(format!(
                "chat step {:?} configures no models",
                self.step_name
            )));
        }

        let registry = if self.config.tools.is_empty() {
            ToolRegistry::default()
        } else {
            ToolRegistry::build(&self.config.tools, &self.parent_dag, ctx.dag_db.as_ref())
                .await
                .ctx(format!("building tool registry for step {}", self.step_name))?
        };
        self.tool_defs = registry.definitions();

        // Streaming is disabled under fallback to avoid partial output on
        // failover
        let allow_stream = self.config.models.len() == 1;

        let mut last_error = None;
        for entry in self.config.models.clone() {
            match self.run_with_model(ctx, &entry, &registry, allow_stream).await {
                Ok(()) => {
                    info!(model = %entry.name, provider = %entry.provider, "chat step completed");
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(model = %entry.name, provider = %entry.provider, error = %e,
                        "model attempt failed");
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e.context(format!(
                "chat step {:?}: all {} model(s) failed",
                self.step_name,
                self.config.models.len()
            )));
        }

        node.chat_messages = self.saved_messages.clone();
        node.tool_definitions = self.tool_defs.clone();
        node.sub_runs.extend(self.collected_sub_runs.iter().cloned());
        if let Some(output) = &node.step.output {
            let content = self
                .saved_messages
                .iter()
                .rev()
                .find(|m| m.role == LlmRole::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            node.output_variables.insert(output.clone(), content);
        }
        Ok(())
    }

    fn kill(&mut self, signal: i32) {
        self.runner.kill(signal);
    }
}

impl ChatMessageHandler for ChatExecutor {
    fn set_context(&mut self, messages: Vec<LlmMessage>) {
        self.inherited = messages;
    }

    fn chat_messages(&self) -> Vec<LlmMessage> {
        self.saved_messages.clone()
    }
}

impl SubRunProvider for ChatExecutor {
    fn collected_sub_runs(&self) -> Vec<SubDagRun> {
        self.collected_sub_runs.clone()
    }
}

impl ToolDefinitionProvider for ChatExecutor {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tool_defs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, TokenUsage};
    use dagflow_common::llm::ToolCall;
    use dagflow_common::types::DagRunRef;
    use dagflow_core::dag::Step;
    use dagflow_store::{FileDagRunStore, InMemoryDagDatabase, InMemoryQueueStore};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Scripted provider client recording what it was sent
    struct ScriptedClient {
        responses: Mutex<Vec<ChatResponse>>,
        seen: Arc<Mutex<Vec<Vec<LlmMessage>>>>,
        fail_first: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.seen.lock().push(request.messages.clone());
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::NonRetriable(Box::new(Error::Provider(
                    "scripted failure".to_string(),
                ))));
            }
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(text_response("fallback"))
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn chat_stream(
            &self,
            request: &ChatRequest,
            _sink: crate::provider::ChunkSink<'_>,
        ) -> Result<ChatResponse> {
            self.chat(request).await
        }
    }

    fn text_response(content: &str) -> ChatResponse {
        ChatResponse {
            message: LlmMessage::assistant(content),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        }
    }

    fn tool_call_response(name: &str, args: &str, call_id: &str) -> ChatResponse {
        let mut message = LlmMessage::assistant("");
        message.tool_calls = vec![ToolCall::function_call(call_id, name, args)];
        ChatResponse {
            message,
            usage: TokenUsage::default(),
        }
    }

    struct FakeRunner {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl ToolDagRunner for FakeRunner {
        async fn run_tool_dag(
            &self,
            _ctx: &RunContext,
            dag: &Dag,
            dag_run_id: &str,
            params: &str,
        ) -> Result<OutputVariables> {
            self.calls.lock().push((
                dag.name.clone(),
                dag_run_id.to_string(),
                params.to_string(),
            ));
            let mut out = OutputVariables::new();
            out.insert("RESULT", "42");
            Ok(out)
        }

        fn kill(&self, _signal: i32) {}
    }

    struct TestHarness {
        ctx: RunContext,
        runner: Arc<FakeRunner>,
        seen: Arc<Mutex<Vec<Vec<LlmMessage>>>>,
        _dir: tempfile::TempDir,
    }

    fn harness(secrets: HashMap<String, String>) -> TestHarness {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext {
            env: dagflow_core::context::EnvScope::empty().with_secrets(secrets),
            run_store: Arc::new(FileDagRunStore::new(dir.path())),
            queue_store: Arc::new(InMemoryQueueStore::new()),
            dag_db: Arc::new(InMemoryDagDatabase::new()),
            dispatcher: None,
            cancel: CancellationToken::new(),
            root: DagRunRef::new("parent", "p1"),
            dag_name: "parent".to_string(),
            dag_run_id: "p1".to_string(),
        };
        TestHarness {
            ctx,
            runner: Arc::new(FakeRunner {
                calls: Mutex::new(Vec::new()),
            }),
            seen: Arc::new(Mutex::new(Vec::new())),
            _dir: dir,
        }
    }

    fn model(provider: &str, name: &str) -> ModelEntry {
        ModelEntry {
            provider: provider.to_string(),
            name: name.to_string(),
            api_key_name: None,
            base_url: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    fn chat_config(models: Vec<ModelEntry>, tools: Vec<String>) -> ChatStepConfig {
        ChatStepConfig {
            models,
            system: Some("you are a workflow assistant".to_string()),
            messages: vec![LlmMessage::user("do the thing with ${TOKEN}")],
            tools,
            max_tool_iterations: 3,
            thinking: None,
            stream: false,
        }
    }

    fn parent_with_tool() -> Dag {
        let mut parent = Dag {
            name: "parent".to_string(),
            steps: vec![Step {
                name: "chat".to_string(),
                ..Step::default()
            }],
            ..Dag::default()
        };
        parent.local_dags.insert(
            "compute".to_string(),
            Dag {
                name: "compute".to_string(),
                description: "computes things".to_string(),
                params: Some("x name=world".to_string()),
                steps: vec![Step {
                    name: "calc".to_string(),
                    run: Some("true".to_string()),
                    ..Step::default()
                }],
                ..Dag::default()
            },
        );
        parent
    }

    fn executor(
        h: &TestHarness,
        config: ChatStepConfig,
        responses: Vec<ChatResponse>,
        fail_first: usize,
    ) -> ChatExecutor {
        let seen = Arc::clone(&h.seen);
        let fail = Arc::new(AtomicUsize::new(fail_first));
        let responses = Arc::new(Mutex::new(responses));
        let factory: ClientFactory = Arc::new(move |_entry| {
            Ok(Box::new(ScriptedClient {
                responses: Mutex::new(responses.lock().clone()),
                seen: Arc::clone(&seen),
                fail_first: Arc::clone(&fail),
            }) as Box<dyn LlmClient>)
        });
        ChatExecutor::new(
            "chat",
            config,
            parent_with_tool(),
            h.runner.clone() as Arc<dyn ToolDagRunner>,
            factory,
        )
    }

    #[tokio::test]
    async fn secrets_never_reach_the_provider() {
        let h = harness(HashMap::from([(
            "TOKEN".to_string(),
            "super-secret-token".to_string(),
        )]));
        let config = chat_config(vec![model("openai", "gpt-4o")], vec![]);
        let mut exec = executor(&h, config, vec![text_response("done")], 0);
        let mut node = Node::new(Step {
            name: "chat".to_string(),
            ..Step::default()
        });

        exec.execute(&h.ctx, &mut node).await.unwrap();

        let sent = h.seen.lock();
        assert_eq!(sent.len(), 1);
        for message in &sent[0] {
            assert!(!message.content.contains("super-secret-token"));
        }
        // Substitution happened before masking: the secret was interpolated
        // then replaced with the mask token
        assert!(sent[0].iter().any(|m| m.content.contains("******")));

        // The local session keeps the unmasked version
        assert!(node
            .chat_messages
            .iter()
            .any(|m| m.content.contains("super-secret-token")));
    }

    #[tokio::test]
    async fn tool_call_runs_child_dag() {
        let h = harness(HashMap::new());
        let config = chat_config(
            vec![model("openai", "gpt-4o")],
            vec!["compute".to_string()],
        );
        let mut exec = executor(
            &h,
            config,
            vec![
                tool_call_response("compute", r#"{"x":1,"name":"hello world"}"#, "call_1"),
                text_response("all done"),
            ],
            0,
        );
        let mut node = Node::new(Step {
            name: "chat".to_string(),
            output: Some("ANSWER".to_string()),
            ..Step::default()
        });

        exec.execute(&h.ctx, &mut node).await.unwrap();

        let calls = h.runner.calls.lock();
        assert_eq!(calls.len(), 1);
        let (dag_name, child_id, params) = &calls[0];
        assert_eq!(dag_name, "compute");
        assert_eq!(params, r#"name="hello world" x=1"#);

        assert_eq!(exec.collected_sub_runs().len(), 1);
        assert_eq!(&exec.collected_sub_runs()[0].dag_run_id, child_id);
        assert_eq!(node.sub_runs.len(), 1);

        // Tool reply carried the child's outputs
        let tool_reply = node
            .chat_messages
            .iter()
            .find(|m| m.role == LlmRole::Tool)
            .unwrap();
        assert!(tool_reply.content.contains("RESULT"));
        assert_eq!(node.output_variables.get("ANSWER"), Some("all done"));
        assert_eq!(exec.tool_definitions().len(), 1);
    }

    #[tokio::test]
    async fn tool_loop_terminates_at_iteration_limit() {
        let h = harness(HashMap::new());
        let config = chat_config(
            vec![model("openai", "gpt-4o")],
            vec!["compute".to_string()],
        );
        // Always returns tool calls; never a final answer
        let endless: Vec<ChatResponse> = (0..10)
            .map(|i| tool_call_response("compute", r#"{"x":1}"#, &format!("call_{i}")))
            .collect();
        let mut exec = executor(&h, config, endless, 0);
        let mut node = Node::new(Step {
            name: "chat".to_string(),
            ..Step::default()
        });

        exec.execute(&h.ctx, &mut node).await.unwrap();

        // At most max_tool_iterations provider calls
        assert_eq!(h.seen.lock().len(), 3);
        // A synthesized notice closes the truncated session
        let last = node.chat_messages.last().unwrap();
        assert_eq!(last.role, LlmRole::Assistant);
        assert!(last.content.contains("truncated"));
    }

    #[tokio::test]
    async fn fallback_resets_state_between_models() {
        let h = harness(HashMap::new());
        let config = chat_config(
            vec![model("openai", "gpt-4o"), model("openai", "gpt-4o-mini")],
            vec![],
        );
        // First model's client fails once (its only call); second succeeds
        let mut exec = executor(&h, config, vec![text_response("from model B")], 1);
        let mut node = Node::new(Step {
            name: "chat".to_string(),
            ..Step::default()
        });

        exec.execute(&h.ctx, &mut node).await.unwrap();

        // State was reset between models: exactly one assistant message, and
        // it came from the second model's attempt
        let assistant_count = node
            .chat_messages
            .iter()
            .filter(|m| m.role == LlmRole::Assistant)
            .count();
        assert_eq!(assistant_count, 1);
        assert!(node
            .chat_messages
            .iter()
            .any(|m| m.content == "from model B"));
    }

    #[tokio::test]
    async fn all_models_failing_surfaces_last_error() {
        let h = harness(HashMap::new());
        let config = chat_config(
            vec![model("openai", "a"), model("openai", "b")],
            vec![],
        );
        let mut exec = executor(&h, config, vec![], 2);
        let mut node = Node::new(Step {
            name: "chat".to_string(),
            ..Step::default()
        });

        let err = exec.execute(&h.ctx, &mut node).await.unwrap_err();
        assert!(err.to_string().contains("all 2 model(s) failed"));
    }

    #[tokio::test]
    async fn inherited_context_composition() {
        let h = harness(HashMap::new());
        let config = chat_config(vec![model("openai", "gpt-4o")], vec![]);
        let mut exec = executor(&h, config, vec![text_response("ok")], 0);
        exec.set_context(vec![
            LlmMessage::system("inherited system to be dropped"),
            LlmMessage::user("earlier question"),
            LlmMessage::assistant("earlier answer"),
        ]);

        let mut node = Node::new(Step {
            name: "chat".to_string(),
            ..Step::default()
        });
        exec.execute(&h.ctx, &mut node).await.unwrap();

        let sent = &h.seen.lock()[0];
        let systems: Vec<_> = sent.iter().filter(|m| m.role == LlmRole::System).collect();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].content, "you are a workflow assistant");

        let contents: Vec<&str> = sent.iter().map(|m| m.content.as_str()).collect();
        let earlier_q = contents.iter().position(|c| *c == "earlier question").unwrap();
        let own = contents
            .iter()
            .position(|c| c.contains("do the thing"))
            .unwrap();
        assert!(earlier_q < own);
    }
}
