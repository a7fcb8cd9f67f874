use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_stream::try_stream;
use futures_util::future::join_all;
use futures_util::{Stream, StreamExt};

use crate::context::{self, ContextManagerConfig, ContextStats};
use crate::error::{AgentError, ToolError};
use crate::llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice, ModelToolDefinition,
    ModelUsage,
};
use crate::tools::{DependencyMap, ToolOutcome, ToolSpec};

/// Supplies the monotonic millisecond timestamps carried by the
/// timestamped [`AgentEvent`] variants. Injected so tests can use a
/// deterministic clock instead of wall time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub require_done_tool: bool,
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            require_done_tool: false,
            max_iterations: 24,
            system_prompt: None,
        }
    }
}

/// Everything the agent loop can emit while driving a turn. The first
/// five variants are the teacher's original "narration" subset, kept
/// unchanged so existing consumers keep matching on them; the rest is
/// the timestamped event union a headless/UI driver needs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: serde_json::Value,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    FinalResponse {
        content: String,
    },
    MessageStart {
        timestamp_ms: u64,
    },
    MessageDelta {
        content: String,
        is_final: bool,
        timestamp_ms: u64,
    },
    MessageComplete {
        content: String,
        elapsed_ms: u64,
        timestamp_ms: u64,
    },
    ToolStart {
        name: String,
        id: String,
        params: serde_json::Value,
        timestamp_ms: u64,
    },
    ToolComplete {
        name: String,
        id: String,
        result: String,
        timestamp_ms: u64,
    },
    ToolFailed {
        name: String,
        id: String,
        error: String,
        timestamp_ms: u64,
    },
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
        timestamp_ms: u64,
    },
    Error {
        message: String,
        code: Option<String>,
        timestamp_ms: u64,
    },
}

type ContextPrunedCallback = Arc<dyn Fn(usize, ContextStats) + Send + Sync>;

pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
    dependencies: DependencyMap,
    dependency_overrides: DependencyMap,
    context_manager: Option<ContextManagerConfig>,
    on_context_pruned: Option<ContextPrunedCallback>,
    clock: Arc<dyn Clock>,
    initial_history: Vec<ModelMessage>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            model: None,
            tools: Vec::new(),
            config: AgentConfig::default(),
            dependencies: DependencyMap::new(),
            dependency_overrides: DependencyMap::new(),
            context_manager: None,
            on_context_pruned: None,
            clock: Arc::new(SystemClock),
            initial_history: Vec::new(),
        }
    }
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    /// Same as [`model`](Self::model) but for callers that already hold a
    /// type-erased model handle (the sub-agent runner, which rebuilds a
    /// child agent from the parent's `Arc<dyn ChatModel>` without knowing
    /// the concrete provider type).
    pub fn model_arc(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Seeds the conversation with a prior history instead of starting
    /// empty, so a resumed sub-agent snapshot continues where it left off.
    pub fn history(mut self, history: Vec<ModelMessage>) -> Self {
        self.initial_history = history;
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn require_done_tool(mut self, require_done_tool: bool) -> Self {
        self.config.require_done_tool = require_done_tool;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Attaches a [`ContextManagerConfig`]; the loop checks
    /// `ContextStats::approaching_limit` before every provider call and
    /// prunes history when it is.
    pub fn context_manager(mut self, config: ContextManagerConfig) -> Self {
        self.context_manager = Some(config);
        self
    }

    /// Observes pruning events (not surfaced as an `AgentEvent`).
    pub fn on_context_pruned<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, ContextStats) + Send + Sync + 'static,
    {
        self.on_context_pruned = Some(Arc::new(callback));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dependency<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(value);
        self
    }

    pub fn dependency_named<T>(self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert_named(key, value);
        self
    }

    pub fn dependency_override<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependency_overrides.insert(value);
        self
    }

    pub fn dependency_override_named<T>(self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependency_overrides.insert_named(key, value);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        let mut tool_map = HashMap::new();
        for tool in &self.tools {
            if tool_map
                .insert(tool.name().to_string(), tool.clone())
                .is_some()
            {
                return Err(AgentError::Config(format!(
                    "duplicate tool registered: {}",
                    tool.name()
                )));
            }
        }

        Ok(Agent {
            model,
            tools: self.tools,
            tool_map,
            config: self.config,
            dependencies: self.dependencies,
            dependency_overrides: self.dependency_overrides,
            history: self.initial_history,
            context_manager: self.context_manager,
            on_context_pruned: self.on_context_pruned,
            clock: self.clock,
            in_flight: Arc::new(AtomicBool::new(false)),
            total_usage: ModelUsage::default(),
        })
    }
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Vec<ToolSpec>,
    tool_map: HashMap<String, ToolSpec>,
    config: AgentConfig,
    dependencies: DependencyMap,
    dependency_overrides: DependencyMap,
    history: Vec<ModelMessage>,
    context_manager: Option<ContextManagerConfig>,
    on_context_pruned: Option<ContextPrunedCallback>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<AtomicBool>,
    total_usage: ModelUsage,
}

/// Resets the agent's reentrancy flag when the stream it guards is
/// dropped, whether that's a clean finish or the caller cancelling by
/// dropping the stream early.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn messages_len(&self) -> usize {
        self.history.len()
    }

    /// Read-only view of the conversation accumulated so far.
    pub fn conversation(&self) -> &[ModelMessage] {
        &self.history
    }

    /// Cumulative token usage across every provider call made by this
    /// agent instance so far.
    pub fn total_usage(&self) -> ModelUsage {
        self.total_usage.clone()
    }

    pub async fn query(&mut self, user_message: impl Into<String>) -> Result<String, AgentError> {
        let stream = self.query_stream(user_message);
        futures_util::pin_mut!(stream);

        let mut final_response: Option<String> = None;

        while let Some(event) = stream.next().await {
            if let AgentEvent::FinalResponse { content } = event? {
                final_response = Some(content);
            }
        }

        final_response.ok_or(AgentError::MissingFinalResponse)
    }

    pub fn query_stream(
        &mut self,
        user_message: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        let user_message = user_message.into();

        try_stream! {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                Err(AgentError::AlreadyRunning)?;
                return;
            }
            let _guard = InFlightGuard(self.in_flight.clone());

            if self.history.is_empty() {
                if let Some(system_prompt) = &self.config.system_prompt {
                    self.history
                        .push(ModelMessage::System(system_prompt.clone()));
                }
            }

            self.history.push(ModelMessage::User(user_message));

            let tool_definitions = self
                .tools
                .iter()
                .map(|tool| ModelToolDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.json_schema().clone(),
                })
                .collect::<Vec<_>>();

            let tool_choice = if tool_definitions.is_empty() {
                ModelToolChoice::None
            } else {
                ModelToolChoice::Auto
            };

            for _ in 0..self.config.max_iterations {
                if let Some(cfg) = self.context_manager.clone() {
                    let stats = ContextStats::compute(&self.history, &cfg);
                    if stats.approaching_limit {
                        let (pruned, removed) = context::prune(&self.history, &cfg);
                        self.history = pruned;
                        if removed > 0 {
                            log::debug!("context manager pruned {removed} old messages");
                            if let Some(callback) = &self.on_context_pruned {
                                callback(removed, ContextStats::compute(&self.history, &cfg));
                            }
                        }
                    }
                }

                let turn_start = self.clock.now_ms();
                yield AgentEvent::MessageStart { timestamp_ms: turn_start };

                let completion = self
                    .model
                    .invoke(&self.history, &tool_definitions, tool_choice.clone())
                    .await?;

                if let Some(thinking) = completion.thinking.clone() {
                    yield AgentEvent::Thinking { content: thinking };
                }

                self.append_assistant_message(&completion);

                let is_final_message = completion.tool_calls.is_empty();
                if let Some(text) = completion.text.clone() {
                    if !text.is_empty() {
                        yield AgentEvent::Text {
                            content: text.clone(),
                        };
                        yield AgentEvent::MessageDelta {
                            content: text,
                            is_final: is_final_message,
                            timestamp_ms: self.clock.now_ms(),
                        };
                    }
                }

                if let Some(usage) = &completion.usage {
                    self.total_usage.input_tokens += usage.input_tokens;
                    self.total_usage.output_tokens += usage.output_tokens;
                    yield AgentEvent::Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.input_tokens + usage.output_tokens,
                        timestamp_ms: self.clock.now_ms(),
                    };
                }

                if completion.tool_calls.is_empty() {
                    if !self.config.require_done_tool {
                        let final_content = completion.text.unwrap_or_default();
                        yield AgentEvent::MessageComplete {
                            content: final_content.clone(),
                            elapsed_ms: self.clock.now_ms().saturating_sub(turn_start),
                            timestamp_ms: self.clock.now_ms(),
                        };
                        yield AgentEvent::FinalResponse {
                            content: final_content,
                        };
                        return;
                    }
                    continue;
                }

                // Narration-before-tools: every ToolCall/ToolStart for this
                // turn is emitted up front, in request order, before any
                // tool actually runs.
                for tool_call in &completion.tool_calls {
                    yield AgentEvent::ToolCall {
                        tool: tool_call.name.clone(),
                        args_json: tool_call.arguments.clone(),
                        tool_call_id: tool_call.id.clone(),
                    };
                    yield AgentEvent::ToolStart {
                        name: tool_call.name.clone(),
                        id: tool_call.id.clone(),
                        params: tool_call.arguments.clone(),
                        timestamp_ms: self.clock.now_ms(),
                    };
                }

                let tool_calls = completion.tool_calls.clone();
                let futures = tool_calls
                    .iter()
                    .map(|tool_call| self.execute_tool_call(tool_call))
                    .collect::<Vec<_>>();
                // join_all preserves input order in its output regardless of
                // completion order, so no reordering step is needed here.
                let results = join_all(futures).await;

                for (tool_call, execution) in tool_calls.into_iter().zip(results.into_iter()) {
                    self.history.push(ModelMessage::ToolResult {
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_call.name.clone(),
                        content: execution.result_text.clone(),
                        is_error: execution.is_error,
                    });

                    yield AgentEvent::ToolResult {
                        tool: tool_call.name.clone(),
                        result_text: execution.result_text.clone(),
                        tool_call_id: tool_call.id.clone(),
                        is_error: execution.is_error,
                    };

                    if execution.is_error {
                        yield AgentEvent::ToolFailed {
                            name: tool_call.name.clone(),
                            id: tool_call.id.clone(),
                            error: execution.result_text.clone(),
                            timestamp_ms: self.clock.now_ms(),
                        };
                    } else {
                        yield AgentEvent::ToolComplete {
                            name: tool_call.name.clone(),
                            id: tool_call.id.clone(),
                            result: execution.result_text.clone(),
                            timestamp_ms: self.clock.now_ms(),
                        };
                    }

                    if let Some(done_message) = execution.done_message {
                        yield AgentEvent::FinalResponse {
                            content: done_message,
                        };
                        return;
                    }
                }
            }

            Err::<(), AgentError>(AgentError::MaxIterationsReached {
                max_iterations: self.config.max_iterations,
            })?;
        }
    }

    fn append_assistant_message(&mut self, completion: &ModelCompletion) {
        self.history.push(ModelMessage::Assistant {
            content: completion.text.clone(),
            tool_calls: completion.tool_calls.clone(),
        });
    }

    async fn execute_tool_call(&self, tool_call: &ModelToolCall) -> ToolExecutionResult {
        let Some(tool) = self.tool_map.get(&tool_call.name) else {
            return ToolExecutionResult {
                result_text: format!("Unknown tool '{}'.", tool_call.name),
                is_error: true,
                done_message: None,
            };
        };

        let runtime_dependencies = self.dependencies.merged_with(&self.dependency_overrides);

        let mut result = match tool
            .execute(tool_call.arguments.clone(), &runtime_dependencies)
            .await
        {
            Ok(ToolOutcome::Text(text)) => ToolExecutionResult {
                result_text: text,
                is_error: false,
                done_message: None,
            },
            Ok(ToolOutcome::Done(message)) => ToolExecutionResult {
                result_text: format!("Task completed: {message}"),
                is_error: false,
                done_message: Some(message),
            },
            Err(err) => ToolExecutionResult {
                result_text: format_tool_error(err),
                is_error: true,
                done_message: None,
            },
        };

        if let Some(cfg) = &self.context_manager {
            result.result_text =
                context::truncate_tool_output(&tool_call.name, &result.result_text, cfg.max_tool_output_chars);
        }

        result
    }
}

fn format_tool_error(err: ToolError) -> String {
    err.to_string()
}

struct ToolExecutionResult {
    result_text: String,
    is_error: bool,
    done_message: Option<String>,
}

pub async fn query(
    agent: &mut Agent,
    user_message: impl Into<String>,
) -> Result<String, AgentError> {
    agent.query(user_message).await
}

pub fn query_stream(
    agent: &mut Agent,
    user_message: impl Into<String>,
) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
    agent.query_stream(user_message)
}
