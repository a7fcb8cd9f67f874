//! Tool registry: binds named [`ToolSuite`]s into one callable surface,
//! normalizes and validates arguments, truncates oversized output, and
//! caches idempotent calls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::context::{truncate_tool_output, ContextManagerConfig};
use crate::error::ToolError;
use crate::llm::{ModelToolCall, ModelToolDefinition};
use crate::tools::{DependencyMap, ToolOutcome, ToolSpec};

const RESERVED_MCP_PREFIX: &str = "mcp__";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// A named group of tools contributed by one [`crate::capability::CapabilityModule`].
pub struct ToolSuite {
    pub id: String,
    pub tools: Vec<ToolSpec>,
    /// MCP-sourced suites are exempt from the `mcp__` reserved-prefix
    /// check — everything else is not allowed to claim that namespace.
    pub is_mcp: bool,
}

impl ToolSuite {
    pub fn new(id: impl Into<String>, tools: Vec<ToolSpec>) -> Self {
        Self {
            id: id.into(),
            tools,
            is_mcp: false,
        }
    }

    pub fn mcp(id: impl Into<String>, tools: Vec<ToolSpec>) -> Self {
        Self {
            id: id.into(),
            tools,
            is_mcp: true,
        }
    }
}

/// The raw shape a tool call's arguments may arrive in from a provider
/// adapter, before normalization into a JSON object.
pub enum RawArguments {
    Value(Value),
    Json(String),
    Pairs(Vec<(String, Value)>),
}

fn normalize_arguments(raw: RawArguments) -> Value {
    match raw {
        RawArguments::Value(value) if value.is_object() => value,
        RawArguments::Value(_) => Value::Object(Default::default()),
        RawArguments::Json(text) => serde_json::from_str::<Value>(&text)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default())),
        RawArguments::Pairs(pairs) => Value::Object(pairs.into_iter().collect()),
    }
}

pub struct ToolCallRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: RawArguments,
}

/// Result of running one tool call through [`ToolRegistry::execute`].
/// A superset of the teacher's `ToolExecutionResult`, generalized so the
/// agent loop can observe cache hits and early-completion the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExecutionOutcome {
    pub text: String,
    pub is_error: bool,
    pub is_done: bool,
}

/// Hooks the Agent Loop (or tests) attach to observe registry activity.
/// Every method is a no-op by default so callers only override what they need.
pub trait Observer: Send + Sync {
    fn on_tool_start(&self, _tool_call_id: &str, _tool_name: &str, _args: &Value) {}
    fn on_tool_result(&self, _tool_call_id: &str, _tool_name: &str, _result: &str) {}
    fn on_tool_error(&self, _tool_call_id: &str, _tool_name: &str, _message: &str) {}
    fn on_cache_hit(&self, _tool_call_id: &str, _tool_name: &str) {}
}

pub struct NoopObserver;

impl Observer for NoopObserver {}

struct CacheEntry {
    value: String,
    inserted_at: Instant,
}

pub struct ToolRegistry {
    suite_order: Vec<String>,
    tool_order: Vec<String>,
    tools: HashMap<String, (String, ToolSpec)>,
    cache: Mutex<HashMap<(String, String), CacheEntry>>,
    cache_ttl: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            suite_order: Vec::new(),
            tool_order: Vec::new(),
            tools: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Registers a suite atomically: either the suite id is free and
    /// every tool name is free, or nothing is added and an error is
    /// returned.
    pub fn register_suite(&mut self, suite: ToolSuite) -> Result<(), ToolError> {
        if self.suite_order.contains(&suite.id) {
            return Err(ToolError::DuplicateSuite(suite.id));
        }

        for tool in &suite.tools {
            if !suite.is_mcp && tool.name().starts_with(RESERVED_MCP_PREFIX) {
                return Err(ToolError::ReservedPrefix(tool.name().to_string()));
            }
            if self.tools.contains_key(tool.name()) {
                return Err(ToolError::DuplicateTool(tool.name().to_string()));
            }
        }

        for tool in suite.tools {
            self.tool_order.push(tool.name().to_string());
            self.tools
                .insert(tool.name().to_string(), (suite.id.clone(), tool));
        }
        self.suite_order.push(suite.id);

        Ok(())
    }

    pub fn unregister_suite(&mut self, suite_id: &str) {
        self.tool_order
            .retain(|name| match self.tools.get(name) {
                Some((owner, _)) => owner != suite_id,
                None => false,
            });
        self.tools.retain(|_, (owner, _)| owner != suite_id);
        self.suite_order.retain(|id| id != suite_id);
    }

    pub fn list_provider_tools(&self) -> Vec<ModelToolDefinition> {
        self.tool_order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|(_, tool)| ModelToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.json_schema().clone(),
            })
            .collect()
    }

    pub fn tool_call_definitions_from(calls: &[ModelToolCall]) -> Vec<ToolCallRequest> {
        calls
            .iter()
            .map(|call| ToolCallRequest {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: RawArguments::Value(call.arguments.clone()),
            })
            .collect()
    }

    /// Runs the 8-step execute protocol: resolve, cache lookup, notify
    /// start, normalize+validate, invoke, truncate, cache store, notify
    /// result. Never returns an `Err` — failures are formatted in-band.
    pub async fn execute(
        &self,
        request: ToolCallRequest,
        dependencies: &DependencyMap,
        context_manager: Option<&ContextManagerConfig>,
        observer: &dyn Observer,
    ) -> ToolExecutionOutcome {
        let ToolCallRequest {
            tool_call_id,
            tool_name,
            arguments,
        } = request;

        let Some((_, tool)) = self.tools.get(&tool_name) else {
            let message = format!("Tool \"{tool_name}\" is not available.");
            observer.on_tool_error(&tool_call_id, &tool_name, &message);
            return ToolExecutionOutcome {
                text: message,
                is_error: true,
                is_done: false,
            };
        };

        let args = normalize_arguments(arguments);
        let cache_key = (tool_name.clone(), canonical_json(&args));

        if tool.cacheable() {
            if let Some(cached) = self.cache_get(&cache_key) {
                observer.on_cache_hit(&tool_call_id, &tool_name);
                observer.on_tool_result(&tool_call_id, &tool_name, &cached);
                return ToolExecutionOutcome {
                    text: cached,
                    is_error: false,
                    is_done: false,
                };
            }
        }

        observer.on_tool_start(&tool_call_id, &tool_name, &args);

        let outcome = tool.execute(args, dependencies).await;

        let (mut text, is_error, is_done) = match outcome {
            Ok(ToolOutcome::Text(text)) => (text, false, false),
            Ok(ToolOutcome::Done(text)) => (text, false, true),
            Err(err @ ToolError::InvalidArguments { .. }) => (err.to_string(), true, false),
            Err(err) => (format!("Failed to run \"{tool_name}\": {err}"), true, false),
        };

        if let Some(manager) = context_manager {
            text = truncate_tool_output(&tool_name, &text, manager.max_tool_output_chars);
        }

        if is_error {
            observer.on_tool_error(&tool_call_id, &tool_name, &text);
        } else {
            observer.on_tool_result(&tool_call_id, &tool_name, &text);
            if tool.cacheable() {
                self.cache_put(cache_key, text.clone());
            }
        }

        ToolExecutionOutcome {
            text,
            is_error,
            is_done,
        }
    }

    fn cache_get(&self, key: &(String, String)) -> Option<String> {
        let mut cache = self.cache.lock().expect("tool cache lock poisoned");
        match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.cache_ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: (String, String), value: String) {
        let mut cache = self.cache.lock().expect("tool cache lock poisoned");
        cache.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }
}

fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn counting_tool(calls: std::sync::Arc<AtomicUsize>) -> ToolSpec {
        ToolSpec::new("lookup", "looks something up")
            .with_schema(json!({
                "type": "object",
                "properties": {"q": {"type": "string"}},
                "required": ["q"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(move |args, _deps| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ToolOutcome::Text(format!("result for {}", args["q"])))
                }
            })
            .with_cacheable(true)
    }

    #[tokio::test]
    async fn execute_reports_tool_not_found() {
        let registry = ToolRegistry::new();
        let outcome = registry
            .execute(
                ToolCallRequest {
                    tool_call_id: "1".to_string(),
                    tool_name: "missing".to_string(),
                    arguments: RawArguments::Value(json!({})),
                },
                &DependencyMap::new(),
                None,
                &NoopObserver,
            )
            .await;

        assert!(outcome.is_error);
        assert_eq!(outcome.text, "Tool \"missing\" is not available.");
    }

    #[tokio::test]
    async fn register_suite_rejects_duplicate_suite_ids() {
        let mut registry = ToolRegistry::new();
        registry
            .register_suite(ToolSuite::new("a", vec![ToolSpec::new("one", "first")]))
            .expect("first registers");

        let err = registry
            .register_suite(ToolSuite::new("a", vec![ToolSpec::new("two", "second")]))
            .expect_err("duplicate suite id should fail");

        assert!(matches!(err, ToolError::DuplicateSuite(id) if id == "a"));
    }

    #[tokio::test]
    async fn register_suite_rejects_duplicate_names() {
        let mut registry = ToolRegistry::new();
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        registry
            .register_suite(ToolSuite::new("a", vec![counting_tool(calls.clone())]))
            .expect("first registers");

        let err = registry
            .register_suite(ToolSuite::new("b", vec![counting_tool(calls)]))
            .expect_err("duplicate should fail");

        assert!(matches!(err, ToolError::DuplicateTool(name) if name == "lookup"));
    }

    #[tokio::test]
    async fn register_suite_rejects_reserved_mcp_prefix_for_non_mcp_suites() {
        let mut registry = ToolRegistry::new();
        let tool = ToolSpec::new("mcp__server__tool", "mcp-shaped but not mcp");
        let err = registry
            .register_suite(ToolSuite::new("local", vec![tool]))
            .expect_err("reserved prefix should fail");
        assert!(matches!(err, ToolError::ReservedPrefix(_)));
    }

    #[tokio::test]
    async fn register_suite_allows_reserved_prefix_for_mcp_suites() {
        let mut registry = ToolRegistry::new();
        let tool = ToolSpec::new("mcp__server__tool", "real mcp tool");
        registry
            .register_suite(ToolSuite::mcp("server", vec![tool]))
            .expect("mcp suite allowed");
        assert_eq!(registry.list_provider_tools().len(), 1);
    }

    #[tokio::test]
    async fn cacheable_tool_is_only_invoked_once_for_identical_arguments() {
        let mut registry = ToolRegistry::new();
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        registry
            .register_suite(ToolSuite::new("a", vec![counting_tool(calls.clone())]))
            .expect("registers");

        for _ in 0..3 {
            let outcome = registry
                .execute(
                    ToolCallRequest {
                        tool_call_id: "call".to_string(),
                        tool_name: "lookup".to_string(),
                        arguments: RawArguments::Value(json!({"q": "rust"})),
                    },
                    &DependencyMap::new(),
                    None,
                    &NoopObserver,
                )
                .await;
            assert!(!outcome.is_error);
            assert_eq!(outcome.text, "result for rust");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_truncates_output_when_context_manager_attached() {
        let mut registry = ToolRegistry::new();
        let tool = ToolSpec::new("dump", "dumps a lot of text").with_handler(|_args, _deps| {
            async move { Ok(ToolOutcome::Text("x".repeat(5_000))) }
        });
        registry
            .register_suite(ToolSuite::new("a", vec![tool]))
            .expect("registers");

        let config = ContextManagerConfig {
            max_tool_output_chars: 200,
            ..ContextManagerConfig::default()
        };

        let outcome = registry
            .execute(
                ToolCallRequest {
                    tool_call_id: "1".to_string(),
                    tool_name: "dump".to_string(),
                    arguments: RawArguments::Value(json!({})),
                },
                &DependencyMap::new(),
                Some(&config),
                &NoopObserver,
            )
            .await;

        assert!(outcome.text.len() < 5_000);
        assert!(outcome.text.contains("truncated"));
    }

    #[tokio::test]
    async fn done_outcome_is_flagged_for_the_agent_loop() {
        let mut registry = ToolRegistry::new();
        let tool = ToolSpec::new("finish", "ends the turn")
            .with_handler(|_args, _deps| async move { Ok(ToolOutcome::Done("done".to_string())) });
        registry
            .register_suite(ToolSuite::new("a", vec![tool]))
            .expect("registers");

        let outcome = registry
            .execute(
                ToolCallRequest {
                    tool_call_id: "1".to_string(),
                    tool_name: "finish".to_string(),
                    arguments: RawArguments::Value(json!({})),
                },
                &DependencyMap::new(),
                None,
                &NoopObserver,
            )
            .await;

        assert!(outcome.is_done);
        assert!(!outcome.is_error);
    }

    #[tokio::test]
    async fn execute_reports_invalid_arguments_with_the_spec_prefix() {
        let mut registry = ToolRegistry::new();
        let tool = ToolSpec::new("echo_tool", "echoes a message")
            .with_schema(json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(|args, _deps| {
                async move { Ok(ToolOutcome::Text(format!("Echo: {}", args["message"]))) }
            });
        registry
            .register_suite(ToolSuite::new("a", vec![tool]))
            .expect("registers");

        let outcome = registry
            .execute(
                ToolCallRequest {
                    tool_call_id: "c2".to_string(),
                    tool_name: "echo_tool".to_string(),
                    arguments: RawArguments::Value(json!({})),
                },
                &DependencyMap::new(),
                None,
                &NoopObserver,
            )
            .await;

        assert!(outcome.is_error);
        assert_eq!(
            outcome.text,
            "Invalid arguments for \"echo_tool\": Missing required property \"message\"."
        );
    }

    #[test]
    fn normalize_arguments_falls_back_to_empty_object_on_invalid_json() {
        let normalized = normalize_arguments(RawArguments::Json("not json".to_string()));
        assert_eq!(normalized, json!({}));
    }

    #[test]
    fn normalize_arguments_accepts_pairs() {
        let normalized = normalize_arguments(RawArguments::Pairs(vec![(
            "q".to_string(),
            json!("rust"),
        )]));
        assert_eq!(normalized, json!({"q": "rust"}));
    }
}
