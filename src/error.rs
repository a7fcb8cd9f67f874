use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("Invalid arguments for \"{tool}\": {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("dependency missing: {0}")]
    MissingDependency(&'static str),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("duplicate tool registered: {0}")]
    DuplicateTool(String),
    #[error("duplicate tool suite id: {0}")]
    DuplicateSuite(String),
    #[error("tool name '{0}' uses the reserved mcp__ prefix")]
    ReservedPrefix(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
    #[error("rate limited after {attempts} attempt(s): {source}")]
    RateLimited {
        attempts: u32,
        source: String,
        retry_after: Option<Duration>,
    },
    #[error("authentication failed: {hint}")]
    AuthFailure { hint: String },
    #[error("provider protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability module contributed a duplicate suite id: {0}")]
    DuplicateSuite(String),
    #[error("capability module contributed a duplicate contribution id: {0}")]
    DuplicateContribution(String),
    #[error("capability host is frozen: modules may only be registered before the first build()")]
    SessionFrozen,
    #[error(transparent)]
    Tool(#[from] ToolError),
}

#[derive(Debug, Error)]
pub enum SubAgentError {
    #[error("resume snapshot not found: {0}")]
    ResumeNotFound(String),
    #[error("unknown sub-agent type: {0}")]
    UnknownProfile(String),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("snapshot store error: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("profile not found: {0}")]
    UnknownProfile(String),
    #[error("environment locks provider/model; persisted override for '{0}' is not permitted")]
    EnvLocked(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("max iterations reached ({max_iterations})")]
    MaxIterationsReached { max_iterations: u32 },
    #[error("agent stream ended without final response")]
    MissingFinalResponse,
    #[error("agent configuration error: {0}")]
    Config(String),
    #[error("a send()/query_stream() call is already in flight on this agent")]
    AlreadyRunning,
}
