//! Sub-Agent Runner: spawns an isolated child [`crate::agent::Agent`] for
//! one task, rebuilding it from the same tool set and model the parent
//! already resolved through the Permission Resolver, so the child can
//! never exceed the parent's tool rights. Transcripts persist through an
//! injected [`SnapshotStore`] port — this module does not prescribe
//! where snapshots live on disk.

use std::sync::Arc;

use crate::agent::{Agent, Clock, SystemClock};
use crate::error::SubAgentError;
use crate::llm::{ChatModel, ModelMessage, ModelUsage};
use crate::tools::ToolSpec;

/// A sub-agent's model hint, directives, and identity in the catalog
/// `run_task` resolves `subagent_type` against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubAgentProfile {
    pub name: String,
    pub default_model_hint: String,
    pub directives: String,
}

/// The small built-in catalog from spec.md §4.8: a general-purpose
/// worker, a read-only explorer, and a planner that proposes but does
/// not execute.
pub fn builtin_profiles() -> Vec<SubAgentProfile> {
    vec![
        SubAgentProfile {
            name: "general-purpose".to_string(),
            default_model_hint: "claude-sonnet-4-5".to_string(),
            directives: "You are a general-purpose sub-agent. Complete the assigned task fully \
                and call the done tool with a concise final answer."
                .to_string(),
        },
        SubAgentProfile {
            name: "explore".to_string(),
            default_model_hint: "claude-haiku-4-5".to_string(),
            directives: "You are a read-only exploration sub-agent. Investigate the codebase \
                using search and read tools only, then report findings. Do not modify any files."
                .to_string(),
        },
        SubAgentProfile {
            name: "plan".to_string(),
            default_model_hint: "claude-opus-4-5".to_string(),
            directives: "You are a planning sub-agent. Produce a step-by-step plan for the \
                assigned task; do not execute it."
                .to_string(),
        },
    ]
}

fn find_profile<'a>(
    profiles: &'a [SubAgentProfile],
    name: &str,
) -> Result<&'a SubAgentProfile, SubAgentError> {
    profiles
        .iter()
        .find(|profile| profile.name == name)
        .ok_or_else(|| SubAgentError::UnknownProfile(name.to_string()))
}

/// An opaque, resumable conversation snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub history: Vec<ModelMessage>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Port over wherever snapshots actually persist (a file, a database
/// row, an in-memory map for tests) — the runner only needs load/save/
/// new-id.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<Snapshot>, SubAgentError>;
    fn save(&self, snapshot: &Snapshot) -> Result<String, SubAgentError>;
    fn new_id(&self) -> String;
}

/// An in-memory [`SnapshotStore`] useful for tests and single-process
/// deployments that don't need snapshots to survive a restart.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: std::sync::Mutex<std::collections::HashMap<String, Snapshot>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&self, id: &str) -> Result<Option<Snapshot>, SubAgentError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| SubAgentError::Store("snapshot store lock poisoned".to_string()))?;
        Ok(snapshots.get(id).cloned())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<String, SubAgentError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| SubAgentError::Store("snapshot store lock poisoned".to_string()))?;
        snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot.id.clone())
    }

    fn new_id(&self) -> String {
        let n = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("subagent-{n}")
    }
}

pub struct RunTaskRequest {
    pub description: String,
    pub prompt: String,
    pub subagent_type: String,
    pub resume_id: Option<String>,
}

/// The formatted result `run_task` hands back to the parent: duration,
/// token usage, the resume id a follow-up call can pass back in, and the
/// `<thinking>`/`<response>` sections extracted from the final reply.
#[derive(Clone, Debug, PartialEq)]
pub struct RunTaskReport {
    pub resume_id: String,
    pub duration_ms: u64,
    pub usage: ModelUsage,
    pub thinking: Option<String>,
    pub response: String,
}

impl RunTaskReport {
    /// Renders the report the way it is surfaced back to the parent
    /// conversation as a tool result string.
    pub fn to_report_string(&self) -> String {
        let mut out = format!(
            "Sub-agent task completed in {}ms (tokens: {} in / {} out). Resume id: {}\n\n",
            self.duration_ms, self.usage.input_tokens, self.usage.output_tokens, self.resume_id
        );
        if let Some(thinking) = &self.thinking {
            out.push_str(&format!("<thinking>\n{thinking}\n</thinking>\n\n"));
        }
        out.push_str(&self.response);
        out
    }
}

/// Implements the six numbered steps of spec.md §4.8: resolve the
/// profile, rebuild a child agent from the parent's tool set, resume or
/// start empty, run the task, and persist a new snapshot.
pub async fn run_task(
    request: RunTaskRequest,
    model: Arc<dyn ChatModel>,
    tools: Vec<ToolSpec>,
    parent_system_prompt: &str,
    profiles: &[SubAgentProfile],
    snapshot_store: &dyn SnapshotStore,
) -> Result<RunTaskReport, SubAgentError> {
    run_task_with_clock(
        request,
        model,
        tools,
        parent_system_prompt,
        profiles,
        snapshot_store,
        Arc::new(SystemClock),
    )
    .await
}

/// Same as [`run_task`] but with an injectable clock, so tests get
/// deterministic `duration_ms`/`created_at_ms` values.
pub async fn run_task_with_clock(
    request: RunTaskRequest,
    model: Arc<dyn ChatModel>,
    tools: Vec<ToolSpec>,
    parent_system_prompt: &str,
    profiles: &[SubAgentProfile],
    snapshot_store: &dyn SnapshotStore,
    clock: Arc<dyn Clock>,
) -> Result<RunTaskReport, SubAgentError> {
    let profile = find_profile(profiles, &request.subagent_type)?;

    let history = match &request.resume_id {
        Some(id) => {
            snapshot_store
                .load(id)?
                .ok_or_else(|| SubAgentError::ResumeNotFound(id.clone()))?
                .history
        }
        None => Vec::new(),
    };

    let system_prompt = format!(
        "{parent_system_prompt}\n\n{}\n\nTask: {}",
        profile.directives, request.description
    );

    let mut agent = Agent::builder()
        .model_arc(model)
        .tools(tools)
        .system_prompt(system_prompt)
        .history(history)
        .clock(clock.clone())
        .build()?;

    let start_ms = clock.now_ms();
    let reply = agent.query(request.prompt).await?;
    let duration_ms = clock.now_ms().saturating_sub(start_ms);

    let (thinking, response) = extract_tagged_sections(&reply);

    let snapshot_id = request
        .resume_id
        .clone()
        .unwrap_or_else(|| snapshot_store.new_id());
    let snapshot = Snapshot {
        id: snapshot_id,
        history: agent.conversation().to_vec(),
        created_at_ms: start_ms,
        updated_at_ms: clock.now_ms(),
    };
    let resume_id = snapshot_store.save(&snapshot)?;

    Ok(RunTaskReport {
        resume_id,
        duration_ms,
        usage: agent.total_usage(),
        thinking,
        response,
    })
}

/// Pulls `<thinking>...</thinking>` and `<response>...</response>`
/// sections out of a reply; falls back to the whole reply as the
/// response body when no `<response>` tag is present.
fn extract_tagged_sections(reply: &str) -> (Option<String>, String) {
    let thinking = extract_tag(reply, "thinking");
    let response = extract_tag(reply, "response").unwrap_or_else(|| reply.trim().to_string());
    (thinking, response)
}

fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let relative_end = text[start..].find(&close)?;
    Some(text[start..start + relative_end].trim().to_string())
}
