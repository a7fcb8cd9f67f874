//! Headless Driver: a line-delimited JSON front-end over the Agent Loop
//! for script-driven use (spec.md §4.9, §6). One JSON [`Envelope`] per
//! stdout line; prompts arrive over stdin (or as a trailing CLI
//! positional) and are processed serially through a FIFO queue.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use futures_util::StreamExt;

use crate::agent::{Agent, AgentEvent};

/// Outgoing envelope shapes, exact key names per spec.md §6. Tagged
/// `type`, kebab-case on the variant, camelCase on every field.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Session {
        session_id: String,
        profile: String,
        manifest: Value,
        working_dir: String,
        workspace_context: Option<String>,
        version: String,
    },
    #[serde(rename_all = "camelCase")]
    UserInput {
        session_id: String,
        profile: String,
        run_id: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentEvent {
        session_id: String,
        profile: String,
        run_id: String,
        event: Value,
    },
    #[serde(rename_all = "camelCase")]
    RunComplete {
        session_id: String,
        profile: String,
        run_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        session_id: String,
        profile: String,
        run_id: Option<String>,
        message: String,
    },
}

/// Maps one `agent::AgentEvent` onto the wire shape from spec.md §3/§6:
/// `{type, timestamp, ...variant fields}`. The teacher's original
/// narration-only variants (`Thinking`/`Text`/`ToolCall`/`ToolResult`/
/// `FinalResponse`) have no timestamp and are superseded on the wire by
/// the timestamped variants below, so they are not forwarded.
pub fn agent_event_to_json(event: &AgentEvent) -> Option<Value> {
    let value = match event {
        AgentEvent::MessageStart { timestamp_ms } => serde_json::json!({
            "type": "message.start",
            "timestamp": timestamp_ms,
        }),
        AgentEvent::MessageDelta {
            content,
            is_final,
            timestamp_ms,
        } => serde_json::json!({
            "type": "message.delta",
            "timestamp": timestamp_ms,
            "content": content,
            "isFinal": is_final,
        }),
        AgentEvent::MessageComplete {
            content,
            elapsed_ms,
            timestamp_ms,
        } => serde_json::json!({
            "type": "message.complete",
            "timestamp": timestamp_ms,
            "content": content,
            "elapsedMs": elapsed_ms,
        }),
        AgentEvent::ToolStart {
            name,
            id,
            params,
            timestamp_ms,
        } => serde_json::json!({
            "type": "tool.start",
            "timestamp": timestamp_ms,
            "name": name,
            "id": id,
            "params": params,
        }),
        AgentEvent::ToolComplete {
            name,
            id,
            result,
            timestamp_ms,
        } => serde_json::json!({
            "type": "tool.complete",
            "timestamp": timestamp_ms,
            "name": name,
            "id": id,
            "result": result,
        }),
        AgentEvent::ToolFailed {
            name,
            id,
            error,
            timestamp_ms,
        } => serde_json::json!({
            "type": "tool.error",
            "timestamp": timestamp_ms,
            "name": name,
            "id": id,
            "error": error,
        }),
        AgentEvent::Usage {
            input_tokens,
            output_tokens,
            total_tokens,
            timestamp_ms,
        } => serde_json::json!({
            "type": "usage",
            "timestamp": timestamp_ms,
            "inputTokens": input_tokens,
            "outputTokens": output_tokens,
            "totalTokens": total_tokens,
        }),
        AgentEvent::Error {
            message,
            code,
            timestamp_ms,
        } => serde_json::json!({
            "type": "error",
            "timestamp": timestamp_ms,
            "message": message,
            "code": code,
        }),
        AgentEvent::Thinking { .. }
        | AgentEvent::Text { .. }
        | AgentEvent::ToolCall { .. }
        | AgentEvent::ToolResult { .. }
        | AgentEvent::FinalResponse { .. } => return None,
    };
    Some(value)
}

/// Parsed CLI flags per spec.md §6: `--profile`/`-p`/`--profile=`,
/// `--session-id`, `--no-stdin`, `--json` (accepted and ignored), and
/// trailing positional tokens joined as the initial prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub profile: Option<String>,
    pub session_id: Option<String>,
    pub no_stdin: bool,
    pub initial_prompt: Option<String>,
}

pub fn parse_cli_args<I: IntoIterator<Item = String>>(args: I) -> CliArgs {
    let mut parsed = CliArgs::default();
    let mut positional = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--profile" | "-p" => parsed.profile = iter.next(),
            "--session-id" => parsed.session_id = iter.next(),
            "--no-stdin" => parsed.no_stdin = true,
            "--json" => {}
            other if other.starts_with("--profile=") => {
                parsed.profile = Some(other["--profile=".len()..].to_string());
            }
            other => positional.push(other.to_string()),
        }
    }

    if !positional.is_empty() {
        parsed.initial_prompt = Some(positional.join(" "));
    }

    parsed
}

/// Static identity fields echoed on every envelope for one headless run.
#[derive(Debug, Clone)]
pub struct HeadlessSession {
    pub session_id: String,
    pub profile: String,
    pub version: String,
    pub working_dir: String,
    pub workspace_context: Option<String>,
}

/// Drives `agent` through every queued prompt, writing one JSON envelope
/// per line to `writer`. The prompt queue is seeded with
/// `args.initial_prompt` (if any) and, unless `args.no_stdin`, fed by a
/// background task reading stdin line-by-line; prompts are processed
/// strictly one at a time (the `Agent`'s own `AlreadyRunning` guard is a
/// second line of defense, not the primary serialization mechanism).
/// Returns once the queue is exhausted and stdin has reached EOF.
pub async fn run<W: AsyncWrite + Unpin>(
    mut writer: W,
    session: HeadlessSession,
    manifest: Value,
    args: CliArgs,
    mut agent: Agent,
) -> std::io::Result<()> {
    write_envelope(
        &mut writer,
        &Envelope::Session {
            session_id: session.session_id.clone(),
            profile: session.profile.clone(),
            manifest,
            working_dir: session.working_dir.clone(),
            workspace_context: session.workspace_context.clone(),
            version: session.version.clone(),
        },
    )
    .await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    if let Some(prompt) = &args.initial_prompt {
        let _ = tx.send(prompt.clone());
    }

    let stdin_task = if args.no_stdin {
        None
    } else {
        let tx = tx.clone();
        Some(tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        }))
    };
    drop(tx);

    let mut run_counter = 0u64;
    while let Some(prompt) = rx.recv().await {
        run_counter += 1;
        let run_id = format!("run-{run_counter}");

        write_envelope(
            &mut writer,
            &Envelope::UserInput {
                session_id: session.session_id.clone(),
                profile: session.profile.clone(),
                run_id: run_id.clone(),
                content: prompt.clone(),
            },
        )
        .await?;

        let stream = agent.query_stream(prompt);
        futures_util::pin_mut!(stream);

        let mut failed = false;
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    if let Some(event_json) = agent_event_to_json(&event) {
                        write_envelope(
                            &mut writer,
                            &Envelope::AgentEvent {
                                session_id: session.session_id.clone(),
                                profile: session.profile.clone(),
                                run_id: run_id.clone(),
                                event: event_json,
                            },
                        )
                        .await?;
                    }
                }
                Err(err) => {
                    write_envelope(
                        &mut writer,
                        &Envelope::Error {
                            session_id: session.session_id.clone(),
                            profile: session.profile.clone(),
                            run_id: Some(run_id.clone()),
                            message: err.to_string(),
                        },
                    )
                    .await?;
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            write_envelope(
                &mut writer,
                &Envelope::RunComplete {
                    session_id: session.session_id.clone(),
                    profile: session.profile.clone(),
                    run_id,
                },
            )
            .await?;
        }
    }

    if let Some(task) = stdin_task {
        task.abort();
    }

    Ok(())
}

async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(envelope).expect("envelope always serializes to JSON");
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::ProviderError;
    use crate::llm::{
        ChatModel, ModelCompletion, ModelMessage, ModelToolChoice, ModelToolDefinition,
    };

    #[test]
    fn parse_cli_args_reads_profile_flag_forms() {
        let args = parse_cli_args(
            ["--profile", "careful"].iter().map(|s| s.to_string()),
        );
        assert_eq!(args.profile.as_deref(), Some("careful"));

        let args = parse_cli_args(["-p", "careful"].iter().map(|s| s.to_string()));
        assert_eq!(args.profile.as_deref(), Some("careful"));

        let args = parse_cli_args(["--profile=careful"].iter().map(|s| s.to_string()));
        assert_eq!(args.profile.as_deref(), Some("careful"));
    }

    #[test]
    fn parse_cli_args_joins_trailing_positionals_as_initial_prompt() {
        let args = parse_cli_args(
            ["--no-stdin", "summarize", "this", "repo"]
                .iter()
                .map(|s| s.to_string()),
        );
        assert!(args.no_stdin);
        assert_eq!(args.initial_prompt.as_deref(), Some("summarize this repo"));
    }

    #[test]
    fn parse_cli_args_ignores_json_flag() {
        let args = parse_cli_args(["--json", "hello"].iter().map(|s| s.to_string()));
        assert_eq!(args.initial_prompt.as_deref(), Some("hello"));
    }

    #[test]
    fn agent_event_to_json_skips_narration_only_variants() {
        assert!(agent_event_to_json(&AgentEvent::Text {
            content: "hi".to_string()
        })
        .is_none());
        assert!(agent_event_to_json(&AgentEvent::FinalResponse {
            content: "done".to_string()
        })
        .is_none());
    }

    #[test]
    fn agent_event_to_json_maps_tool_start_fields() {
        let value = agent_event_to_json(&AgentEvent::ToolStart {
            name: "read_file".to_string(),
            id: "call_1".to_string(),
            params: json!({"path": "a.rs"}),
            timestamp_ms: 42,
        })
        .expect("tool.start maps");

        assert_eq!(value["type"], "tool.start");
        assert_eq!(value["name"], "read_file");
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn envelope_serializes_with_kebab_tag_and_camel_case_fields() {
        let envelope = Envelope::UserInput {
            session_id: "s1".to_string(),
            profile: "default".to_string(),
            run_id: "run-1".to_string(),
            content: "hi".to_string(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "user-input");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["runId"], "run-1");
    }

    #[derive(Default)]
    struct ScriptedModel {
        responses: Mutex<VecDeque<Result<ModelCompletion, ProviderError>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<ModelCompletion, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from(responses)),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn invoke(
            &self,
            _messages: &[ModelMessage],
            _tools: &[ModelToolDefinition],
            _tool_choice: ModelToolChoice,
        ) -> Result<ModelCompletion, ProviderError> {
            let mut guard = self.responses.lock().expect("lock poisoned");
            guard.pop_front().unwrap_or_else(|| {
                Err(ProviderError::Response(
                    "scripted model exhausted responses".to_string(),
                ))
            })
        }
    }

    #[tokio::test]
    async fn run_emits_session_user_input_and_run_complete_for_one_prompt() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let agent = Agent::builder()
            .model(ScriptedModel::new(vec![Ok(ModelCompletion {
                text: Some("hello back".to_string()),
                thinking: None,
                tool_calls: vec![],
                usage: None,
            })]))
            .build()
            .expect("agent builds");

        let args = CliArgs {
            no_stdin: true,
            initial_prompt: Some("hi".to_string()),
            ..Default::default()
        };
        let session = HeadlessSession {
            session_id: "sess-1".to_string(),
            profile: "default".to_string(),
            version: "0.1.1".to_string(),
            working_dir: "/workspace".to_string(),
            workspace_context: None,
        };

        let driver = tokio::spawn(run(client, session, json!({}), args, agent));

        let mut lines = BufReader::new(server).lines();
        let mut collected = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push(line);
        }
        driver.await.expect("task joins").expect("run succeeds");

        let parsed: Vec<Value> = collected
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(parsed[0]["type"], "session");
        assert_eq!(parsed[1]["type"], "user-input");
        assert!(parsed
            .iter()
            .any(|envelope| envelope["type"] == "agent-event"
                && envelope["event"]["type"] == "message.complete"));
        assert_eq!(parsed.last().unwrap()["type"], "run-complete");
    }
}
