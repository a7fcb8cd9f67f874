//! Token-budgeted history pruning and tool-output truncation.
//!
//! Every provider adapter hands back plain [`crate::llm::ModelMessage`]s;
//! this module decides when a conversation is getting too large for the
//! target model's context window and how to shrink both individual tool
//! outputs and the message list itself.

use crate::llm::{ModelMessage, ModelToolCall};

const DEFAULT_CHARS_PER_TOKEN: u32 = 3;
const FALLBACK_MAX_TOKENS: u32 = 130_000;
const FALLBACK_TARGET_TOKENS: u32 = 100_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextManagerConfig {
    pub chars_per_token: u32,
    pub max_tokens: u32,
    pub target_tokens: u32,
    pub preserve_recent_messages: usize,
    pub max_tool_output_chars: usize,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            max_tokens: FALLBACK_MAX_TOKENS,
            target_tokens: FALLBACK_TARGET_TOKENS,
            preserve_recent_messages: 10,
            max_tool_output_chars: 9_000,
        }
    }
}

/// Known context-window sizes, matched by substring against the model id.
/// Order matters: the first matching entry wins.
const CONTEXT_WINDOWS: &[(&str, u32)] = &[
    ("claude-haiku", 200_000),
    ("claude-sonnet", 200_000),
    ("claude-opus", 200_000),
    ("gemini", 1_000_000),
    ("grok", 256_000),
];

impl ContextManagerConfig {
    /// Builds a config whose token budget is derived from the named
    /// model's context window: `max = floor(window * 0.97)`,
    /// `target = floor(max * 0.75)`. Unknown models fall back to the
    /// constants 130_000 / 100_000.
    pub fn for_model(model: &str) -> Self {
        let lowered = model.to_ascii_lowercase();
        let window = CONTEXT_WINDOWS
            .iter()
            .find(|(needle, _)| lowered.contains(needle))
            .map(|(_, window)| *window);

        let (max_tokens, target_tokens) = match window {
            Some(window) => {
                let max_tokens = (window as f64 * 0.97).floor() as u32;
                let target_tokens = (max_tokens as f64 * 0.75).floor() as u32;
                (max_tokens, target_tokens)
            }
            None => (FALLBACK_MAX_TOKENS, FALLBACK_TARGET_TOKENS),
        };

        Self {
            max_tokens,
            target_tokens,
            ..Self::default()
        }
    }
}

/// `ceil(chars / chars_per_token)` plus per-call overhead for assistant
/// tool calls (`len(name) + len(canonical_json(args))`).
pub fn estimate_tokens(message: &ModelMessage, chars_per_token: u32) -> u32 {
    let chars_per_token = chars_per_token.max(1);
    let char_count = message_char_count(message);
    div_ceil(char_count, chars_per_token)
}

fn message_char_count(message: &ModelMessage) -> u32 {
    match message {
        ModelMessage::System(content) | ModelMessage::User(content) => content.len() as u32,
        ModelMessage::Assistant {
            content,
            tool_calls,
        } => {
            let text_chars = content.as_deref().map(str::len).unwrap_or(0) as u32;
            let call_chars: u32 = tool_calls.iter().map(tool_call_overhead_chars).sum();
            text_chars + call_chars
        }
        ModelMessage::ToolResult { content, .. } => content.len() as u32,
    }
}

fn tool_call_overhead_chars(call: &ModelToolCall) -> u32 {
    let args_json = serde_json::to_string(&call.arguments).unwrap_or_default();
    (call.name.len() + args_json.len()) as u32
}

fn div_ceil(numerator: u32, denominator: u32) -> u32 {
    (numerator + denominator - 1) / denominator
}

/// Truncates a tool's raw text output to fit `budget` characters, using
/// the per-tool-family strategy that best preserves the signal a model
/// needs (line-preserving head/tail for file reads, tail-biased for
/// shell output, leading-lines for search results).
pub fn truncate_tool_output(tool_name: &str, output: &str, budget: usize) -> String {
    if output.len() <= budget {
        return output.to_string();
    }

    match tool_name {
        "Read" | "read_file" => truncate_head_tail_lines(output, budget),
        "Grep" | "grep_search" | "Glob" => truncate_leading_lines(output, budget),
        "Bash" | "bash" | "execute_bash" => truncate_tail_biased(output, budget),
        _ => truncate_prefix(output, budget),
    }
}

fn truncate_head_tail_lines(output: &str, budget: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= 100 {
        return truncate_prefix(output, budget);
    }

    let marker_budget = 40;
    let body_budget = budget.saturating_sub(marker_budget).max(1);
    let head_budget = body_budget / 2;
    let tail_budget = body_budget - head_budget;

    let mut head = String::new();
    let mut head_lines = 0usize;
    for line in &lines {
        if head.len() + line.len() + 1 > head_budget {
            break;
        }
        head.push_str(line);
        head.push('\n');
        head_lines += 1;
    }

    let mut tail_collected = Vec::new();
    let mut tail_len = 0usize;
    for line in lines.iter().rev() {
        if tail_len + line.len() + 1 > tail_budget {
            break;
        }
        tail_len += line.len() + 1;
        tail_collected.push(*line);
    }
    tail_collected.reverse();
    let tail = tail_collected.join("\n");

    let kept = head_lines + tail_collected.len();
    let removed = lines.len().saturating_sub(kept);

    format!("{head}[… {removed} lines truncated …]\n{tail}")
}

fn truncate_leading_lines(output: &str, budget: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let marker_budget = 40;
    let body_budget = budget.saturating_sub(marker_budget).max(1);

    let mut kept = String::new();
    let mut kept_lines = 0usize;
    for line in &lines {
        if kept.len() + line.len() + 1 > body_budget {
            break;
        }
        kept.push_str(line);
        kept.push('\n');
        kept_lines += 1;
    }

    let removed = lines.len().saturating_sub(kept_lines);
    if removed == 0 {
        return kept;
    }
    format!("{kept}[… {removed} more results truncated …]")
}

fn truncate_tail_biased(output: &str, budget: usize) -> String {
    let marker = " […truncated…] ";
    let body_budget = budget.saturating_sub(marker.len()).max(1);
    let tail_budget = (body_budget as f64 * 0.8) as usize;
    let head_budget = body_budget - tail_budget;

    let removed_chars = output.len().saturating_sub(head_budget + tail_budget);
    let head = take_chars(output, head_budget);
    let tail = take_chars_from_end(output, tail_budget);

    format!("{head}[… {removed_chars} chars truncated …]{tail}")
}

fn truncate_prefix(output: &str, budget: usize) -> String {
    let marker_budget = 40;
    let body_budget = budget.saturating_sub(marker_budget).max(1);
    let removed = output.len().saturating_sub(body_budget);
    let kept = take_chars(output, body_budget);
    format!("{kept}[… {removed} chars truncated …]")
}

fn take_chars(text: &str, max_bytes: usize) -> String {
    let mut end = 0;
    for (index, _) in text.char_indices() {
        if index > max_bytes {
            break;
        }
        end = index;
    }
    text[..end.min(text.len())].to_string()
}

fn take_chars_from_end(text: &str, max_bytes: usize) -> String {
    let total = text.len();
    if max_bytes >= total {
        return text.to_string();
    }
    let mut start = total - max_bytes;
    while start < total && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Removes old history once the estimated token count is near the
/// target, preserving the leading system message and the most recent
/// `preserve_recent_messages` *user turns* (a turn is a user message
/// plus everything that follows it up to the next user message).
pub fn prune(
    history: &[ModelMessage],
    config: &ContextManagerConfig,
) -> (Vec<ModelMessage>, usize) {
    let total_tokens: u32 = history
        .iter()
        .map(|message| estimate_tokens(message, config.chars_per_token))
        .sum();

    if total_tokens < config.target_tokens {
        return (history.to_vec(), 0);
    }

    let leading_system = history.first().and_then(|message| match message {
        ModelMessage::System(_) => Some(message.clone()),
        _ => None,
    });
    let rest_start = if leading_system.is_some() { 1 } else { 0 };
    let rest = &history[rest_start..];

    let mut user_turns_seen = 0usize;
    let mut cut_index = rest.len();
    for (index, message) in rest.iter().enumerate().rev() {
        if matches!(message, ModelMessage::User(_)) {
            user_turns_seen += 1;
            if user_turns_seen > config.preserve_recent_messages {
                cut_index = index + 1;
                break;
            }
            cut_index = index;
        }
    }

    let kept_tail = &rest[cut_index..];
    let removed_count = rest.len() - kept_tail.len();

    if removed_count == 0 {
        return (history.to_vec(), 0);
    }

    let mut pruned = Vec::with_capacity(kept_tail.len() + 2);
    if let Some(system) = leading_system {
        pruned.push(system);
    }
    pruned.push(ModelMessage::System(format!(
        "[Context Manager: Removed {removed_count} old messages to stay within the context budget]"
    )));
    pruned.extend(kept_tail.iter().cloned());

    (pruned, removed_count)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextStats {
    pub message_count: usize,
    pub estimated_tokens: u32,
    pub percentage: f64,
    pub approaching_limit: bool,
    pub is_over_limit: bool,
}

impl ContextStats {
    pub fn compute(history: &[ModelMessage], config: &ContextManagerConfig) -> Self {
        let estimated_tokens: u32 = history
            .iter()
            .map(|message| estimate_tokens(message, config.chars_per_token))
            .sum();

        let percentage = if config.max_tokens > 0 {
            estimated_tokens as f64 / config.max_tokens as f64 * 100.0
        } else {
            0.0
        };

        Self {
            message_count: history.len(),
            estimated_tokens,
            percentage,
            approaching_limit: estimated_tokens >= config.target_tokens,
            is_over_limit: estimated_tokens >= config.max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> ModelMessage {
        ModelMessage::User(text.to_string())
    }

    fn assistant(text: &str) -> ModelMessage {
        ModelMessage::Assistant {
            content: Some(text.to_string()),
            tool_calls: vec![],
        }
    }

    #[test]
    fn for_model_applies_adaptivity_formula() {
        let config = ContextManagerConfig::for_model("claude-sonnet-4-5");
        assert_eq!(config.max_tokens, (200_000f64 * 0.97).floor() as u32);
        assert_eq!(
            config.target_tokens,
            (config.max_tokens as f64 * 0.75).floor() as u32
        );
    }

    #[test]
    fn for_model_falls_back_for_unknown_models() {
        let config = ContextManagerConfig::for_model("some-mystery-model");
        assert_eq!(config.max_tokens, FALLBACK_MAX_TOKENS);
        assert_eq!(config.target_tokens, FALLBACK_TARGET_TOKENS);
    }

    #[test]
    fn estimate_tokens_uses_char_division() {
        let message = user("abcdef");
        assert_eq!(estimate_tokens(&message, 3), 2);
    }

    #[test]
    fn estimate_tokens_includes_tool_call_overhead() {
        let message = ModelMessage::Assistant {
            content: None,
            tool_calls: vec![ModelToolCall {
                id: "1".to_string(),
                name: "search".to_string(),
                arguments: serde_json::json!({"q": "rust"}),
            }],
        };
        assert!(estimate_tokens(&message, 3) > 0);
    }

    #[test]
    fn truncate_tool_output_marks_removed_char_count() {
        let output = "x".repeat(500);
        let truncated = truncate_tool_output("default", &output, 100);
        assert!(truncated.contains("truncated"));
        assert!(truncated.len() <= 140);
    }

    #[test]
    fn truncate_tool_output_keeps_head_and_tail_for_read() {
        let lines: Vec<String> = (0..200).map(|i| format!("line {i}")).collect();
        let output = lines.join("\n");
        let truncated = truncate_tool_output("Read", &output, 400);
        assert!(truncated.starts_with("line 0"));
        assert!(truncated.contains("lines truncated"));
        assert!(truncated.trim_end().ends_with("line 199"));
    }

    #[test]
    fn prune_is_idempotent_below_threshold() {
        let config = ContextManagerConfig {
            target_tokens: 1_000_000,
            ..ContextManagerConfig::default()
        };
        let history = vec![ModelMessage::System("be helpful".to_string()), user("hi")];
        let (pruned, removed) = prune(&history, &config);
        assert_eq!(removed, 0);
        assert_eq!(pruned, history);
    }

    #[test]
    fn prune_preserves_system_message_and_recent_user_turns() {
        let config = ContextManagerConfig {
            target_tokens: 0,
            preserve_recent_messages: 1,
            chars_per_token: 3,
            ..ContextManagerConfig::default()
        };

        let history = vec![
            ModelMessage::System("be helpful".to_string()),
            user("old question"),
            assistant("old answer"),
            user("new question"),
            assistant("new answer"),
        ];

        let (pruned, removed) = prune(&history, &config);
        assert!(removed > 0);
        assert_eq!(pruned[0], ModelMessage::System("be helpful".to_string()));
        assert!(matches!(&pruned[1], ModelMessage::System(text) if text.contains("Removed")));
        assert!(pruned.iter().any(|m| m == &user("new question")));
        assert!(!pruned.iter().any(|m| m == &user("old question")));
    }

    #[test]
    fn context_stats_flags_approaching_limit() {
        let config = ContextManagerConfig {
            target_tokens: 1,
            ..ContextManagerConfig::default()
        };
        let stats = ContextStats::compute(&[user("hello world")], &config);
        assert!(stats.approaching_limit);
        assert_eq!(stats.message_count, 1);
    }
}
