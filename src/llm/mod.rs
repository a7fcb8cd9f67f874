mod anthropic;
mod google;
mod grok;
pub mod retry;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::error::ProviderError;

pub use anthropic::{AnthropicModel, AnthropicModelConfig};
pub use google::{GoogleModel, GoogleModelConfig};
pub use grok::{GrokModel, GrokModelConfig};

#[derive(Clone, Debug, PartialEq)]
#[doc(hidden)]
pub enum ModelMessage {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ModelToolCall>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Clone, Debug, PartialEq)]
#[doc(hidden)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug)]
#[doc(hidden)]
pub struct ModelToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[doc(hidden)]
pub enum ModelToolChoice {
    Auto,
    Required,
    None,
    Tool(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
#[doc(hidden)]
pub struct ModelCompletion {
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
    pub usage: Option<ModelUsage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[doc(hidden)]
pub struct ModelUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One piece of a streamed completion. Providers that speak SSE/chunked
/// transport natively can override [`ChatModel::invoke_stream`] to emit
/// these as they arrive; everything else gets a stream "for free" by the
/// trait's default, built from a single buffered [`ChatModel::invoke`] call.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamChunk {
    Thinking(String),
    Content(String),
    ToolCall(ModelToolCall),
    Usage(ModelUsage),
    Done,
}

pub type ModelStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError>;

    /// Streaming surface over [`invoke`](Self::invoke). The default buffers
    /// the full completion and replays it as a short sequence of chunks, so
    /// every adapter is streamable even before it grows real SSE support.
    async fn invoke_stream(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelStream, ProviderError> {
        let completion = self.invoke(messages, tools, tool_choice).await?;
        let mut chunks = Vec::new();
        if let Some(thinking) = completion.thinking {
            chunks.push(Ok(StreamChunk::Thinking(thinking)));
        }
        if let Some(text) = completion.text {
            chunks.push(Ok(StreamChunk::Content(text)));
        }
        for call in completion.tool_calls {
            chunks.push(Ok(StreamChunk::ToolCall(call)));
        }
        if let Some(usage) = completion.usage {
            chunks.push(Ok(StreamChunk::Usage(usage)));
        }
        chunks.push(Ok(StreamChunk::Done));
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubModel(Mutex<Option<ModelCompletion>>);

    #[async_trait]
    impl ChatModel for StubModel {
        async fn invoke(
            &self,
            _messages: &[ModelMessage],
            _tools: &[ModelToolDefinition],
            _tool_choice: ModelToolChoice,
        ) -> Result<ModelCompletion, ProviderError> {
            Ok(self.0.lock().expect("stub lock poisoned").take().unwrap())
        }
    }

    #[tokio::test]
    async fn default_invoke_stream_replays_buffered_completion() {
        let model = StubModel(Mutex::new(Some(ModelCompletion {
            text: Some("hi".to_string()),
            thinking: None,
            tool_calls: vec![],
            usage: Some(ModelUsage {
                input_tokens: 3,
                output_tokens: 1,
            }),
        })));

        let mut stream = model
            .invoke_stream(&[], &[], ModelToolChoice::Auto)
            .await
            .expect("stream built");

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.expect("chunk ok"));
        }

        assert_eq!(
            chunks,
            vec![
                StreamChunk::Content("hi".to_string()),
                StreamChunk::Usage(ModelUsage {
                    input_tokens: 3,
                    output_tokens: 1
                }),
                StreamChunk::Done,
            ]
        );
    }
}
