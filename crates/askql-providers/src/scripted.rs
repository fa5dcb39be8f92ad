//! Deterministic provider for offline runs and tests. Each `stream` call pops
//! the next scripted turn; `complete` pops the next scripted completion.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use askql_types::{ModelInfo, ProviderInfo, ToolSchema};

use crate::{ChatMessage, ChunkStream, Provider, StreamChunk};

#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Chunks(Vec<StreamChunk>),
    /// The `stream` call itself fails, before any chunk.
    Fail(String),
    /// Yields the given chunks, then never finishes until cancelled.
    Hang(Vec<StreamChunk>),
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedTurn::Chunks(vec![StreamChunk::TextDelta(text.into()), done("stop")])
    }

    pub fn tool_call(name: &str, args: Value) -> Self {
        ScriptedTurn::Chunks(tool_call_chunks(None, name, args))
    }

    pub fn text_then_tool_call(text: impl Into<String>, name: &str, args: Value) -> Self {
        ScriptedTurn::Chunks(tool_call_chunks(Some(text.into()), name, args))
    }
}

fn done(reason: &str) -> StreamChunk {
    StreamChunk::Done {
        finish_reason: reason.to_string(),
        usage: None,
    }
}

fn tool_call_chunks(text: Option<String>, name: &str, args: Value) -> Vec<StreamChunk> {
    let id = format!("call_{name}");
    let mut chunks = Vec::new();
    if let Some(text) = text {
        chunks.push(StreamChunk::TextDelta(text));
    }
    chunks.push(StreamChunk::ToolCallStart {
        id: id.clone(),
        name: name.to_string(),
    });
    chunks.push(StreamChunk::ToolCallDelta {
        id: id.clone(),
        args_delta: args.to_string(),
    });
    chunks.push(StreamChunk::ToolCallEnd { id });
    chunks.push(done("tool_calls"));
    chunks
}

#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    repeat: Option<ScriptedTurn>,
    completions: Mutex<VecDeque<Result<String, String>>>,
    seen_messages: Mutex<Vec<Vec<ChatMessage>>>,
    seen_prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_turn(self, turn: ScriptedTurn) -> Self {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
        self
    }

    /// Turn replayed once the queue is empty.
    pub fn repeating(mut self, turn: ScriptedTurn) -> Self {
        self.repeat = Some(turn);
        self
    }

    pub fn with_completion(self, text: impl Into<String>) -> Self {
        if let Ok(mut completions) = self.completions.lock() {
            completions.push_back(Ok(text.into()));
        }
        self
    }

    pub fn with_failed_completion(self, error: impl Into<String>) -> Self {
        if let Ok(mut completions) = self.completions.lock() {
            completions.push_back(Err(error.into()));
        }
        self
    }

    pub fn seen_messages(&self) -> Vec<Vec<ChatMessage>> {
        self.seen_messages
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    pub fn seen_prompts(&self) -> Vec<String> {
        self.seen_prompts
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let queued = self
            .turns
            .lock()
            .ok()
            .and_then(|mut turns| turns.pop_front());
        queued.or_else(|| self.repeat.clone())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "scripted-1".to_string(),
                provider_id: "scripted".to_string(),
                display_name: "Scripted Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn complete(&self, prompt: &str, _model_override: Option<&str>) -> anyhow::Result<String> {
        if let Ok(mut seen) = self.seen_prompts.lock() {
            seen.push(prompt.to_string());
        }
        let next = self
            .completions
            .lock()
            .ok()
            .and_then(|mut completions| completions.pop_front());
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(error)) => anyhow::bail!(error),
            None => anyhow::bail!("scripted provider has no completion left"),
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        if let Ok(mut seen) = self.seen_messages.lock() {
            seen.push(messages);
        }
        match self.next_turn() {
            Some(ScriptedTurn::Chunks(chunks)) => {
                let items = chunks
                    .into_iter()
                    .map(Ok::<StreamChunk, anyhow::Error>)
                    .collect::<Vec<_>>();
                Ok(Box::pin(futures::stream::iter(items)))
            }
            Some(ScriptedTurn::Fail(error)) => anyhow::bail!(error),
            Some(ScriptedTurn::Hang(chunks)) => {
                let stream = async_stream::stream! {
                    for chunk in chunks {
                        yield Ok::<StreamChunk, anyhow::Error>(chunk);
                    }
                    cancel.cancelled().await;
                    yield Ok(done("cancelled"));
                };
                Ok(Box::pin(stream))
            }
            None => anyhow::bail!("scripted provider has no turn left"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn turns_are_consumed_in_order_then_repeat() {
        let provider = ScriptedProvider::new()
            .with_turn(ScriptedTurn::text("first"))
            .repeating(ScriptedTurn::tool_call("get_schema", json!({})));

        let mut first = provider
            .stream(vec![], None, None, CancellationToken::new())
            .await
            .expect("stream");
        let chunk = first.next().await.expect("chunk").expect("ok");
        assert_eq!(chunk, StreamChunk::TextDelta("first".to_string()));

        for _ in 0..2 {
            let chunks = provider
                .stream(vec![], None, None, CancellationToken::new())
                .await
                .expect("stream")
                .collect::<Vec<_>>()
                .await;
            assert!(chunks.iter().any(|c| matches!(
                c,
                Ok(StreamChunk::ToolCallStart { name, .. }) if name == "get_schema"
            )));
        }
        assert_eq!(provider.seen_messages().len(), 3);
    }

    #[tokio::test]
    async fn hang_ends_once_cancelled() {
        let provider = ScriptedProvider::new().with_turn(ScriptedTurn::Hang(vec![]));
        let cancel = CancellationToken::new();
        let mut stream = provider
            .stream(vec![], None, None, cancel.clone())
            .await
            .expect("stream");
        cancel.cancel();
        let chunk = stream.next().await.expect("chunk").expect("ok");
        assert!(matches!(chunk, StreamChunk::Done { finish_reason, .. } if finish_reason == "cancelled"));
    }

    #[tokio::test]
    async fn completions_record_prompts() {
        let provider = ScriptedProvider::new()
            .with_completion("SELECT 1")
            .with_failed_completion("rate limited");
        assert_eq!(provider.complete("fix it", None).await.expect("ok"), "SELECT 1");
        assert!(provider.complete("again", None).await.is_err());
        assert_eq!(provider.seen_prompts(), vec!["fix it", "again"]);
    }
}
