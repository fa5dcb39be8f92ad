use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use askql_types::{ModelInfo, ProviderInfo, ToolSchema};

pub mod scripted;

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String>;
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let response = self.complete(&prompt, model_override).await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(response)),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: None,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    /// Registry over already-built providers, first one is the default.
    pub fn from_providers(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn reload(&self, config: ProvidersConfig) {
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn complete_for_provider(
        &self,
        provider_id: Option<&str>,
        prompt: &str,
        model_id: Option<&str>,
    ) -> anyhow::Result<String> {
        let provider = self.select_provider(provider_id).await?;
        provider.complete(prompt, model_id).await
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select_provider(provider_id).await?;
        provider.stream(messages, model_id, tools, cancel).await
    }

    pub async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
            tracing::warn!(
                "default provider `{}` is not configured, falling back to the first provider",
                default_id
            );
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_provider(
        config,
        &mut providers,
        "ollama",
        "Ollama",
        "http://127.0.0.1:11434/v1",
        "qwen2.5:7b",
        false,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "deepseek",
        "DeepSeek",
        "https://api.deepseek.com/v1",
        "deepseek-chat",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "qwen",
        "Qwen (DashScope)",
        "https://dashscope.aliyuncs.com/compatible-mode/v1",
        "qwen-plus",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );

    providers
}

fn add_openai_provider(
    config: &ProvidersConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    providers.push(Arc::new(OpenAICompatibleProvider {
        id: id.to_string(),
        name: name.to_string(),
        base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
        api_key: if use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(id))
        } else {
            None
        },
        default_model: entry
            .default_model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

pub fn provider_api_key_env(id: &str) -> Option<&'static str> {
    match id {
        "openai" => Some("OPENAI_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        "qwen" => Some("DASHSCOPE_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        _ => None,
    }
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = provider_api_key_env(id)?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if self.id == "openrouter" {
            req = req.header("X-Title", "askql");
        }
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }

    fn model<'a>(&'a self, model_override: Option<&'a str>) -> &'a str {
        model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String> {
        let model = self.model(model_override);
        let response = self
            .request(&json!({
                "model": model,
                "messages": [{"role":"user","content": prompt}],
                "stream": false,
            }))
            .send()
            .await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }
        if let Some(text) = extract_openai_text(&value) {
            return Ok(text);
        }

        let body_preview = truncate_for_error(&value.to_string(), 500);
        anyhow::bail!(
            "provider returned no completion content for model `{}` (response: {})",
            model,
            body_preview
        );
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = self.model(model_override);
        let wire_messages = messages
            .into_iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();

        let wire_tools = tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": true,
        });
        if !wire_tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let resp = self.request(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                let key_hint = provider_api_key_env(&self.id).unwrap_or("provider API key");
                anyhow::bail!(
                    "provider authentication failed ({}) for `{}`. Set `{}` and retry.",
                    status,
                    self.id,
                    key_hint
                );
            }
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut call_ids: HashMap<u64, String> = HashMap::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }

                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            for id in call_ids.drain().map(|(_, id)| id) {
                                yield StreamChunk::ToolCallEnd { id };
                            }
                            yield StreamChunk::Done {
                                finish_reason: "stop".to_string(),
                                usage: None,
                            };
                            continue;
                        }

                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };

                        if let Some(detail) = extract_openai_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }

                        for chunk in parse_openai_delta(&value, &mut call_ids) {
                            yield chunk;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Turns one streamed `chat.completion.chunk` into chunks. Follow-up tool
/// call deltas carry only an `index`, so ids are remembered per index.
fn parse_openai_delta(
    value: &serde_json::Value,
    call_ids: &mut HashMap<u64, String>,
) -> Vec<StreamChunk> {
    let mut out = Vec::new();
    let choices = value
        .get("choices")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for choice in choices {
        let delta = choice.get("delta").cloned().unwrap_or_default();

        if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !reasoning.is_empty() {
                out.push(StreamChunk::ReasoningDelta(reasoning.to_string()));
            }
        }
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                out.push(StreamChunk::TextDelta(text.to_string()));
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for call in tool_calls {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let function = call.get("function").cloned().unwrap_or_default();
                let explicit_id = call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .filter(|id| !id.is_empty())
                    .map(str::to_string);
                if let Some(id) = explicit_id {
                    if !call_ids.contains_key(&index) {
                        let name = function
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        call_ids.insert(index, id.clone());
                        out.push(StreamChunk::ToolCallStart { id, name });
                    }
                }
                let Some(id) = call_ids.get(&index).cloned() else {
                    continue;
                };
                let args_delta = function
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if !args_delta.is_empty() {
                    out.push(StreamChunk::ToolCallDelta {
                        id,
                        args_delta: args_delta.to_string(),
                    });
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if !reason.is_empty() {
                let mut ended = call_ids.drain().collect::<Vec<_>>();
                ended.sort_by_key(|(index, _)| *index);
                for (_, id) in ended {
                    out.push(StreamChunk::ToolCallEnd { id });
                }
                out.push(StreamChunk::Done {
                    finish_reason: reason.to_string(),
                    usage: extract_usage(value),
                });
            }
        }
    }
    out
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_text(value: &serde_json::Value) -> Option<String> {
    let message = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"));
    if let Some(text) = message
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .filter(|t| !t.trim().is_empty())
    {
        return Some(text.to_string());
    }

    value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("text"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>) -> ProvidersConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some("sk-test".to_string()),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        ProvidersConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "deepseek"], Some("openai")));
        let provider = registry
            .select_provider(Some("deepseek"))
            .await
            .expect("provider");
        assert_eq!(provider.info().id, "deepseek");
    }

    #[tokio::test]
    async fn uses_default_provider_when_explicit_provider_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai", "qwen"], Some("qwen")));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "qwen");
    }

    #[tokio::test]
    async fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None));
        let err = registry
            .select_provider(Some("deepsek"))
            .await
            .err()
            .expect("expected error");
        assert!(err
            .to_string()
            .contains("provider `deepsek` is not configured"));
    }

    #[tokio::test]
    async fn empty_registry_reports_missing_provider() {
        let registry = ProviderRegistry::new(ProvidersConfig::default());
        let err = registry.select_provider(None).await.err().expect("error");
        assert!(err.to_string().contains("No provider configured"));
    }

    #[test]
    fn tool_call_deltas_without_id_follow_their_index() {
        let mut ids = HashMap::new();
        let first = json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"execute_sql","arguments":"{\"sql\":"}}]}}]});
        let second = json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"SELECT 1\"}"}}]}}]});
        let last = json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]});

        let mut chunks = parse_openai_delta(&first, &mut ids);
        chunks.extend(parse_openai_delta(&second, &mut ids));
        chunks.extend(parse_openai_delta(&last, &mut ids));

        assert_eq!(
            chunks,
            vec![
                StreamChunk::ToolCallStart {
                    id: "call_1".to_string(),
                    name: "execute_sql".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: "call_1".to_string(),
                    args_delta: "{\"sql\":".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: "call_1".to_string(),
                    args_delta: "\"SELECT 1\"}".to_string()
                },
                StreamChunk::ToolCallEnd {
                    id: "call_1".to_string()
                },
                StreamChunk::Done {
                    finish_reason: "tool_calls".to_string(),
                    usage: None
                },
            ]
        );
        assert!(ids.is_empty());
    }

    #[test]
    fn reasoning_content_is_split_from_text() {
        let mut ids = HashMap::new();
        let value = json!({"choices":[{"delta":{"reasoning_content":"think","content":"answer"}}]});
        assert_eq!(
            parse_openai_delta(&value, &mut ids),
            vec![
                StreamChunk::ReasoningDelta("think".to_string()),
                StreamChunk::TextDelta("answer".to_string()),
            ]
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_error("销售额", 4), "销...");
        assert_eq!(truncate_for_error("abc", 10), "abc");
    }
}
