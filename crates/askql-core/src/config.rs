use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use askql_providers::{ProviderConfig, ProvidersConfig};
use askql_tools::SqlGuardPolicy;

use crate::history::{default_strip_rules, StripRule};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 39740;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub max_repair_attempts: u32,
    pub llm_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub llm_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    pub table_row_limit: usize,
    pub history_limit: usize,
    pub strip_rules: Vec<StripRule>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_repair_attempts: 2,
            llm_retry_attempts: 2,
            retry_backoff_ms: 500,
            llm_timeout_ms: 60_000,
            tool_timeout_ms: 30_000,
            table_row_limit: 100,
            history_limit: 20,
            strip_rules: default_strip_rules(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSourceConfig {
    pub id: String,
    #[serde(default)]
    pub kind: DataSourceKind,
    pub path: PathBuf,
    #[serde(default)]
    pub max_rows: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_retention_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sql: SqlGuardPolicy,
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: project file, then environment, then CLI
/// overrides. Later layers win key by key.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let project = read_json_file(&project_path).await?;
        let layers = ConfigLayers {
            project,
            env: env_layer(|key| std::env::var(key).ok()),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid configuration, using defaults: {}", err);
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "project": redact_provider_keys(&layers.project),
            "env": redact_provider_keys(&layers.env),
            "cli": layers.cli,
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let mut snapshot = self.layers.read().await.project.clone();
        strip_provider_keys(&mut snapshot);
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!("ignoring unreadable config {}: {}", path.display(), err);
            Ok(empty_object())
        }
    }
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Keys that come from the environment are never written to disk.
fn strip_provider_keys(value: &mut Value) {
    let Some(providers) = value.get_mut("providers").and_then(Value::as_object_mut) else {
        return;
    };
    for (provider_id, cfg) in providers.iter_mut() {
        let Some(cfg) = cfg.as_object_mut() else {
            continue;
        };
        let has_env_key = askql_providers::provider_api_key_env(provider_id)
            .and_then(|key| std::env::var(key).ok())
            .is_some_and(|v| !v.trim().is_empty());
        if has_env_key {
            cfg.remove("api_key");
        }
    }
}

fn redact_provider_keys(value: &Value) -> Value {
    let mut out = value.clone();
    if let Some(providers) = out.get_mut("providers").and_then(Value::as_object_mut) {
        for cfg in providers.values_mut() {
            if let Some(key) = cfg.get_mut("api_key") {
                *key = json!("***");
            }
        }
    }
    out
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(provider) = present("ASKQL_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider.trim() }));
    }
    if let Some(model) = present("ASKQL_MODEL") {
        deep_merge(&mut root, &json!({ "default_model": model.trim() }));
    }
    for (env_key, field) in [
        ("ASKQL_MAX_ITERATIONS", "max_iterations"),
        ("ASKQL_MAX_REPAIR_ATTEMPTS", "max_repair_attempts"),
        ("ASKQL_LLM_TIMEOUT_MS", "llm_timeout_ms"),
        ("ASKQL_TOOL_TIMEOUT_MS", "tool_timeout_ms"),
    ] {
        let Some(raw) = present(env_key) else {
            continue;
        };
        match raw.trim().parse::<u64>() {
            Ok(value) => deep_merge(&mut root, &json!({ "agent": { field: value } })),
            Err(_) => tracing::warn!("ignoring non-numeric {}={}", env_key, raw),
        }
    }

    for (provider, key_env, url, model) in [
        ("openai", "OPENAI_API_KEY", "https://api.openai.com/v1", "gpt-4o-mini"),
        ("deepseek", "DEEPSEEK_API_KEY", "https://api.deepseek.com/v1", "deepseek-chat"),
        (
            "qwen",
            "DASHSCOPE_API_KEY",
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
            "qwen-plus",
        ),
        (
            "openrouter",
            "OPENROUTER_API_KEY",
            "https://openrouter.ai/api/v1",
            "openai/gpt-4o-mini",
        ),
    ] {
        if let Some(api_key) = present(key_env) {
            deep_merge(
                &mut root,
                &json!({
                    "providers": {
                        provider: {
                            "api_key": api_key,
                            "url": url,
                            "default_model": model
                        }
                    }
                }),
            );
        }
    }
    if let Some(ollama_url) = present("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "ollama": {
                        "url": ollama_url,
                        "default_model": "qwen2.5:7b"
                    }
                }
            }),
        );
    }

    root
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
