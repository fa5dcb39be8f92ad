use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::RwLock;

use askql_core::{
    AppConfig, ConfigStore, DataSourceKind, ModelTarget, Orchestrator, QueryEngine, SessionStore,
};
use askql_observability::ProcessKind;
use askql_providers::ProviderRegistry;
use askql_tools::{DataSourceRegistry, SqliteDataSource, ToolRegistry};

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub engine: QueryEngine,
    pub runs: RunRegistry,
    pub config: ConfigStore,
}

impl AppState {
    pub fn new(engine: QueryEngine, config: ConfigStore) -> Self {
        Self {
            engine,
            runs: RunRegistry::new(),
            config,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub run_id: String,
    pub started_at_ms: u64,
}

/// One run per session at a time.
#[derive(Clone, Default)]
pub struct RunRegistry {
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &str) -> Option<ActiveRun> {
        self.active.read().await.get(session_id).cloned()
    }

    /// `Err` carries the run already holding the session.
    pub async fn acquire(&self, session_id: &str, run_id: String) -> Result<ActiveRun, ActiveRun> {
        let mut guard = self.active.write().await;
        if let Some(existing) = guard.get(session_id).cloned() {
            return Err(existing);
        }
        let run = ActiveRun {
            run_id,
            started_at_ms: now_ms(),
        };
        guard.insert(session_id.to_string(), run.clone());
        Ok(run)
    }

    pub async fn finish_if_match(&self, session_id: &str, run_id: &str) -> Option<ActiveRun> {
        let mut guard = self.active.write().await;
        if guard.get(session_id).is_some_and(|run| run.run_id == run_id) {
            return guard.remove(session_id);
        }
        None
    }

    /// Guard that frees the session if the run task ends without calling
    /// [`RunRelease::finish`], panics included.
    pub fn release_on_drop(&self, session_id: &str, run: &ActiveRun) -> RunRelease {
        RunRelease {
            runs: self.clone(),
            session_id: session_id.to_string(),
            run_id: run.run_id.clone(),
            armed: true,
        }
    }

    pub async fn len(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.active.read().await.is_empty()
    }
}

pub struct RunRelease {
    runs: RunRegistry,
    session_id: String,
    run_id: String,
    armed: bool,
}

impl RunRelease {
    pub async fn finish(mut self) {
        self.armed = false;
        self.runs
            .finish_if_match(&self.session_id, &self.run_id)
            .await;
    }
}

impl Drop for RunRelease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let runs = self.runs.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let run_id = std::mem::take(&mut self.run_id);
        tracing::warn!("run {} for session {} ended abnormally", run_id, session_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    runs.finish_if_match(&session_id, &run_id).await;
                });
            }
            Err(_) => {
                if let Ok(mut active) = runs.active.try_write() {
                    if active.get(&session_id).is_some_and(|run| run.run_id == run_id) {
                        active.remove(&session_id);
                    }
                }
            }
        }
    }
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Opens the configured data sources and session store and wires the
/// query engine around them.
pub async fn build_engine(
    config: &AppConfig,
    state_dir: &Path,
    process: ProcessKind,
) -> anyhow::Result<QueryEngine> {
    let sources = DataSourceRegistry::new();
    for ds in &config.data_sources {
        match ds.kind {
            DataSourceKind::Sqlite => {
                let mut source = SqliteDataSource::open_readonly(ds.id.clone(), &ds.path)
                    .with_context(|| format!("opening data source `{}`", ds.id))?;
                if let Some(max_rows) = ds.max_rows {
                    source = source.with_max_rows(max_rows);
                }
                sources.register(Arc::new(source)).await;
            }
        }
        tracing::info!("registered data source {} ({})", ds.id, ds.path.display());
    }
    if config.data_sources.is_empty() {
        tracing::warn!("no data sources configured; queries will fail until one is added");
    }

    let providers = ProviderRegistry::new(config.providers_config());
    let orchestrator = Orchestrator::new(
        providers,
        ToolRegistry::new(sources),
        config.agent.clone(),
        config.sql.clone(),
    )
    .with_default_target(ModelTarget {
        provider_id: config.default_provider.clone(),
        model_id: config.default_model.clone(),
    })
    .with_process(process);

    let sessions = SessionStore::open(state_dir.join("sessions")).await?;
    Ok(QueryEngine::new(orchestrator, Arc::new(sessions)))
}
