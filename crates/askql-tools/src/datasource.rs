use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use askql_types::{RowSet, SchemaDescriptor};

use crate::sql_guard::{SqlDialect, ValidatedSql};
use crate::ToolError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The database rejected or failed the statement. The message is the
    /// driver's own text and is what the repair prompt receives.
    #[error("{0}")]
    Query(String),
    #[error("data source `{0}` is unavailable: {1}")]
    Unavailable(String, String),
}

/// A queryable external store. Implementations must refuse writes on their
/// own as a second line behind the SQL validator.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn id(&self) -> &str;

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Generic
    }

    async fn get_schema(&self) -> anyhow::Result<SchemaDescriptor>;

    /// Runs one statement. Dropping the returned future must abort that
    /// statement and nothing else; runs cancel or time out by dropping it.
    async fn execute_readonly(&self, sql: &str) -> Result<RowSet, ExecutionError>;
}

#[derive(Clone, Default)]
pub struct DataSourceRegistry {
    sources: Arc<RwLock<HashMap<String, Arc<dyn DataSource>>>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, source: Arc<dyn DataSource>) {
        let id = source.id().to_string();
        tracing::info!("registered data source `{}`", id);
        self.sources.write().await.insert(id, source);
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids = self.sources.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn get(&self, id: &str) -> Result<Arc<dyn DataSource>, ToolError> {
        self.sources
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ToolError::UnknownDataSource(id.to_string()))
    }

    /// Picks the data source for a tool call. `requested` comes from the
    /// planner and must belong to `allowed` (the run's ids) when that list is
    /// non-empty; without a request the first allowed id wins, then the only
    /// registered source.
    pub async fn resolve(
        &self,
        requested: Option<&str>,
        allowed: &[String],
    ) -> Result<String, ToolError> {
        let requested = requested.map(str::trim).filter(|id| !id.is_empty());
        if let Some(id) = requested {
            if !allowed.is_empty() && !allowed.iter().any(|a| a == id) {
                return Err(ToolError::UnknownDataSource(id.to_string()));
            }
            self.get(id).await?;
            return Ok(id.to_string());
        }
        if let Some(first) = allowed.first() {
            self.get(first).await?;
            return Ok(first.clone());
        }
        let ids = self.ids().await;
        match ids.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(ToolError::NoDataSource),
            _ => Err(ToolError::InvalidArguments(format!(
                "several data sources are available ({}), name one with `data_source_id`",
                ids.join(", ")
            ))),
        }
    }

    pub async fn get_schema(&self, id: &str) -> Result<SchemaDescriptor, ToolError> {
        let source = self.get(id).await?;
        source
            .get_schema()
            .await
            .map_err(|err| ToolError::Schema(err.to_string()))
    }

    pub async fn execute_readonly(
        &self,
        id: &str,
        sql: &ValidatedSql,
    ) -> Result<RowSet, ExecutionError> {
        let source = self
            .get(id)
            .await
            .map_err(|err| ExecutionError::Unavailable(id.to_string(), err.to_string()))?;
        source.execute_readonly(sql.as_str()).await
    }

    pub async fn dialect(&self, id: &str) -> SqlDialect {
        match self.get(id).await {
            Ok(source) => source.dialect(),
            Err(_) => SqlDialect::Generic,
        }
    }
}
