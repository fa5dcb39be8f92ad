use serde_json::{json, Value};

use askql_types::{ChartConfig, RowSet, SchemaDescriptor, ToolSchema, ToolTag};

pub mod chart;
pub mod datasource;
pub mod sql_guard;
pub mod sqlite;

pub use chart::{build_charts, ChartRequest, ChartSpec};
pub use datasource::{DataSource, DataSourceRegistry, ExecutionError};
pub use sql_guard::{
    validate_sql, DenyReason, SqlDialect, SqlGuardPolicy, SqlVerdict, ValidatedSql,
};
pub use sqlite::SqliteDataSource;

/// Argument and lookup failures of a tool call. These are reported back to
/// the planner and never consume repair attempts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown data source `{0}`")]
    UnknownDataSource(String),
    #[error("no data source is configured")]
    NoDataSource,
    #[error("schema lookup failed: {0}")]
    Schema(String),
    #[error("there is no successful query result to chart")]
    NothingToChart,
}

/// A parsed planner tool call. The set is closed; dispatch is a `match`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    GetSchema {
        data_source_id: Option<String>,
    },
    ExecuteSql {
        data_source_id: Option<String>,
        sql: String,
    },
    GenerateChart(ChartRequest),
}

impl ToolInvocation {
    pub fn parse(name: &str, args: Value) -> Result<Self, ToolError> {
        let tag = ToolTag::from_function_name(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args = normalize_args(args);
        match tag {
            ToolTag::GetSchema => Ok(ToolInvocation::GetSchema {
                data_source_id: data_source_arg(&args),
            }),
            ToolTag::ExecuteSql => {
                let sql = match &args {
                    Value::String(raw) => Some(raw.clone()),
                    _ => args
                        .get("sql")
                        .or_else(|| args.get("query"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                };
                let sql = sql
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| ToolError::InvalidArguments("missing `sql`".to_string()))?;
                Ok(ToolInvocation::ExecuteSql {
                    data_source_id: data_source_arg(&args),
                    sql,
                })
            }
            ToolTag::GenerateChart => serde_json::from_value::<ChartRequest>(args)
                .map(ToolInvocation::GenerateChart)
                .map_err(|err| ToolError::InvalidArguments(err.to_string())),
        }
    }
}

/// Planner arguments arrive as an object, a JSON-encoded string, or nothing.
fn normalize_args(args: Value) -> Value {
    match args {
        Value::Null => json!({}),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                json!({})
            } else if let Ok(parsed @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
                parsed
            } else {
                Value::String(raw)
            }
        }
        other => other,
    }
}

fn data_source_arg(args: &Value) -> Option<String> {
    ["data_source_id", "dataSourceId", "data_source"]
        .iter()
        .find_map(|key| args.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The closed tool set offered to the planner, bound to the data sources it
/// may read.
#[derive(Clone)]
pub struct ToolRegistry {
    data_sources: DataSourceRegistry,
}

impl ToolRegistry {
    pub fn new(data_sources: DataSourceRegistry) -> Self {
        Self { data_sources }
    }

    pub fn data_sources(&self) -> &DataSourceRegistry {
        &self.data_sources
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = ToolTag::ALL.iter().map(|tag| tool_schema(*tag)).collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn resolve_data_source(
        &self,
        requested: Option<&str>,
        allowed: &[String],
    ) -> Result<String, ToolError> {
        self.data_sources.resolve(requested, allowed).await
    }

    pub async fn get_schema(&self, data_source_id: &str) -> Result<SchemaDescriptor, ToolError> {
        self.data_sources.get_schema(data_source_id).await
    }

    pub async fn execute_sql(
        &self,
        data_source_id: &str,
        sql: &ValidatedSql,
    ) -> Result<RowSet, ExecutionError> {
        self.data_sources.execute_readonly(data_source_id, sql).await
    }

    pub fn generate_charts(
        &self,
        request: &ChartRequest,
        rows: Option<&RowSet>,
    ) -> Result<Vec<ChartConfig>, ToolError> {
        let rows = rows.ok_or(ToolError::NothingToChart)?;
        build_charts(request, rows)
    }
}

fn tool_schema(tag: ToolTag) -> ToolSchema {
    let data_source = json!({
        "type": "string",
        "description": "Data source id. Optional when the question targets a single source."
    });
    let (description, input_schema) = match tag {
        ToolTag::GetSchema => (
            "List the tables and columns of a data source.",
            json!({
                "type": "object",
                "properties": {"data_source_id": data_source},
            }),
        ),
        ToolTag::ExecuteSql => (
            "Run one read-only SELECT query and return its rows.",
            json!({
                "type": "object",
                "properties": {
                    "sql": {"type": "string", "description": "A single SELECT or WITH query."},
                    "data_source_id": data_source,
                },
                "required": ["sql"],
            }),
        ),
        ToolTag::GenerateChart => {
            let chart = json!({
                "type": "object",
                "properties": {
                    "chart_type": {"type": "string", "enum": ["bar", "line", "pie", "scatter", "area"]},
                    "x_field": {"type": "string"},
                    "y_fields": {"type": "array", "items": {"type": "string"}},
                    "title": {"type": "string"},
                },
            });
            let mut schema = chart.clone();
            schema["properties"]["charts"] = json!({
                "type": "array",
                "description": "Several charts over the last query result.",
                "items": chart,
            });
            (
                "Plot the most recent query result as one or more charts.",
                schema,
            )
        }
    };
    ToolSchema {
        name: tag.function_name().to_string(),
        description: description.to_string(),
        input_schema,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };
    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }
    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    Ok(())
}
