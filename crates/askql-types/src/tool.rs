use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{StepContentType, StepStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The closed set of capabilities the planner may invoke.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ToolTag {
    #[serde(rename = "ExecuteSQL", alias = "execute_sql")]
    ExecuteSql,
    #[serde(rename = "GetSchema", alias = "get_schema")]
    GetSchema,
    #[serde(rename = "GenerateChart", alias = "generate_chart")]
    GenerateChart,
}

impl ToolTag {
    pub const ALL: [ToolTag; 3] = [ToolTag::GetSchema, ToolTag::ExecuteSql, ToolTag::GenerateChart];

    /// Function name advertised to the planner.
    pub fn function_name(self) -> &'static str {
        match self {
            ToolTag::ExecuteSql => "execute_sql",
            ToolTag::GetSchema => "get_schema",
            ToolTag::GenerateChart => "generate_chart",
        }
    }

    pub fn from_function_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "execute_sql" | "executesql" | "run_sql" | "sql_query" | "query" => {
                Some(ToolTag::ExecuteSql)
            }
            "get_schema" | "getschema" | "describe_schema" | "schema" => Some(ToolTag::GetSchema),
            "generate_chart" | "generatechart" | "create_chart" | "chart" => {
                Some(ToolTag::GenerateChart)
            }
            _ => None,
        }
    }

    pub fn step_title(self) -> &'static str {
        match self {
            ToolTag::ExecuteSql => "Run SQL query",
            ToolTag::GetSchema => "Inspect schema",
            ToolTag::GenerateChart => "Generate chart",
        }
    }

    pub fn content_type(self) -> StepContentType {
        match self {
            ToolTag::ExecuteSql => StepContentType::Sql,
            ToolTag::GetSchema => StepContentType::Text,
            ToolTag::GenerateChart => StepContentType::Chart,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub step_number: u32,
    pub tool: ToolTag,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub status: StepStatus,
}
