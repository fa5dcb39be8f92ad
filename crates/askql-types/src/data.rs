use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SchemaDescriptor {
    pub data_source_id: String,
    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

impl SchemaDescriptor {
    /// One line per table, `name(col type, ...)`, for planner context.
    pub fn to_prompt_text(&self) -> String {
        if self.tables.is_empty() {
            return format!("data source `{}` has no tables", self.data_source_id);
        }
        let mut lines = vec![format!("data source `{}`:", self.data_source_id)];
        for table in &self.tables {
            let columns = table
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.data_type))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("- {}({})", table.name, columns));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The single value of a one-row, one-column result.
    pub fn scalar(&self) -> Option<&Value> {
        if self.columns.len() == 1 && self.rows.len() == 1 {
            self.rows[0].first()
        } else {
            None
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn to_table(&self, max_rows: usize) -> TableData {
        TableData {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(max_rows).cloned().collect(),
            total_rows: self.rows.len(),
            truncated: self.rows.len() > max_rows,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableData {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    pub total_rows: usize,
    #[serde(default)]
    pub truncated: bool,
}

impl TableData {
    pub fn capped(&self, max_rows: usize) -> TableData {
        if self.rows.len() <= max_rows {
            return self.clone();
        }
        TableData {
            columns: self.columns.clone(),
            rows: self.rows[..max_rows].to_vec(),
            total_rows: self.total_rows.max(self.rows.len()),
            truncated: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
    Scatter,
    Area,
}

impl ChartKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bar" | "column" | "histogram" => Some(Self::Bar),
            "line" | "trend" | "timeseries" => Some(Self::Line),
            "pie" | "donut" | "doughnut" => Some(Self::Pie),
            "scatter" | "point" => Some(Self::Scatter),
            "area" => Some(Self::Area),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartConfig {
    pub chart_index: u32,
    pub chart_type: ChartKind,
    #[serde(default)]
    pub title: String,
    pub x_field: String,
    pub y_fields: Vec<String>,
    #[serde(default)]
    pub data: Vec<Value>,
}
