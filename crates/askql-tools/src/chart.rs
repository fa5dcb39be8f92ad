use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use askql_types::{ChartConfig, ChartKind, RowSet};

use crate::ToolError;

pub const MAX_CHART_POINTS: usize = 500;

/// One chart as requested by the planner. Every field is optional; missing
/// ones are inferred from the rowset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ChartSpec {
    #[serde(alias = "type")]
    pub chart_type: Option<String>,
    #[serde(alias = "x")]
    pub x_field: Option<String>,
    #[serde(alias = "y", alias = "y_field")]
    pub y_fields: YFields,
    pub title: Option<String>,
}

/// Accepts either `"y_fields": "total"` or `"y_fields": ["a", "b"]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(untagged)]
pub enum YFields {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl YFields {
    fn to_vec(&self) -> Vec<String> {
        match self {
            YFields::None => Vec::new(),
            YFields::One(field) => vec![field.clone()],
            YFields::Many(fields) => fields.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChartRequest {
    #[serde(flatten)]
    pub single: ChartSpec,
    #[serde(default)]
    pub charts: Vec<ChartSpec>,
}

impl ChartRequest {
    fn specs(&self) -> Vec<ChartSpec> {
        if self.charts.is_empty() {
            vec![self.single.clone()]
        } else {
            self.charts.clone()
        }
    }
}

/// Builds one config per requested chart, indexed from 0 in request order.
pub fn build_charts(request: &ChartRequest, rows: &RowSet) -> Result<Vec<ChartConfig>, ToolError> {
    if rows.columns.is_empty() || rows.rows.is_empty() {
        return Err(ToolError::NothingToChart);
    }
    request
        .specs()
        .iter()
        .enumerate()
        .map(|(idx, spec)| build_chart(idx as u32, spec, rows))
        .collect()
}

fn build_chart(chart_index: u32, spec: &ChartSpec, rows: &RowSet) -> Result<ChartConfig, ToolError> {
    let x_field = match spec.x_field.as_deref() {
        Some(field) => resolve_column(rows, field)?,
        None => infer_x_field(rows),
    };
    let requested_y = spec.y_fields.to_vec();
    let y_fields = if requested_y.is_empty() {
        infer_y_fields(rows, &x_field)
    } else {
        requested_y
            .iter()
            .map(|field| resolve_column(rows, field))
            .collect::<Result<Vec<_>, _>>()?
    };
    if y_fields.is_empty() {
        return Err(ToolError::InvalidArguments(
            "no numeric column to plot".to_string(),
        ));
    }

    let chart_type = match spec.chart_type.as_deref() {
        Some(raw) => ChartKind::parse(raw)
            .ok_or_else(|| ToolError::InvalidArguments(format!("unknown chart type `{raw}`")))?,
        None if is_temporal(rows, &x_field) => ChartKind::Line,
        None => ChartKind::Bar,
    };

    let mut picked = vec![x_field.clone()];
    picked.extend(y_fields.iter().cloned());
    let indices = picked
        .iter()
        .filter_map(|name| rows.column_index(name).map(|idx| (name.clone(), idx)))
        .collect::<Vec<_>>();
    let data = rows
        .rows
        .iter()
        .take(MAX_CHART_POINTS)
        .map(|row| {
            let mut point = Map::new();
            for (name, idx) in &indices {
                point.insert(name.clone(), row.get(*idx).cloned().unwrap_or(Value::Null));
            }
            Value::Object(point)
        })
        .collect::<Vec<_>>();

    let title = spec
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("{} by {}", y_fields.join(", "), x_field));

    Ok(ChartConfig {
        chart_index,
        chart_type,
        title,
        x_field,
        y_fields,
        data,
    })
}

fn resolve_column(rows: &RowSet, field: &str) -> Result<String, ToolError> {
    rows.column_index(field)
        .map(|idx| rows.columns[idx].clone())
        .ok_or_else(|| {
            ToolError::InvalidArguments(format!(
                "column `{}` is not in the result (columns: {})",
                field,
                rows.columns.join(", ")
            ))
        })
}

fn is_numeric_column(rows: &RowSet, idx: usize) -> bool {
    let mut saw_number = false;
    for row in &rows.rows {
        match row.get(idx) {
            Some(Value::Number(_)) => saw_number = true,
            Some(Value::Null) | None => {}
            Some(_) => return false,
        }
    }
    saw_number
}

fn infer_x_field(rows: &RowSet) -> String {
    (0..rows.columns.len())
        .find(|idx| !is_numeric_column(rows, *idx))
        .map(|idx| rows.columns[idx].clone())
        .unwrap_or_else(|| rows.columns[0].clone())
}

fn infer_y_fields(rows: &RowSet, x_field: &str) -> Vec<String> {
    rows.columns
        .iter()
        .enumerate()
        .filter(|(idx, name)| name.as_str() != x_field && is_numeric_column(rows, *idx))
        .map(|(_, name)| name.clone())
        .collect()
}

fn date_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\d{4}(-\d{1,2}(-\d{1,2})?)?([ T]\d{2}:\d{2}(:\d{2})?)?$").ok())
        .as_ref()
}

fn is_temporal(rows: &RowSet, field: &str) -> bool {
    let lowered = field.to_lowercase();
    if ["date", "day", "month", "year", "week", "time", "period"]
        .iter()
        .any(|hint| lowered.contains(hint))
    {
        return true;
    }
    let Some(idx) = rows.column_index(field) else {
        return false;
    };
    rows.rows
        .iter()
        .filter_map(|row| row.get(idx).and_then(|v| v.as_str()))
        .take(5)
        .any(|v| date_pattern().is_some_and(|re| re.is_match(v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn monthly() -> RowSet {
        RowSet::new(
            vec!["month".to_string(), "revenue".to_string(), "orders".to_string()],
            vec![
                vec![json!("2024-01"), json!(100.0), json!(3)],
                vec![json!("2024-02"), json!(140.0), json!(5)],
            ],
        )
    }

    #[test]
    fn infers_fields_and_line_for_time_axis() {
        let charts = build_charts(&ChartRequest::default(), &monthly()).expect("charts");
        assert_eq!(charts.len(), 1);
        let chart = &charts[0];
        assert_eq!(chart.chart_index, 0);
        assert_eq!(chart.chart_type, ChartKind::Line);
        assert_eq!(chart.x_field, "month");
        assert_eq!(chart.y_fields, vec!["revenue", "orders"]);
        assert_eq!(chart.data[1], json!({"month": "2024-02", "revenue": 140.0, "orders": 5}));
    }

    #[test]
    fn multiple_specs_get_sequential_indices() {
        let request: ChartRequest = serde_json::from_value(json!({
            "charts": [
                {"type": "bar", "x": "month", "y": "revenue"},
                {"chart_type": "pie", "x_field": "MONTH", "y_fields": ["orders"], "title": "Orders"}
            ]
        }))
        .expect("parse");
        let charts = build_charts(&request, &monthly()).expect("charts");
        assert_eq!(
            charts.iter().map(|c| c.chart_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(charts[1].chart_type, ChartKind::Pie);
        assert_eq!(charts[1].x_field, "month");
        assert_eq!(charts[1].title, "Orders");
    }

    #[test]
    fn rejects_unknown_columns_and_empty_results() {
        let request: ChartRequest =
            serde_json::from_value(json!({"x_field": "region"})).expect("parse");
        assert!(matches!(
            build_charts(&request, &monthly()),
            Err(ToolError::InvalidArguments(_))
        ));
        assert_eq!(
            build_charts(&ChartRequest::default(), &RowSet::default()),
            Err(ToolError::NothingToChart)
        );
    }
}
