use askql_types::{
    ChartConfig, MessageMetadata, ProcessingStep, QueryResponse, StepContentType, StepStatus,
    TableData,
};

use crate::aggregator::TraceState;

pub const DEFAULT_MAX_TABLE_ROWS: usize = 100;

const BASE_CONFIDENCE: f64 = 0.9;
const REPAIR_PENALTY: f64 = 0.2;
const MIN_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub max_table_rows: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            max_table_rows: DEFAULT_MAX_TABLE_ROWS,
        }
    }
}

/// The caller-facing shape of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedResponse {
    pub answer: String,
    pub table: Option<TableData>,
    pub charts: Vec<ChartConfig>,
    pub reasoning: Option<String>,
    pub confidence: Option<f64>,
    pub processing_steps: Vec<ProcessingStep>,
}

impl FormattedResponse {
    pub fn into_query_response(
        self,
        session_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> QueryResponse {
        QueryResponse {
            answer: self.answer,
            chart: self.charts.first().cloned(),
            table: self.table,
            charts: self.charts,
            reasoning: self.reasoning,
            confidence: self.confidence,
            processing_steps: self.processing_steps,
            session_id: session_id.into(),
            message_id: message_id.into(),
        }
    }

    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            reasoning: self.reasoning.clone(),
            table: self.table.clone(),
            charts: self.charts.clone(),
            processing_steps: self.processing_steps.clone(),
            error_code: None,
        }
    }
}

pub fn format_response(
    final_text: &str,
    trace: &TraceState,
    options: FormatOptions,
) -> FormattedResponse {
    let processing_steps = trace.steps();
    let table = last_table(&processing_steps).map(|t| t.capped(options.max_table_rows));
    let confidence = table
        .as_ref()
        .map(|_| confidence_for(trace.repair_attempts()));

    FormattedResponse {
        answer: final_text.trim().to_string(),
        table,
        charts: trace.charts(),
        reasoning: trace.reasoning(),
        confidence,
        processing_steps,
    }
}

pub fn confidence_for(repair_attempts: u32) -> f64 {
    (BASE_CONFIDENCE - REPAIR_PENALTY * f64::from(repair_attempts)).max(MIN_CONFIDENCE)
}

/// Table of the last completed query step.
fn last_table(steps: &[ProcessingStep]) -> Option<TableData> {
    steps
        .iter()
        .rev()
        .filter(|s| s.content_type == StepContentType::Table && s.status == StepStatus::Completed)
        .find_map(|s| {
            let table = s.content_data.as_ref()?.get("table")?.clone();
            serde_json::from_value::<TableData>(table).ok()
        })
}
