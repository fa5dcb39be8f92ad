use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Step 0 collects the planner's free text before the first formal step.
pub const PLANNING_STEP: u32 = 0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Error,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepContentType {
    Text,
    Sql,
    Table,
    Chart,
}

/// Identity of a step inside one run. Orders by step number first, then by
/// chart index with keyless entries before indexed ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepKey {
    pub step_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_index: Option<u32>,
}

impl StepKey {
    pub fn new(step_number: u32, chart_index: Option<u32>) -> Self {
        Self {
            step_number,
            chart_index,
        }
    }

    pub fn step(step_number: u32) -> Self {
        Self::new(step_number, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingStep {
    pub step_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_index: Option<u32>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: StepStatus,
    pub content_type: StepContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    #[serde(default)]
    pub streaming: bool,
}

impl ProcessingStep {
    pub fn running(
        step_number: u32,
        title: impl Into<String>,
        content_type: StepContentType,
    ) -> Self {
        Self {
            step_number,
            chart_index: None,
            title: title.into(),
            description: String::new(),
            status: StepStatus::Running,
            content_type,
            content_data: None,
            content_preview: None,
            streaming: true,
        }
    }

    pub fn planning() -> Self {
        let mut step = Self::running(PLANNING_STEP, "Planning", StepContentType::Text);
        step.description = "Understanding the question".to_string();
        step
    }

    pub fn key(&self) -> StepKey {
        StepKey::new(self.step_number, self.chart_index)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_chart_index(mut self, chart_index: u32) -> Self {
        self.chart_index = Some(chart_index);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.content_data = Some(data);
        self
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.content_preview = Some(preview.into());
        self
    }

    pub fn completed(mut self) -> Self {
        self.status = StepStatus::Completed;
        self.streaming = false;
        self
    }

    pub fn failed(mut self) -> Self {
        self.status = StepStatus::Error;
        self.streaming = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_by_step_then_chart_index() {
        let mut keys = vec![
            StepKey::new(7, Some(2)),
            StepKey::new(3, None),
            StepKey::new(7, Some(0)),
            StepKey::new(7, None),
            StepKey::new(7, Some(1)),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                StepKey::new(3, None),
                StepKey::new(7, None),
                StepKey::new(7, Some(0)),
                StepKey::new(7, Some(1)),
                StepKey::new(7, Some(2)),
            ]
        );
    }

    #[test]
    fn step_serializes_without_absent_chart_index() {
        let step = ProcessingStep::running(2, "Run query", StepContentType::Sql);
        let value = serde_json::to_value(&step).expect("serialize");
        assert!(value.get("chart_index").is_none());
        assert_eq!(value["status"], "running");
        assert_eq!(value["content_type"], "sql");
    }
}
