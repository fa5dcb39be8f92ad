use serde::{Deserialize, Serialize};
use serde_json::Value;

use askql_types::{ProcessingStep, StepKey, ToolTag};

mod codec;

pub use codec::{FrameDecoder, WireError, WireFormat};

/// One frame of a query's event stream. `seq` is assigned by the emitter and
/// strictly increases within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl WireFrame {
    pub fn new(seq: u64, event: StreamEvent) -> Self {
        Self { seq, event }
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Free answer text from the planner.
    Content { delta: String },
    /// Model reasoning, kept apart from the answer.
    Thinking { delta: String },
    ToolInput {
        step_number: u32,
        tool: ToolTag,
        input: Value,
    },
    ToolResult {
        step_number: u32,
        tool: ToolTag,
        success: bool,
        #[serde(default)]
        output: Value,
    },
    ChartConfig {
        step_number: u32,
        config: askql_types::ChartConfig,
    },
    ProcessingStep { step: ProcessingStep },
    StepUpdate { step: ProcessingStep },
    Error { code: String, message: String },
    Done {
        #[serde(default)]
        answer_in_steps: bool,
        #[serde(default)]
        repair_attempts: u32,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Content { .. } => "content",
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::ToolInput { .. } => "tool_input",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::ChartConfig { .. } => "chart_config",
            StreamEvent::ProcessingStep { .. } => "processing_step",
            StreamEvent::StepUpdate { .. } => "step_update",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }

    /// The step this event addresses, when it addresses one.
    pub fn step_key(&self) -> Option<StepKey> {
        match self {
            StreamEvent::ToolInput { step_number, .. }
            | StreamEvent::ToolResult { step_number, .. } => Some(StepKey::step(*step_number)),
            StreamEvent::ChartConfig {
                step_number,
                config,
            } => Some(StepKey::new(*step_number, Some(config.chart_index))),
            StreamEvent::ProcessingStep { step } | StreamEvent::StepUpdate { step } => {
                Some(step.key())
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Done { .. })
    }
}
