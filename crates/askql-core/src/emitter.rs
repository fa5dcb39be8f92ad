use serde_json::Value;
use tokio::sync::mpsc;

use askql_trace::TraceState;
use askql_types::{ChartConfig, ProcessingStep, StepContentType, ToolTag};
use askql_wire::{StreamEvent, WireFrame};

pub type FrameSender = mpsc::UnboundedSender<WireFrame>;

/// Assigns `seq` and step numbers for one run, folds every frame into the
/// run's trace, then forwards it to the optional client sink.
pub struct StepEmitter {
    seq: u64,
    last_step: u32,
    trace: TraceState,
    sink: Option<FrameSender>,
}

impl StepEmitter {
    pub fn new(sink: Option<FrameSender>) -> Self {
        Self {
            seq: 0,
            last_step: 0,
            trace: TraceState::new(),
            sink,
        }
    }

    pub fn emit(&mut self, event: StreamEvent) -> u64 {
        self.seq += 1;
        let frame = WireFrame::new(self.seq, event);
        self.trace.apply(&frame);
        if let Some(sink) = &self.sink {
            if sink.send(frame).is_err() {
                tracing::debug!("frame sink closed, dropping further frames");
                self.sink = None;
            }
        }
        self.seq
    }

    /// Next formal step number. Formal steps start at 1.
    pub fn allocate_step(&mut self) -> u32 {
        self.last_step += 1;
        self.last_step
    }

    pub fn content(&mut self, delta: &str) {
        if !delta.is_empty() {
            self.emit(StreamEvent::Content {
                delta: delta.to_string(),
            });
        }
    }

    pub fn thinking(&mut self, delta: &str) {
        if !delta.is_empty() {
            self.emit(StreamEvent::Thinking {
                delta: delta.to_string(),
            });
        }
    }

    /// Announces a step for the first time.
    pub fn start_step(
        &mut self,
        step_number: u32,
        title: &str,
        content_type: StepContentType,
    ) -> ProcessingStep {
        let step = ProcessingStep::running(step_number, title, content_type);
        self.emit(StreamEvent::ProcessingStep { step: step.clone() });
        step
    }

    pub fn update_step(&mut self, step: ProcessingStep) {
        self.emit(StreamEvent::StepUpdate { step });
    }

    pub fn tool_input(&mut self, step_number: u32, tool: ToolTag, input: Value) {
        self.emit(StreamEvent::ToolInput {
            step_number,
            tool,
            input,
        });
    }

    pub fn tool_result(&mut self, step_number: u32, tool: ToolTag, success: bool, output: Value) {
        self.emit(StreamEvent::ToolResult {
            step_number,
            tool,
            success,
            output,
        });
    }

    pub fn chart(&mut self, step_number: u32, config: ChartConfig) {
        self.emit(StreamEvent::ChartConfig {
            step_number,
            config,
        });
    }

    pub fn done(&mut self, answer_in_steps: bool, repair_attempts: u32) {
        self.emit(StreamEvent::Done {
            answer_in_steps,
            repair_attempts,
        });
    }

    pub fn error(&mut self, code: &str, message: &str) {
        self.emit(StreamEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    pub fn trace(&self) -> &TraceState {
        &self.trace
    }

    pub fn into_trace(self) -> TraceState {
        self.trace
    }
}
