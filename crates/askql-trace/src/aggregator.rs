use std::collections::BTreeMap;

use askql_types::{
    ChartConfig, ProcessingStep, StepKey, StepStatus, ToolCall, PLANNING_STEP,
};
use askql_wire::{StreamEvent, WireFrame};

#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Done {
        answer_in_steps: bool,
        repair_attempts: u32,
    },
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Versioned<T> {
    seq: u64,
    value: T,
}

/// Reduction of one run's frame stream. Steps live in an arena keyed by
/// `StepKey`; every key holds the value of the highest `seq` seen for it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TraceState {
    steps: BTreeMap<StepKey, Versioned<ProcessingStep>>,
    charts: BTreeMap<StepKey, Versioned<ChartConfig>>,
    pending_calls: BTreeMap<u32, ToolCall>,
    content: BTreeMap<u64, String>,
    reasoning: BTreeMap<u64, String>,
    terminal: Option<Terminal>,
    last_seq: u64,
}

/// Pure form of [`TraceState::apply`].
pub fn reduce(state: &TraceState, frame: &WireFrame) -> TraceState {
    let mut next = state.clone();
    next.apply(frame);
    next
}

pub fn replay<'a>(frames: impl IntoIterator<Item = &'a WireFrame>) -> TraceState {
    let mut state = TraceState::default();
    for frame in frames {
        state.apply(frame);
    }
    state
}

impl TraceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, frame: &WireFrame) {
        let seq = frame.seq;
        self.last_seq = self.last_seq.max(seq);
        match &frame.event {
            StreamEvent::Content { delta } => self.apply_content(seq, delta),
            StreamEvent::Thinking { delta } => {
                self.reasoning.entry(seq).or_insert_with(|| delta.clone());
            }
            StreamEvent::ToolInput {
                step_number,
                tool,
                input,
            } => {
                self.pending_calls.insert(
                    *step_number,
                    ToolCall {
                        step_number: *step_number,
                        tool: *tool,
                        input: input.clone(),
                        output: None,
                        status: StepStatus::Running,
                    },
                );
                let key = StepKey::step(*step_number);
                if !self.steps.contains_key(&key) && !self.has_chart_entries(*step_number) {
                    let placeholder =
                        ProcessingStep::running(*step_number, tool.step_title(), tool.content_type());
                    self.put_step(seq, placeholder);
                }
                self.close_planning(*step_number);
            }
            StreamEvent::ToolResult {
                step_number,
                tool,
                success,
                ..
            } => {
                self.pending_calls.remove(step_number);
                let key = StepKey::step(*step_number);
                let split_into_charts = self.has_chart_entries(*step_number);
                let status = if *success {
                    StepStatus::Completed
                } else {
                    StepStatus::Error
                };
                match self.steps.get_mut(&key) {
                    Some(entry) if entry.seq <= seq => {
                        if entry.value.status == StepStatus::Running {
                            entry.value.status = status;
                            entry.value.streaming = false;
                        }
                        entry.seq = seq;
                    }
                    Some(_) => {}
                    None if !split_into_charts => {
                        let mut step = ProcessingStep::running(
                            *step_number,
                            tool.step_title(),
                            tool.content_type(),
                        );
                        step.status = status;
                        step.streaming = false;
                        self.put_step(seq, step);
                    }
                    None => {}
                }
                self.close_planning(*step_number);
            }
            StreamEvent::ChartConfig {
                step_number,
                config,
            } => {
                let key = StepKey::new(*step_number, Some(config.chart_index));
                let newer = self.charts.get(&key).map_or(true, |c| c.seq <= seq);
                if newer {
                    self.charts.insert(
                        key,
                        Versioned {
                            seq,
                            value: config.clone(),
                        },
                    );
                }
            }
            StreamEvent::ProcessingStep { step } | StreamEvent::StepUpdate { step } => {
                self.apply_step(seq, step.clone());
            }
            StreamEvent::Error { code, message } => {
                if self.terminal.is_none() {
                    self.terminal = Some(Terminal::Error {
                        code: code.clone(),
                        message: message.clone(),
                    });
                }
            }
            StreamEvent::Done {
                answer_in_steps,
                repair_attempts,
            } => {
                if self.terminal.is_none() {
                    self.terminal = Some(Terminal::Done {
                        answer_in_steps: *answer_in_steps,
                        repair_attempts: *repair_attempts,
                    });
                }
            }
        }
        self.normalize_terminal();
    }

    fn apply_content(&mut self, seq: u64, delta: &str) {
        if self.content.contains_key(&seq) {
            return;
        }
        self.content.insert(seq, delta.to_string());

        let has_formal = self.steps.keys().any(|k| k.step_number > PLANNING_STEP);
        if has_formal && self.has_running_formal_step() {
            return;
        }
        let planning_key = StepKey::step(PLANNING_STEP);
        let entry = self
            .steps
            .entry(planning_key)
            .or_insert_with(|| Versioned {
                seq,
                value: ProcessingStep::planning(),
            });
        let preview = entry.value.content_preview.get_or_insert_with(String::new);
        preview.push_str(delta);
        entry.seq = entry.seq.max(seq);
    }

    fn apply_step(&mut self, seq: u64, step: ProcessingStep) {
        let key = step.key();
        let step_number = key.step_number;

        if key.chart_index.is_none()
            && !self.steps.contains_key(&key)
            && self.has_chart_entries(step_number)
        {
            // keyless update for a step already split into charts
            if step.status.is_terminal() {
                for (_, entry) in self
                    .steps
                    .range_mut(StepKey::new(step_number, Some(0))..=StepKey::new(step_number, Some(u32::MAX)))
                {
                    if entry.seq <= seq {
                        entry.value.status = step.status;
                        entry.value.streaming = false;
                    }
                }
            }
            self.close_planning(step_number);
            return;
        }

        if key.chart_index.is_some() {
            let placeholder = StepKey::step(step_number);
            let claimable = self
                .steps
                .get(&placeholder)
                .is_some_and(|p| p.value.status == StepStatus::Running && p.seq <= seq);
            if claimable {
                self.steps.remove(&placeholder);
            }
        }

        let newer = self.steps.get(&key).map_or(true, |existing| existing.seq <= seq);
        if newer {
            self.put_step(seq, step);
        }
        self.close_planning(step_number);
    }

    fn put_step(&mut self, seq: u64, step: ProcessingStep) {
        self.steps.insert(step.key(), Versioned { seq, value: step });
    }

    /// The planning step stops streaming once any formal step shows up.
    fn close_planning(&mut self, step_number: u32) {
        if step_number == PLANNING_STEP {
            return;
        }
        if let Some(entry) = self.steps.get_mut(&StepKey::step(PLANNING_STEP)) {
            if entry.value.status == StepStatus::Running {
                entry.value.status = StepStatus::Completed;
                entry.value.streaming = false;
            }
        }
    }

    fn has_chart_entries(&self, step_number: u32) -> bool {
        self.steps
            .keys()
            .any(|k| k.step_number == step_number && k.chart_index.is_some())
    }

    fn has_running_formal_step(&self) -> bool {
        self.steps.iter().any(|(k, entry)| {
            k.step_number > PLANNING_STEP && entry.value.status == StepStatus::Running
        })
    }

    fn normalize_terminal(&mut self) {
        let status = match &self.terminal {
            Some(Terminal::Done { .. }) => StepStatus::Completed,
            Some(Terminal::Error { .. }) => StepStatus::Error,
            None => return,
        };
        for entry in self.steps.values_mut() {
            if entry.value.status == StepStatus::Running {
                entry.value.status = status;
            }
            entry.value.streaming = false;
        }
        self.pending_calls.clear();
    }

    /// Steps in display order: step number, then chart index.
    pub fn steps(&self) -> Vec<ProcessingStep> {
        self.steps.values().map(|entry| entry.value.clone()).collect()
    }

    pub fn step(&self, key: StepKey) -> Option<&ProcessingStep> {
        self.steps.get(&key).map(|entry| &entry.value)
    }

    pub fn charts(&self) -> Vec<ChartConfig> {
        self.charts.values().map(|entry| entry.value.clone()).collect()
    }

    /// Answer text in `seq` order.
    pub fn content(&self) -> String {
        self.content.values().map(String::as_str).collect()
    }

    pub fn reasoning(&self) -> Option<String> {
        let text = self.reasoning.values().map(String::as_str).collect::<String>();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn pending_call(&self, step_number: u32) -> Option<&ToolCall> {
        self.pending_calls.get(&step_number)
    }

    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref()
    }

    pub fn repair_attempts(&self) -> u32 {
        match &self.terminal {
            Some(Terminal::Done {
                repair_attempts, ..
            }) => *repair_attempts,
            _ => 0,
        }
    }

    /// Content stored on the finished message: empty when the steps carry
    /// the whole answer.
    pub fn final_content(&self) -> String {
        match &self.terminal {
            Some(Terminal::Done {
                answer_in_steps: true,
                ..
            }) => String::new(),
            _ => self.content(),
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn highest_step_number(&self) -> u32 {
        self.steps
            .keys()
            .map(|k| k.step_number)
            .max()
            .unwrap_or(PLANNING_STEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askql_types::{ChartKind, StepContentType, ToolTag};
    use serde_json::json;

    fn frame(seq: u64, event: StreamEvent) -> WireFrame {
        WireFrame::new(seq, event)
    }

    fn step_frame(seq: u64, step: ProcessingStep) -> WireFrame {
        frame(seq, StreamEvent::StepUpdate { step })
    }

    fn chart_step(step_number: u32, chart_index: u32) -> ProcessingStep {
        ProcessingStep::running(step_number, format!("Chart {chart_index}"), StepContentType::Chart)
            .with_chart_index(chart_index)
            .completed()
    }

    fn chart(chart_index: u32) -> ChartConfig {
        ChartConfig {
            chart_index,
            chart_type: ChartKind::Bar,
            title: format!("chart {chart_index}"),
            x_field: "region".to_string(),
            y_fields: vec!["total".to_string()],
            data: vec![],
        }
    }

    #[test]
    fn later_seq_replaces_and_older_seq_is_ignored() {
        let running = ProcessingStep::running(1, "Run SQL query", StepContentType::Sql);
        let done = running.clone().with_data(json!({"sql": "SELECT 1"})).completed();

        let mut state = TraceState::new();
        state.apply(&step_frame(2, running.clone()));
        state.apply(&step_frame(5, done.clone()));
        state.apply(&step_frame(3, running));

        assert_eq!(state.steps(), vec![done]);
        assert_eq!(state.last_seq(), 5);
    }

    #[test]
    fn duplicate_updates_are_idempotent() {
        let a = ProcessingStep::running(1, "Inspect schema", StepContentType::Text);
        let b = ProcessingStep::running(2, "Run SQL query", StepContentType::Sql);
        let frames = vec![
            step_frame(1, a.clone()),
            step_frame(2, a.clone().completed()),
            step_frame(3, b.clone()),
            step_frame(4, b.clone().completed()),
            frame(
                5,
                StreamEvent::Done {
                    answer_in_steps: true,
                    repair_attempts: 0,
                },
            ),
        ];
        let mut noisy = Vec::new();
        for f in &frames {
            noisy.push(f.clone());
            noisy.push(f.clone());
        }
        noisy.insert(3, frames[1].clone());

        assert_eq!(replay(&frames).steps(), replay(&noisy).steps());
    }

    #[test]
    fn charts_render_sorted_whatever_the_arrival_order() {
        let placeholder = ProcessingStep::running(7, "Generate chart", StepContentType::Chart);
        let mut state = TraceState::new();
        state.apply(&frame(1, StreamEvent::ProcessingStep { step: placeholder }));
        for (seq, idx) in [(4, 2), (2, 0), (3, 1)] {
            state.apply(&frame(
                seq,
                StreamEvent::ChartConfig {
                    step_number: 7,
                    config: chart(idx),
                },
            ));
            state.apply(&step_frame(seq, chart_step(7, idx)));
        }

        let keys = state.steps().iter().map(|s| s.key()).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                StepKey::new(7, Some(0)),
                StepKey::new(7, Some(1)),
                StepKey::new(7, Some(2)),
            ]
        );
        assert_eq!(
            state.charts().iter().map(|c| c.chart_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn keyless_update_only_propagates_terminal_status_to_charts() {
        let mut state = TraceState::new();
        let running_chart = ProcessingStep::running(3, "Chart 0", StepContentType::Chart)
            .with_chart_index(0);
        state.apply(&step_frame(1, running_chart));
        state.apply(&step_frame(
            2,
            ProcessingStep::running(3, "Generate chart", StepContentType::Chart),
        ));
        assert_eq!(state.steps().len(), 1);
        assert_eq!(state.steps()[0].status, StepStatus::Running);

        state.apply(&step_frame(
            3,
            ProcessingStep::running(3, "Generate chart", StepContentType::Chart).failed(),
        ));
        let steps = state.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].key(), StepKey::new(3, Some(0)));
        assert_eq!(steps[0].status, StepStatus::Error);
    }

    #[test]
    fn planning_collects_text_until_first_formal_step() {
        let mut state = TraceState::new();
        state.apply(&frame(1, StreamEvent::Content { delta: "Looking ".to_string() }));
        state.apply(&frame(2, StreamEvent::Content { delta: "at orders".to_string() }));
        state.apply(&frame(2, StreamEvent::Content { delta: "at orders".to_string() }));

        let planning = state.step(StepKey::step(0)).expect("planning step");
        assert_eq!(planning.status, StepStatus::Running);
        assert_eq!(planning.content_preview.as_deref(), Some("Looking at orders"));

        state.apply(&frame(
            3,
            StreamEvent::ToolInput {
                step_number: 1,
                tool: ToolTag::GetSchema,
                input: json!({}),
            },
        ));
        let planning = state.step(StepKey::step(0)).expect("planning step");
        assert_eq!(planning.status, StepStatus::Completed);
        assert!(!planning.streaming);

        // no preview while a formal step runs
        state.apply(&frame(4, StreamEvent::Content { delta: " (busy)".to_string() }));
        assert_eq!(
            state.step(StepKey::step(0)).and_then(|s| s.content_preview.clone()),
            Some("Looking at orders".to_string())
        );

        state.apply(&frame(
            5,
            StreamEvent::ToolResult {
                step_number: 1,
                tool: ToolTag::GetSchema,
                success: true,
                output: json!({}),
            },
        ));
        state.apply(&frame(6, StreamEvent::Content { delta: " done".to_string() }));
        assert_eq!(
            state.step(StepKey::step(0)).and_then(|s| s.content_preview.clone()),
            Some("Looking at orders done".to_string())
        );
        assert_eq!(state.content(), "Looking at orders (busy) done");
    }

    #[test]
    fn tool_frames_create_and_complete_placeholder() {
        let mut state = TraceState::new();
        state.apply(&frame(
            1,
            StreamEvent::ToolInput {
                step_number: 2,
                tool: ToolTag::ExecuteSql,
                input: json!({"sql": "SELECT 1"}),
            },
        ));
        assert!(state.pending_call(2).is_some());
        let step = state.step(StepKey::step(2)).expect("placeholder");
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.content_type, StepContentType::Sql);

        state.apply(&frame(
            2,
            StreamEvent::ToolResult {
                step_number: 2,
                tool: ToolTag::ExecuteSql,
                success: false,
                output: json!(null),
            },
        ));
        assert!(state.pending_call(2).is_none());
        assert_eq!(
            state.step(StepKey::step(2)).map(|s| s.status),
            Some(StepStatus::Error)
        );
    }

    #[test]
    fn terminal_frames_settle_running_steps_even_when_late() {
        let mut errored = TraceState::new();
        errored.apply(&step_frame(
            1,
            ProcessingStep::running(1, "Run SQL query", StepContentType::Sql),
        ));
        errored.apply(&frame(
            2,
            StreamEvent::Error {
                code: "CANCELLED".to_string(),
                message: "cancelled".to_string(),
            },
        ));
        assert_eq!(errored.steps()[0].status, StepStatus::Error);

        errored.apply(&step_frame(
            3,
            ProcessingStep::running(2, "Generate chart", StepContentType::Chart),
        ));
        assert!(errored.steps().iter().all(|s| s.status == StepStatus::Error));

        let mut done = TraceState::new();
        done.apply(&step_frame(
            1,
            ProcessingStep::running(1, "Inspect schema", StepContentType::Text),
        ));
        done.apply(&frame(
            2,
            StreamEvent::Done {
                answer_in_steps: true,
                repair_attempts: 1,
            },
        ));
        assert_eq!(done.steps()[0].status, StepStatus::Completed);
        assert!(!done.steps()[0].streaming);
        assert_eq!(done.repair_attempts(), 1);
        assert_eq!(done.final_content(), "");
    }

    #[test]
    fn reduce_leaves_input_untouched() {
        let state = TraceState::new();
        let next = reduce(&state, &frame(1, StreamEvent::Thinking { delta: "hmm".to_string() }));
        assert_eq!(state.reasoning(), None);
        assert_eq!(next.reasoning().as_deref(), Some("hmm"));
    }
}
