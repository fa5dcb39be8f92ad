//! The agent loop. Each iteration asks the planner for one next action and
//! either runs exactly one tool or treats the turn as the final answer.
//!
//! Every observable effect goes through the [`StepEmitter`]; the orchestrator
//! never touches session storage.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use askql_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use askql_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use askql_tools::{
    validate_sql, validate_tool_schemas, ChartRequest, ExecutionError, SqlDialect, SqlGuardPolicy,
    SqlVerdict, ToolError, ToolInvocation, ToolRegistry, ValidatedSql,
};
use askql_types::{ProcessingStep, RowSet, StepContentType, ToolSchema, ToolTag};

use crate::config::AgentConfig;
use crate::emitter::StepEmitter;
use crate::error::AgentError;
use crate::llm::{backoff, guarded, LlmPolicy, ModelTarget};
use crate::repair::{extract_fenced_sql, RepairContext, RepairController};

const COMPONENT: &str = "agent.orchestrator";
const FEEDBACK_SAMPLE_ROWS: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub run_id: String,
    pub session_id: Option<String>,
    pub question: String,
    /// Prior turns, already sanitized.
    pub history: Vec<ChatMessage>,
    pub data_source_ids: Vec<String>,
    pub target: ModelTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub final_answer: String,
    pub repair_attempts: u32,
    pub iterations: u32,
}

#[derive(Clone)]
pub struct Orchestrator {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    agent: AgentConfig,
    sql_policy: SqlGuardPolicy,
    default_target: ModelTarget,
    process: ProcessKind,
}

/// Per-run borrowed inputs, bundled so tool handlers keep short signatures.
struct RunContext<'a> {
    request: &'a RunRequest,
    target: ModelTarget,
    llm: LlmPolicy,
    cancel: &'a CancellationToken,
}

/// Mutable working set of one run. Dropped when the run ends.
struct RunState {
    messages: Vec<ChatMessage>,
    last_rows: Option<RowSet>,
    schema_text: HashMap<String, String>,
    repair: RepairController,
    executed: HashSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PlannerCall {
    name: String,
    args: String,
}

/// One streamed planner reply with its tool calls in stream order.
#[derive(Debug, Default)]
struct PlannerTurn {
    text: String,
    calls: Vec<PlannerCall>,
    index: HashMap<String, usize>,
}

impl PlannerTurn {
    fn call_mut(&mut self, id: &str) -> &mut PlannerCall {
        let idx = match self.index.get(id) {
            Some(idx) => *idx,
            None => {
                self.calls.push(PlannerCall::default());
                self.index.insert(id.to_string(), self.calls.len() - 1);
                self.calls.len() - 1
            }
        };
        &mut self.calls[idx]
    }

    fn start_call(&mut self, id: &str, name: String) {
        let call = self.call_mut(id);
        if call.name.is_empty() {
            call.name = name;
        }
    }

    fn push_args(&mut self, id: &str, delta: &str) {
        self.call_mut(id).args.push_str(delta);
    }

    /// The single call to run this iteration. Extra calls are dropped; a turn
    /// with no structured call may still carry a fenced SQL block.
    fn next_call(&self, executed: &HashSet<String>) -> Option<PlannerCall> {
        let named = self
            .calls
            .iter()
            .filter(|call| !call.name.trim().is_empty())
            .collect::<Vec<_>>();
        if let Some(first) = named.first() {
            if named.len() > 1 {
                tracing::warn!(
                    "planner requested {} tool calls in one turn, running only `{}`",
                    named.len(),
                    first.name
                );
            }
            return Some((*first).clone());
        }
        let sql = extract_fenced_sql(&self.text)?;
        if executed.contains(sql.trim()) {
            return None;
        }
        Some(PlannerCall {
            name: ToolTag::ExecuteSql.function_name().to_string(),
            args: json!({ "sql": sql }).to_string(),
        })
    }
}

impl Orchestrator {
    pub fn new(
        providers: ProviderRegistry,
        tools: ToolRegistry,
        agent: AgentConfig,
        sql_policy: SqlGuardPolicy,
    ) -> Self {
        Self {
            providers,
            tools,
            agent,
            sql_policy,
            default_target: ModelTarget::default(),
            process: ProcessKind::Server,
        }
    }

    pub fn with_default_target(mut self, target: ModelTarget) -> Self {
        self.default_target = target;
        self
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn agent_config(&self) -> &AgentConfig {
        &self.agent
    }

    pub fn sql_policy(&self) -> &SqlGuardPolicy {
        &self.sql_policy
    }

    /// Runs the agent to a terminal frame. Exactly one of `done` or `error`
    /// is emitted, whatever the outcome.
    pub async fn run(
        &self,
        request: &RunRequest,
        emitter: &mut StepEmitter,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        let ctx = RunContext {
            request,
            target: self.target_for(request),
            llm: LlmPolicy::from_config(&self.agent),
            cancel,
        };
        self.emit(Level::INFO, &ctx, "run.start", None, None);

        let result = self.drive(&ctx, emitter).await;
        match &result {
            Ok(outcome) => {
                let answer_in_steps = outcome.final_answer.trim().is_empty()
                    && emitter.trace().highest_step_number() > 0;
                emitter.done(answer_in_steps, outcome.repair_attempts);
                let detail = format!(
                    "iterations={} repairs={}",
                    outcome.iterations, outcome.repair_attempts
                );
                self.emit(Level::INFO, &ctx, "run.finish", None, Some(&detail));
            }
            Err(err) => {
                emitter.error(err.code(), &err.user_message());
                let level = if matches!(err, AgentError::Cancelled) {
                    Level::WARN
                } else {
                    Level::ERROR
                };
                let detail = redact_text(&err.to_string());
                self.emit(level, &ctx, "run.error", Some(err.code()), Some(&detail));
            }
        }
        result
    }

    fn target_for(&self, request: &RunRequest) -> ModelTarget {
        ModelTarget {
            provider_id: request
                .target
                .provider_id
                .clone()
                .or_else(|| self.default_target.provider_id.clone()),
            model_id: request
                .target
                .model_id
                .clone()
                .or_else(|| self.default_target.model_id.clone()),
        }
    }

    async fn drive(
        &self,
        ctx: &RunContext<'_>,
        emitter: &mut StepEmitter,
    ) -> Result<RunOutcome, AgentError> {
        let schemas = self.tools.schemas();
        validate_tool_schemas(&schemas).map_err(|err| AgentError::Internal(err.to_string()))?;

        let mut messages = vec![ChatMessage::new(
            "system",
            self.system_prompt(ctx.request, &schemas).await,
        )];
        messages.extend(ctx.request.history.iter().cloned());
        messages.push(ChatMessage::new("user", ctx.request.question.trim()));
        let mut run = RunState {
            messages,
            last_rows: None,
            schema_text: HashMap::new(),
            repair: RepairController::new(self.agent.max_repair_attempts),
            executed: HashSet::new(),
        };

        for iteration in 1..=self.agent.max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let turn = self
                .planner_turn(ctx, &run.messages, &schemas, emitter)
                .await?;
            let Some(call) = turn.next_call(&run.executed) else {
                let answer = turn.text.trim().to_string();
                if !answer.is_empty() {
                    let n = emitter.allocate_step();
                    let step = emitter.start_step(n, "Answer", StepContentType::Text);
                    emitter.update_step(step.with_data(json!({ "text": answer })).completed());
                }
                return Ok(RunOutcome {
                    final_answer: answer,
                    repair_attempts: run.repair.attempts(),
                    iterations: iteration,
                });
            };

            let mut request_text = turn.text.trim().to_string();
            if !request_text.is_empty() {
                request_text.push_str("\n\n");
            }
            request_text.push_str(&format!("Calling `{}` with {}", call.name, call.args));
            run.messages.push(ChatMessage::new("assistant", request_text));

            let feedback = self.execute_call(ctx, &mut run, emitter, call).await?;
            run.messages.push(ChatMessage::new("user", feedback));
        }

        tracing::warn!(
            "run {} reached the iteration limit of {}",
            ctx.request.run_id,
            self.agent.max_iterations
        );
        Err(AgentError::MaxIterationsExceeded(self.agent.max_iterations))
    }

    /// One planner reply, retried on upstream failure as long as nothing was
    /// streamed to the client yet.
    async fn planner_turn(
        &self,
        ctx: &RunContext<'_>,
        messages: &[ChatMessage],
        schemas: &[ToolSchema],
        emitter: &mut StepEmitter,
    ) -> Result<PlannerTurn, AgentError> {
        let mut attempt = 0;
        loop {
            let mut streamed = false;
            let result = guarded(
                "planner",
                ctx.llm.timeout,
                ctx.cancel,
                self.stream_turn(ctx, messages, schemas, emitter, &mut streamed),
            )
            .await;
            match result {
                Err(AgentError::UpstreamLlm(message))
                    if !streamed && attempt < ctx.llm.retry_attempts =>
                {
                    tracing::warn!(
                        "planner call failed (attempt {}/{}): {}",
                        attempt + 1,
                        ctx.llm.retry_attempts + 1,
                        message
                    );
                    backoff(&ctx.llm, attempt, ctx.cancel).await?;
                    attempt += 1;
                }
                Err(AgentError::UpstreamLlm(message)) => {
                    self.emit(
                        Level::ERROR,
                        ctx,
                        "provider.call.error",
                        Some("UPSTREAM_LLM_ERROR"),
                        Some(&redact_text(&message)),
                    );
                    return Err(AgentError::UpstreamLlm(message));
                }
                other => return other,
            }
        }
    }

    async fn stream_turn(
        &self,
        ctx: &RunContext<'_>,
        messages: &[ChatMessage],
        schemas: &[ToolSchema],
        emitter: &mut StepEmitter,
        streamed: &mut bool,
    ) -> Result<PlannerTurn, AgentError> {
        let mut stream = self
            .providers
            .stream_for_provider(
                ctx.target.provider_id.as_deref(),
                ctx.target.model_id.as_deref(),
                messages.to_vec(),
                Some(schemas.to_vec()),
                ctx.cancel.clone(),
            )
            .await
            .map_err(|err| AgentError::UpstreamLlm(err.to_string()))?;

        let mut turn = PlannerTurn::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| AgentError::UpstreamLlm(err.to_string()))?;
            match chunk {
                StreamChunk::TextDelta(delta) => {
                    *streamed = true;
                    turn.text.push_str(&delta);
                    emitter.content(&delta);
                }
                StreamChunk::ReasoningDelta(delta) => {
                    *streamed = true;
                    emitter.thinking(&delta);
                }
                StreamChunk::ToolCallStart { id, name } => turn.start_call(&id, name),
                StreamChunk::ToolCallDelta { id, args_delta } => turn.push_args(&id, &args_delta),
                StreamChunk::ToolCallEnd { .. } => {}
                StreamChunk::Done { .. } => break,
            }
        }
        Ok(turn)
    }

    /// Runs one tool call and returns the feedback text for the planner.
    /// Argument problems become feedback; only run-ending failures are `Err`.
    async fn execute_call(
        &self,
        ctx: &RunContext<'_>,
        run: &mut RunState,
        emitter: &mut StepEmitter,
        call: PlannerCall,
    ) -> Result<String, AgentError> {
        let args = parse_call_args(&call.args);
        let invocation = match ToolInvocation::parse(&call.name, args.clone()) {
            Ok(invocation) => invocation,
            Err(err) => return Ok(reject_call(emitter, &call.name, args, &err)),
        };
        match invocation {
            ToolInvocation::GetSchema { data_source_id } => {
                self.get_schema(ctx, run, emitter, data_source_id.as_deref())
                    .await
            }
            ToolInvocation::ExecuteSql {
                data_source_id,
                sql,
            } => {
                self.execute_sql(ctx, run, emitter, data_source_id.as_deref(), &sql)
                    .await
            }
            ToolInvocation::GenerateChart(request) => {
                Ok(self.generate_chart(run, emitter, &request, args))
            }
        }
    }

    async fn get_schema(
        &self,
        ctx: &RunContext<'_>,
        run: &mut RunState,
        emitter: &mut StepEmitter,
        requested: Option<&str>,
    ) -> Result<String, AgentError> {
        let tag = ToolTag::GetSchema;
        let n = emitter.allocate_step();
        emitter.tool_input(n, tag, json!({ "data_source_id": requested }));
        let step = emitter.start_step(n, tag.step_title(), tag.content_type());

        let id = match self
            .tools
            .resolve_data_source(requested, &ctx.request.data_source_ids)
            .await
        {
            Ok(id) => id,
            Err(err) => return Ok(fail_tool_step(emitter, n, tag, step, &err)),
        };
        let looked_up = self
            .guard_tool(ctx, self.tools.get_schema(&id))
            .await
            .inspect_err(|err| close_failed_step(emitter, n, tag, step.clone(), err))?;
        let schema = match looked_up {
            Ok(schema) => schema,
            Err(err) => return Ok(fail_tool_step(emitter, n, tag, step, &err)),
        };

        let text = schema.to_prompt_text();
        let tables = schema.tables.len();
        emitter.update_step(
            step.with_data(serde_json::to_value(&schema).unwrap_or_default())
                .with_preview(format!("{tables} tables"))
                .completed(),
        );
        emitter.tool_result(n, tag, true, json!({ "data_source_id": id, "tables": tables }));
        run.schema_text.insert(id.clone(), text.clone());
        Ok(format!("Schema of `{id}`:\n{text}"))
    }

    /// Validate, execute, and repair until the query runs or the budget is
    /// spent. Security denials end the run without touching the repair
    /// budget.
    async fn execute_sql(
        &self,
        ctx: &RunContext<'_>,
        run: &mut RunState,
        emitter: &mut StepEmitter,
        requested: Option<&str>,
        sql: &str,
    ) -> Result<String, AgentError> {
        let tag = ToolTag::ExecuteSql;
        let n = emitter.allocate_step();
        run.executed.insert(sql.trim().to_string());

        let id = match self
            .tools
            .resolve_data_source(requested, &ctx.request.data_source_ids)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                emitter.tool_input(n, tag, json!({ "data_source_id": requested, "sql": null }));
                let step = emitter.start_step(n, tag.step_title(), tag.content_type());
                return Ok(fail_tool_step(emitter, n, tag, step, &err));
            }
        };
        let policy = self.policy_for(&id).await;

        // The SQL input frame goes out once the statement that runs is known,
        // so a repaired query never shows the attempt it replaced.
        let step = emitter.start_step(n, tag.step_title(), tag.content_type());
        let mut current = match validate_sql(sql, &policy) {
            SqlVerdict::Allow { sql: validated } => validated,
            SqlVerdict::Deny { reason } => {
                if reason.is_security_violation() {
                    let input = json!({ "data_source_id": id, "sql": null, "rejected": reason.code() });
                    let err = AgentError::Validation(reason);
                    fail_sql_step(emitter, n, step, input, &err);
                    let detail = redact_text(sql);
                    self.emit_with_source(Level::WARN, ctx, &id, "sql.denied", err.code(), &detail);
                    return Err(err);
                }
                emitter.update_step(step.clone().with_description("Refining the query"));
                let rejected = json!({ "data_source_id": id, "sql": null, "rejected": reason.code() });
                self.repair_sql(ctx, run, &id, sql, &reason.to_string(), &policy)
                    .await
                    .inspect_err(|err| fail_sql_step(emitter, n, step.clone(), rejected, err))?
            }
        };

        let rows = loop {
            let attempted = json!({ "data_source_id": id, "sql": current.as_str() });
            let executed = self
                .guard_tool(ctx, self.tools.execute_sql(&id, &current))
                .await
                .inspect_err(|err| fail_sql_step(emitter, n, step.clone(), attempted.clone(), err))?;
            match executed {
                Ok(rows) => break rows,
                Err(ExecutionError::Query(message)) => {
                    tracing::warn!(
                        "query on `{}` failed: {}",
                        id,
                        redact_text(&message)
                    );
                    emitter.update_step(step.clone().with_description("Refining the query"));
                    current = self
                        .repair_sql(ctx, run, &id, current.as_str(), &message, &policy)
                        .await
                        .inspect_err(|err| fail_sql_step(emitter, n, step.clone(), attempted, err))?;
                    run.executed.insert(current.as_str().to_string());
                }
                Err(err @ ExecutionError::Unavailable(..)) => {
                    let err = AgentError::Execution(err.to_string());
                    fail_sql_step(emitter, n, step, attempted, &err);
                    return Err(err);
                }
            }
        };

        let table = rows.to_table(self.agent.table_row_limit);
        let row_count = rows.rows.len();
        emitter.tool_input(
            n,
            tag,
            json!({ "data_source_id": id, "sql": current.as_str() }),
        );
        let mut finished = step
            .with_description(String::new())
            .with_data(json!({ "sql": current.as_str(), "data_source_id": id, "table": table }))
            .with_preview(format!("{row_count} rows"))
            .completed();
        finished.content_type = StepContentType::Table;
        emitter.update_step(finished);
        emitter.tool_result(
            n,
            tag,
            true,
            json!({ "row_count": row_count, "columns": rows.columns }),
        );

        let feedback = describe_rows(&id, current.as_str(), &rows);
        run.last_rows = Some(rows);
        Ok(feedback)
    }

    fn generate_chart(
        &self,
        run: &RunState,
        emitter: &mut StepEmitter,
        request: &ChartRequest,
        input: Value,
    ) -> String {
        let tag = ToolTag::GenerateChart;
        let n = emitter.allocate_step();
        emitter.tool_input(n, tag, input);
        let step = emitter.start_step(n, tag.step_title(), tag.content_type());

        let charts = match self.tools.generate_charts(request, run.last_rows.as_ref()) {
            Ok(charts) => charts,
            Err(err) => return fail_tool_step(emitter, n, tag, step, &err),
        };
        for config in &charts {
            let title = if config.title.trim().is_empty() {
                tag.step_title()
            } else {
                config.title.as_str()
            };
            emitter.chart(n, config.clone());
            emitter.update_step(
                ProcessingStep::running(n, title, StepContentType::Chart)
                    .with_chart_index(config.chart_index)
                    .with_data(serde_json::to_value(config).unwrap_or_default())
                    .completed(),
            );
        }
        emitter.tool_result(n, tag, true, json!({ "charts": charts.len() }));

        let titles = charts
            .iter()
            .map(|c| format!("{} ({:?})", c.title, c.chart_type))
            .collect::<Vec<_>>()
            .join(", ");
        format!("Generated {} chart(s): {titles}", charts.len())
    }

    async fn repair_sql(
        &self,
        ctx: &RunContext<'_>,
        run: &mut RunState,
        data_source_id: &str,
        failing_sql: &str,
        error: &str,
        policy: &SqlGuardPolicy,
    ) -> Result<ValidatedSql, AgentError> {
        if !run.schema_text.contains_key(data_source_id) {
            match self
                .guard_tool(ctx, self.tools.get_schema(data_source_id))
                .await?
            {
                Ok(schema) => {
                    run.schema_text
                        .insert(data_source_id.to_string(), schema.to_prompt_text());
                }
                Err(err) => tracing::debug!("repair runs without a schema hint: {}", err),
            }
        }
        let repair_ctx = RepairContext {
            question: &ctx.request.question,
            schema: run.schema_text.get(data_source_id).map(String::as_str),
            dialect_hint: dialect_hint(policy.dialect),
        };
        run.repair
            .repair(
                repair_ctx,
                failing_sql,
                error,
                policy,
                &self.providers,
                &ctx.target,
                &ctx.llm,
                ctx.cancel,
            )
            .await
    }

    /// Tool work under the tool deadline. Dropping `work` on timeout or
    /// cancellation interrupts the statement it was running.
    async fn guard_tool<T, F>(&self, ctx: &RunContext<'_>, work: F) -> Result<T, AgentError>
    where
        F: Future<Output = T>,
    {
        let timeout = std::time::Duration::from_millis(self.agent.tool_timeout_ms.max(1));
        let result = guarded("tool", timeout, ctx.cancel, async { Ok(work.await) }).await;
        if let Err(err @ (AgentError::Timeout { .. } | AgentError::Cancelled)) = &result {
            tracing::info!("abandoned tool call after {}", err.code());
        }
        result
    }

    async fn policy_for(&self, data_source_id: &str) -> SqlGuardPolicy {
        if self.sql_policy.dialect != SqlDialect::Generic {
            return self.sql_policy.clone();
        }
        let dialect = self.tools.data_sources().dialect(data_source_id).await;
        self.sql_policy.clone().with_dialect(dialect)
    }

    async fn system_prompt(&self, request: &RunRequest, schemas: &[ToolSchema]) -> String {
        let data_sources = if request.data_source_ids.is_empty() {
            self.tools.data_sources().ids().await
        } else {
            request.data_source_ids.clone()
        };
        let tools = schemas
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You answer questions about data by querying it with read-only SQL.\n\n\
             Tools:\n{tools}\n\n\
             Rules:\n\
             - Call at most one tool per turn and wait for its result.\n\
             - Inspect the schema before writing SQL you are unsure about.\n\
             - Only a single SELECT or WITH query is allowed. Never modify data.\n\
             - Once the results answer the question, reply with the answer and no tool call.\n\n\
             Data sources: {}",
            if data_sources.is_empty() {
                "(none configured)".to_string()
            } else {
                data_sources.join(", ")
            }
        )
    }

    fn emit(
        &self,
        level: Level,
        ctx: &RunContext<'_>,
        event: &str,
        error_code: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                session_id: ctx.request.session_id.as_deref(),
                run_id: Some(&ctx.request.run_id),
                provider_id: ctx.target.provider_id.as_deref(),
                model_id: ctx.target.model_id.as_deref(),
                status: Some(if error_code.is_some() { "failed" } else { "ok" }),
                error_code,
                detail,
                ..ObservabilityEvent::new(event, COMPONENT)
            },
        );
    }

    fn emit_with_source(
        &self,
        level: Level,
        ctx: &RunContext<'_>,
        data_source_id: &str,
        event: &str,
        error_code: &str,
        detail: &str,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                session_id: ctx.request.session_id.as_deref(),
                run_id: Some(&ctx.request.run_id),
                data_source_id: Some(data_source_id),
                status: Some("denied"),
                error_code: Some(error_code),
                detail: Some(detail),
                ..ObservabilityEvent::new(event, COMPONENT)
            },
        );
    }
}

fn parse_call_args(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn fail_tool_step(
    emitter: &mut StepEmitter,
    step_number: u32,
    tag: ToolTag,
    step: ProcessingStep,
    err: &ToolError,
) -> String {
    emitter.update_step(step.with_description(err.to_string()).failed());
    emitter.tool_result(step_number, tag, false, json!({ "error": err.to_string() }));
    format!("Tool `{}` failed: {err}", tag.function_name())
}

fn close_failed_step(
    emitter: &mut StepEmitter,
    step_number: u32,
    tag: ToolTag,
    step: ProcessingStep,
    err: &AgentError,
) {
    let description = match err {
        AgentError::Validation(reason) => reason.to_string(),
        _ => err.user_message(),
    };
    emitter.update_step(step.with_description(description).failed());
    emitter.tool_result(step_number, tag, false, json!({ "error": err.code() }));
}

fn fail_sql_step(
    emitter: &mut StepEmitter,
    step_number: u32,
    step: ProcessingStep,
    input: Value,
    err: &AgentError,
) {
    emitter.tool_input(step_number, ToolTag::ExecuteSql, input);
    close_failed_step(emitter, step_number, ToolTag::ExecuteSql, step, err);
}

fn reject_call(emitter: &mut StepEmitter, name: &str, args: Value, err: &ToolError) -> String {
    let n = emitter.allocate_step();
    match ToolTag::from_function_name(name) {
        Some(tag) => {
            emitter.tool_input(n, tag, args);
            let step = emitter.start_step(n, tag.step_title(), tag.content_type());
            fail_tool_step(emitter, n, tag, step, err)
        }
        None => {
            let step = emitter.start_step(n, "Unknown tool", StepContentType::Text);
            emitter.update_step(step.with_description(err.to_string()).failed());
            format!(
                "Tool `{name}` does not exist. Use one of: {}.",
                ToolTag::ALL
                    .iter()
                    .map(|t| t.function_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
    }
}

fn describe_rows(data_source_id: &str, sql: &str, rows: &RowSet) -> String {
    let mut out = format!(
        "Query on `{data_source_id}` returned {} rows.\nSQL: {sql}\nColumns: {}\n",
        rows.rows.len(),
        rows.columns.join(", ")
    );
    for row in rows.rows.iter().take(FEEDBACK_SAMPLE_ROWS) {
        let cells = row.iter().map(Value::to_string).collect::<Vec<_>>();
        out.push_str(&format!("[{}]\n", cells.join(", ")));
    }
    if rows.rows.len() > FEEDBACK_SAMPLE_ROWS {
        out.push_str(&format!(
            "... {} more rows\n",
            rows.rows.len() - FEEDBACK_SAMPLE_ROWS
        ));
    }
    out
}

fn dialect_hint(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Generic => "ANSI",
        SqlDialect::Postgres => "PostgreSQL",
        SqlDialect::Mysql => "MySQL",
        SqlDialect::Sqlite => "SQLite",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use askql_providers::scripted::{ScriptedProvider, ScriptedTurn};
    use askql_providers::Provider;
    use askql_tools::{DataSourceRegistry, DenyReason, SqliteDataSource};
    use askql_trace::Terminal;
    use askql_types::{StepKey, StepStatus};
    use askql_wire::{StreamEvent, WireFrame};
    use tokio::sync::mpsc;

    const ORDERS: &str = "CREATE TABLE orders (id INTEGER PRIMARY KEY, total_amount REAL, order_date TEXT);
         INSERT INTO orders (total_amount, order_date) VALUES
           (400000.00, '2024-03-01'), (285449.00, '2024-07-15'), (1200.50, '2023-12-30');";

    async fn orchestrator(provider: Arc<ScriptedProvider>, agent: AgentConfig) -> Orchestrator {
        let sources = DataSourceRegistry::new();
        let sqlite = SqliteDataSource::in_memory("shop", ORDERS).expect("sqlite");
        sources.register(Arc::new(sqlite)).await;
        Orchestrator::new(
            ProviderRegistry::from_providers(vec![provider as Arc<dyn Provider>]),
            ToolRegistry::new(sources),
            agent,
            SqlGuardPolicy::default(),
        )
    }

    fn request(question: &str) -> RunRequest {
        RunRequest {
            run_id: "run-1".to_string(),
            question: question.to_string(),
            ..RunRequest::default()
        }
    }

    #[test]
    fn only_the_first_call_of_a_turn_runs() {
        let mut turn = PlannerTurn::default();
        turn.start_call("a", "get_schema".to_string());
        turn.start_call("b", "execute_sql".to_string());
        turn.push_args("b", r#"{"sql":"SELECT 1"}"#);
        let call = turn.next_call(&HashSet::new()).expect("call");
        assert_eq!(call.name, "get_schema");
    }

    #[test]
    fn fenced_sql_counts_as_a_call_once() {
        let turn = PlannerTurn {
            text: "Let me run:\n```sql\nSELECT COUNT(*) FROM orders\n```".to_string(),
            ..PlannerTurn::default()
        };
        let call = turn.next_call(&HashSet::new()).expect("fenced call");
        assert_eq!(call.name, "execute_sql");
        let executed = HashSet::from(["SELECT COUNT(*) FROM orders".to_string()]);
        assert!(turn.next_call(&executed).is_none());
    }

    #[tokio::test]
    async fn answers_after_one_query() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_turn(ScriptedTurn::tool_call(
                    "execute_sql",
                    json!({"sql": "SELECT COUNT(*) AS n FROM orders"}),
                ))
                .with_turn(ScriptedTurn::text("There are 3 orders.")),
        );
        let orchestrator = orchestrator(provider.clone(), AgentConfig::default()).await;
        let mut emitter = StepEmitter::new(None);
        let outcome = orchestrator
            .run(&request("How many orders?"), &mut emitter, &CancellationToken::new())
            .await
            .expect("answer");
        assert_eq!(outcome.final_answer, "There are 3 orders.");
        assert_eq!(outcome.iterations, 2);

        let trace = emitter.into_trace();
        let steps = trace.steps();
        let query = steps.iter().find(|s| s.step_number == 1).expect("query step");
        assert_eq!(query.content_type, StepContentType::Table);
        assert_eq!(query.status, StepStatus::Completed);
        assert_eq!(
            query.content_data.as_ref().and_then(|d| d["table"]["rows"][0][0].as_i64()),
            Some(3)
        );
        assert!(matches!(trace.terminal(), Some(Terminal::Done { .. })));

        let second_prompt = &provider.seen_messages()[1];
        let feedback = second_prompt.last().expect("feedback");
        assert_eq!(feedback.role, "user");
        assert!(feedback.content.contains("returned 1 rows"));
    }

    #[tokio::test]
    async fn tool_argument_errors_are_fed_back() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_turn(ScriptedTurn::tool_call("generate_chart", json!({"chart_type": "bar"})))
                .with_turn(ScriptedTurn::text("Nothing to plot yet.")),
        );
        let orchestrator = orchestrator(provider.clone(), AgentConfig::default()).await;
        let mut emitter = StepEmitter::new(None);
        orchestrator
            .run(&request("Plot sales"), &mut emitter, &CancellationToken::new())
            .await
            .expect("run continues");
        let chart = emitter.trace().step(StepKey::step(1)).cloned().expect("chart step");
        assert_eq!(chart.status, StepStatus::Error);
        assert!(provider.seen_messages()[1]
            .last()
            .is_some_and(|m| m.content.contains("no successful query result")));
    }

    #[tokio::test]
    async fn security_denial_ends_the_run_without_repair() {
        let provider = Arc::new(ScriptedProvider::new().with_turn(ScriptedTurn::tool_call(
            "execute_sql",
            json!({"sql": "DELETE FROM orders"}),
        )));
        let orchestrator = orchestrator(provider.clone(), AgentConfig::default()).await;
        let mut emitter = StepEmitter::new(None);
        let err = orchestrator
            .run(&request("delete everything"), &mut emitter, &CancellationToken::new())
            .await
            .expect_err("denied");
        assert!(matches!(err, AgentError::Validation(DenyReason::ForbiddenStatement { .. })));
        assert!(provider.seen_prompts().is_empty());
        let step = &emitter.trace().steps()[0];
        assert_eq!(step.status, StepStatus::Error);
        assert!(step.content_data.is_none());
    }

    #[tokio::test]
    async fn iteration_limit_stops_a_looping_planner() {
        let provider = Arc::new(ScriptedProvider::new().repeating(ScriptedTurn::tool_call(
            "get_schema",
            json!({}),
        )));
        let agent = AgentConfig {
            max_iterations: 3,
            ..AgentConfig::default()
        };
        let orchestrator = orchestrator(provider.clone(), agent).await;
        let mut emitter = StepEmitter::new(None);
        let err = orchestrator
            .run(&request("loop"), &mut emitter, &CancellationToken::new())
            .await
            .expect_err("limit");
        assert_eq!(err, AgentError::MaxIterationsExceeded(3));
        assert_eq!(provider.seen_messages().len(), 3);
        assert!(matches!(
            emitter.trace().terminal(),
            Some(Terminal::Error { code, .. }) if code == "MAX_ITERATIONS_EXCEEDED"
        ));
    }

    #[tokio::test]
    async fn failed_planner_call_is_retried_before_streaming() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_turn(ScriptedTurn::Fail("503 overloaded".to_string()))
                .with_turn(ScriptedTurn::text("Hello.")),
        );
        let agent = AgentConfig {
            retry_backoff_ms: 1,
            ..AgentConfig::default()
        };
        let orchestrator = orchestrator(provider, agent).await;
        let mut emitter = StepEmitter::new(None);
        let outcome = orchestrator
            .run(&request("hi"), &mut emitter, &CancellationToken::new())
            .await
            .expect("retried");
        assert_eq!(outcome.final_answer, "Hello.");
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WireFrame>) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn repaired_query_streams_only_the_corrected_sql() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_turn(ScriptedTurn::tool_call(
                    "execute_sql",
                    json!({"sql": "SELECT SUM(amount) FROM orders"}),
                ))
                .with_completion("```sql\nSELECT SUM(total_amount) AS total FROM orders\n```")
                .with_turn(ScriptedTurn::text("Total is 686,649.50.")),
        );
        let orchestrator = orchestrator(provider, AgentConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emitter = StepEmitter::new(Some(tx));
        let outcome = orchestrator
            .run(&request("Total sales?"), &mut emitter, &CancellationToken::new())
            .await
            .expect("repaired");
        assert_eq!(outcome.repair_attempts, 1);

        let frames = drain(&mut rx);
        for frame in &frames {
            let raw = serde_json::to_string(frame).expect("json");
            assert!(!raw.contains("SUM(amount)"), "failing SQL leaked in {raw}");
        }
        let inputs = frames
            .iter()
            .filter_map(|f| match &f.event {
                StreamEvent::ToolInput { input, .. } => input["sql"].as_str().map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(inputs, vec!["SELECT SUM(total_amount) AS total FROM orders".to_string()]);
    }

    #[tokio::test]
    async fn several_charts_split_the_chart_step() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_turn(ScriptedTurn::tool_call(
                    "execute_sql",
                    json!({"sql": "SELECT order_date, total_amount FROM orders ORDER BY order_date"}),
                ))
                .with_turn(ScriptedTurn::tool_call(
                    "generate_chart",
                    json!({"charts": [
                        {"type": "bar", "x": "order_date", "y": "total_amount", "title": "Sales by day"},
                        {"type": "line", "x": "order_date", "y": "total_amount", "title": "Trend"}
                    ]}),
                ))
                .with_turn(ScriptedTurn::text("Two charts above.")),
        );
        let orchestrator = orchestrator(provider, AgentConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emitter = StepEmitter::new(Some(tx));
        orchestrator
            .run(&request("Chart sales"), &mut emitter, &CancellationToken::new())
            .await
            .expect("charts");

        let frames = drain(&mut rx);
        let chart_frames = frames
            .iter()
            .filter_map(|f| match &f.event {
                StreamEvent::ChartConfig {
                    step_number,
                    config,
                } => Some((*step_number, config.chart_index)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(chart_frames, vec![(2, 0), (2, 1)]);
        assert!(frames.iter().any(|f| matches!(
            f.event,
            StreamEvent::ToolResult { step_number: 2, success: true, .. }
        )));

        let trace = emitter.trace();
        assert!(trace.step(StepKey::step(2)).is_none());
        for idx in 0..2 {
            let chart = trace
                .step(StepKey::new(2, Some(idx)))
                .expect("chart entry");
            assert_eq!(chart.status, StepStatus::Completed);
            assert_eq!(chart.content_type, StepContentType::Chart);
        }
        let titles = trace.charts().into_iter().map(|c| c.title).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Sales by day".to_string(), "Trend".to_string()]);
    }

    #[tokio::test]
    async fn slow_query_times_out_and_is_abandoned() {
        let provider = Arc::new(ScriptedProvider::new().with_turn(ScriptedTurn::tool_call(
            "execute_sql",
            json!({"sql": "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 2000000000) \
                           SELECT COUNT(*) FROM c"}),
        )));
        let agent = AgentConfig {
            tool_timeout_ms: 50,
            ..AgentConfig::default()
        };
        let orchestrator = orchestrator(provider.clone(), agent).await;
        let mut emitter = StepEmitter::new(None);
        let started = std::time::Instant::now();
        let err = orchestrator
            .run(&request("count forever"), &mut emitter, &CancellationToken::new())
            .await
            .expect_err("timeout");
        assert!(matches!(err, AgentError::Timeout { stage: "tool", .. }));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(provider.seen_prompts().is_empty());

        let step = emitter.trace().step(StepKey::step(1)).cloned().expect("query step");
        assert_eq!(step.status, StepStatus::Error);
        assert!(matches!(
            emitter.trace().terminal(),
            Some(Terminal::Error { code, .. }) if code == "TIMEOUT"
        ));

        // The source still answers once the slow statement is abandoned.
        let rows = orchestrator
            .tools()
            .data_sources()
            .execute_readonly(
                "shop",
                &validate_sql("SELECT COUNT(*) FROM orders", &SqlGuardPolicy::default())
                    .into_result()
                    .expect("valid"),
            )
            .await
            .expect("source usable");
        assert_eq!(rows.scalar(), Some(&json!(3)));
    }

    #[tokio::test]
    async fn exhausted_repairs_fail_the_step_and_the_run() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_turn(ScriptedTurn::tool_call(
                    "execute_sql",
                    json!({"sql": "SELECT revenue FROM orders"}),
                ))
                .with_completion("```sql\nSELECT revenue_total FROM orders\n```"),
        );
        let agent = AgentConfig {
            max_repair_attempts: 1,
            ..AgentConfig::default()
        };
        let orchestrator = orchestrator(provider.clone(), agent).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emitter = StepEmitter::new(Some(tx));
        let err = orchestrator
            .run(&request("Revenue?"), &mut emitter, &CancellationToken::new())
            .await
            .expect_err("exhausted");
        assert!(matches!(err, AgentError::RepairExhausted { attempts: 1, .. }));
        assert_eq!(provider.seen_prompts().len(), 1);

        let step = emitter.trace().step(StepKey::step(1)).cloned().expect("query step");
        assert_eq!(step.status, StepStatus::Error);
        let frames = drain(&mut rx);
        assert!(matches!(
            frames.last().map(|f| &f.event),
            Some(StreamEvent::Error { code, .. }) if code == "REPAIR_EXHAUSTED"
        ));
        assert!(frames.iter().any(|f| matches!(
            f.event,
            StreamEvent::ToolResult { step_number: 1, success: false, .. }
        )));
    }
}
