use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use askql_trace::{format_response, FormatOptions};
use askql_types::{
    Message, MessageMetadata, MessageRole, MessageStatus, QueryRequest, QueryResponse,
};

use crate::cancellation::CancellationRegistry;
use crate::emitter::{FrameSender, StepEmitter};
use crate::error::AgentError;
use crate::history::HistorySanitizer;
use crate::llm::ModelTarget;
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::sessions::SessionStore;

/// Session-aware front of the agent: loads history, runs the orchestrator,
/// and persists the finalized assistant message whatever the outcome.
#[derive(Clone)]
pub struct QueryEngine {
    orchestrator: Orchestrator,
    sessions: Arc<SessionStore>,
    cancellations: CancellationRegistry,
    sanitizer: HistorySanitizer,
}

impl QueryEngine {
    pub fn new(orchestrator: Orchestrator, sessions: Arc<SessionStore>) -> Self {
        let agent = orchestrator.agent_config();
        let sanitizer = HistorySanitizer::new(&agent.strip_rules, agent.history_limit);
        Self {
            orchestrator,
            sessions,
            cancellations: CancellationRegistry::new(),
            sanitizer,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Signals the session's active run, if any.
    pub async fn cancel(&self, session_id: &str) -> bool {
        self.cancellations.cancel(session_id).await
    }

    pub async fn run(
        &self,
        request: QueryRequest,
        sink: Option<FrameSender>,
        cancel: CancellationToken,
    ) -> Result<QueryResponse, AgentError> {
        self.run_as(Uuid::new_v4().to_string(), request, sink, cancel)
            .await
    }

    /// Same as [`QueryEngine::run`] under a run id the caller already handed
    /// out, so logs and the cancel registry agree with it.
    pub async fn run_as(
        &self,
        run_id: String,
        request: QueryRequest,
        sink: Option<FrameSender>,
        cancel: CancellationToken,
    ) -> Result<QueryResponse, AgentError> {
        let question = request.query.trim().to_string();
        let session = self
            .sessions
            .get_or_create(
                request.session_id.as_deref(),
                &question,
                &request.data_source_ids,
            )
            .await?;
        let data_source_ids = if request.data_source_ids.is_empty() {
            session.data_source_ids.clone()
        } else {
            request.data_source_ids.clone()
        };
        let history = if request.history.is_empty() {
            self.sanitizer.from_session(&session.messages)
        } else {
            self.sanitizer.from_request(&request.history)
        };
        self.sessions
            .append_message(&session.id, Message::user(question.clone()))
            .await?;

        let run_request = RunRequest {
            run_id,
            session_id: Some(session.id.clone()),
            question,
            history,
            data_source_ids,
            target: request
                .model
                .map(|spec| ModelTarget {
                    provider_id: Some(spec.provider_id),
                    model_id: Some(spec.model_id),
                })
                .unwrap_or_default(),
        };

        self.cancellations
            .register(&session.id, &run_request.run_id, cancel.clone())
            .await;
        let mut emitter = StepEmitter::new(sink);
        let result = self
            .orchestrator
            .run(&run_request, &mut emitter, &cancel)
            .await;
        self.cancellations
            .remove(&session.id, &run_request.run_id)
            .await;

        let trace = emitter.into_trace();
        let options = FormatOptions {
            max_table_rows: self.orchestrator.agent_config().table_row_limit,
        };
        let mut message = Message::new(MessageRole::Assistant, trace.final_content());
        match result {
            Ok(outcome) => {
                let formatted = format_response(&outcome.final_answer, &trace, options);
                message.metadata = formatted.metadata();
                let message_id = message.id.clone();
                self.sessions.append_message(&session.id, message).await?;
                Ok(formatted.into_query_response(session.id, message_id))
            }
            Err(err) => {
                let formatted = format_response("", &trace, options);
                message.status = MessageStatus::Error;
                message.content = err.user_message();
                message.metadata = MessageMetadata {
                    error_code: Some(err.code().to_string()),
                    ..formatted.metadata()
                };
                if let Err(store_err) = self.sessions.append_message(&session.id, message).await {
                    tracing::error!(
                        "failed to persist error message for session {}: {}",
                        session.id,
                        store_err
                    );
                }
                Err(err)
            }
        }
    }
}
