use askql_tools::DenyReason;

/// Terminal failure of one agent run. The session itself always survives.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("SQL rejected: {0}")]
    Validation(DenyReason),
    #[error("query execution failed: {0}")]
    Execution(String),
    #[error("query could not be repaired after {attempts} attempts: {explanation}")]
    RepairExhausted { attempts: u32, explanation: String },
    #[error("{stage} timed out after {timeout_ms} ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },
    #[error("run cancelled")]
    Cancelled,
    #[error("upstream model error: {0}")]
    UpstreamLlm(String),
    #[error("no answer within {0} iterations")]
    MaxIterationsExceeded(u32),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "VALIDATION_ERROR",
            AgentError::Execution(_) => "EXECUTION_ERROR",
            AgentError::RepairExhausted { .. } => "REPAIR_EXHAUSTED",
            AgentError::Timeout { .. } => "TIMEOUT",
            AgentError::Cancelled => "CANCELLED",
            AgentError::UpstreamLlm(_) => "UPSTREAM_LLM_ERROR",
            AgentError::MaxIterationsExceeded(_) => "MAX_ITERATIONS_EXCEEDED",
            AgentError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Text safe to show an end user. Raw driver and provider errors stay in
    /// the logs.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Validation(reason) => {
                format!("This request was blocked because it is not a read-only query: {reason}.")
            }
            AgentError::Execution(_) => {
                "The data source could not run the query. Please try again later.".to_string()
            }
            AgentError::RepairExhausted { attempts, explanation } => format!(
                "I could not build a working query after {attempts} correction attempts. {explanation}"
            ),
            AgentError::Timeout { stage, .. } => {
                format!("The request took too long ({stage}). Please try again.")
            }
            AgentError::Cancelled => "The request was cancelled.".to_string(),
            AgentError::UpstreamLlm(_) => {
                "The language model is unavailable right now. Please try again.".to_string()
            }
            AgentError::MaxIterationsExceeded(_) => {
                "I could not reach an answer within the step limit. Try a more specific question."
                    .to_string()
            }
            AgentError::Internal(_) => "Something went wrong while answering.".to_string(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            AgentError::Validation(_)
            | AgentError::Execution(_)
            | AgentError::RepairExhausted { .. }
            | AgentError::MaxIterationsExceeded(_) => 422,
            AgentError::Timeout { .. } => 504,
            AgentError::UpstreamLlm(_) => 502,
            AgentError::Cancelled => 409,
            AgentError::Internal(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::UpstreamLlm(_))
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}
