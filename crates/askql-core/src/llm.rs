use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use askql_providers::ProviderRegistry;

use crate::config::AgentConfig;
use crate::error::AgentError;

/// Timeout and retry budget shared by planner turns and repair calls.
#[derive(Debug, Clone, Copy)]
pub struct LlmPolicy {
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub backoff: Duration,
}

impl LlmPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.llm_timeout_ms.max(1)),
            retry_attempts: config.llm_retry_attempts,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Exponential: `backoff * 2^attempt`, attempt counted from 0.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// The model a run talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelTarget {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

/// Races `work` against the run's token and a deadline.
pub async fn guarded<T, F>(
    stage: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        result = tokio::time::timeout(timeout, work) => match result {
            Ok(inner) => inner,
            Err(_) => Err(AgentError::Timeout { stage, timeout_ms }),
        },
    }
}

/// Sleeps before the next retry unless the run is cancelled first.
pub async fn backoff(policy: &LlmPolicy, attempt: u32, cancel: &CancellationToken) -> Result<(), AgentError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        _ = tokio::time::sleep(policy.delay_for(attempt)) => Ok(()),
    }
}

/// One non-streaming completion with the policy's timeout and retries.
pub async fn complete_with_policy(
    providers: &ProviderRegistry,
    target: &ModelTarget,
    prompt: &str,
    policy: &LlmPolicy,
    cancel: &CancellationToken,
) -> Result<String, AgentError> {
    let mut attempt = 0;
    loop {
        let call = async {
            providers
                .complete_for_provider(target.provider_id.as_deref(), prompt, target.model_id.as_deref())
                .await
                .map_err(|err| AgentError::UpstreamLlm(err.to_string()))
        };
        match guarded("repair", policy.timeout, cancel, call).await {
            Err(AgentError::UpstreamLlm(message)) if attempt < policy.retry_attempts => {
                tracing::warn!(
                    "completion failed (attempt {}/{}): {}",
                    attempt + 1,
                    policy.retry_attempts + 1,
                    message
                );
                backoff(policy, attempt, cancel).await?;
                attempt += 1;
            }
            other => return other,
        }
    }
}
