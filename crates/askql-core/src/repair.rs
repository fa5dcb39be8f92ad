use std::sync::OnceLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use askql_providers::ProviderRegistry;
use askql_tools::{validate_sql, SqlGuardPolicy, SqlVerdict, ValidatedSql};

use crate::error::AgentError;
use crate::llm::{complete_with_policy, LlmPolicy, ModelTarget};

/// What the repair prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct RepairContext<'a> {
    pub question: &'a str,
    pub schema: Option<&'a str>,
    pub dialect_hint: &'a str,
}

/// Per-run repair budget. Counts every repair call the model receives; the
/// failures it saw are kept only for the exhaustion explanation.
#[derive(Debug, Clone)]
pub struct RepairController {
    max_attempts: u32,
    attempts: u32,
    failures: Vec<String>,
}

impl RepairController {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            failures: Vec::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Asks the model for a corrected query until one validates or the budget
    /// runs out. A corrected query that trips a security rule ends the run.
    #[allow(clippy::too_many_arguments)]
    pub async fn repair(
        &mut self,
        ctx: RepairContext<'_>,
        failing_sql: &str,
        error: &str,
        policy: &SqlGuardPolicy,
        providers: &ProviderRegistry,
        target: &ModelTarget,
        llm: &LlmPolicy,
        cancel: &CancellationToken,
    ) -> Result<ValidatedSql, AgentError> {
        let mut sql = failing_sql.to_string();
        let mut error = error.to_string();
        loop {
            self.failures.push(error.clone());
            if self.attempts >= self.max_attempts {
                return Err(self.exhausted());
            }
            self.attempts += 1;
            tracing::info!(
                "repair attempt {}/{} requested",
                self.attempts,
                self.max_attempts
            );

            let prompt = build_repair_prompt(ctx, &sql, &error);
            let reply = complete_with_policy(providers, target, &prompt, llm, cancel).await?;
            let Some(candidate) = extract_sql_candidate(&reply) else {
                error = "the reply did not contain a SQL query".to_string();
                continue;
            };
            match validate_sql(&candidate, policy) {
                SqlVerdict::Allow { sql } => return Ok(sql),
                SqlVerdict::Deny { reason } if reason.is_security_violation() => {
                    return Err(AgentError::Validation(reason));
                }
                SqlVerdict::Deny { reason } => {
                    sql = candidate;
                    error = reason.to_string();
                }
            }
        }
    }

    fn exhausted(&self) -> AgentError {
        let explanation = self
            .failures
            .iter()
            .enumerate()
            .map(|(idx, failure)| {
                if idx == 0 {
                    format!("original query: {failure}")
                } else {
                    format!("attempt {idx}: {failure}")
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        AgentError::RepairExhausted {
            attempts: self.attempts,
            explanation,
        }
    }
}

pub fn build_repair_prompt(ctx: RepairContext<'_>, failing_sql: &str, error: &str) -> String {
    let mut prompt = format!(
        "You are fixing a read-only {dialect} SQL query.\n\
         Question: {question}\n\n\
         The query below failed:\n```sql\n{failing_sql}\n```\n\
         Error: {error}\n",
        dialect = ctx.dialect_hint,
        question = ctx.question.trim(),
    );
    if let Some(schema) = ctx.schema.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\nSchema:\n");
        prompt.push_str(schema);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nReply with exactly one corrected SELECT statement in a ```sql fenced block \
         and nothing else.",
    );
    prompt
}

fn fenced_sql() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?is)```(?:sql|sqlite|postgres|postgresql|mysql)?[ \t]*\n?(.*?)```").ok())
        .as_ref()
}

/// Body of the first ```sql fenced block.
pub fn extract_fenced_sql(text: &str) -> Option<String> {
    let captures = fenced_sql()?.captures(text)?;
    let body = captures.get(1)?.as_str().trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// SQL from a fenced block, or a bare reply that starts like a query.
pub fn extract_sql_candidate(reply: &str) -> Option<String> {
    if let Some(sql) = extract_fenced_sql(reply) {
        return Some(sql);
    }
    let trimmed = reply.trim();
    let head = trimmed
        .split_whitespace()
        .next()
        .map(|w| w.to_ascii_uppercase())
        .unwrap_or_default();
    if head == "SELECT" || head == "WITH" || head.starts_with('(') {
        Some(trimmed.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use askql_providers::scripted::ScriptedProvider;
    use askql_providers::Provider;
    use askql_tools::DenyReason;

    const CTX: RepairContext<'static> = RepairContext {
        question: "total sales in 2024",
        schema: Some("- orders(total_amount REAL, order_date TEXT)"),
        dialect_hint: "sqlite",
    };

    fn llm() -> LlmPolicy {
        LlmPolicy {
            timeout: Duration::from_secs(5),
            retry_attempts: 0,
            backoff: Duration::from_millis(1),
        }
    }

    fn providers(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, ProviderRegistry) {
        let provider = Arc::new(provider);
        let registry = ProviderRegistry::from_providers(vec![provider.clone() as Arc<dyn Provider>]);
        (provider, registry)
    }

    #[test]
    fn extracts_fenced_or_bare_sql() {
        assert_eq!(
            extract_sql_candidate("Sure:\n```sql\nSELECT 1\n```\nDone").as_deref(),
            Some("SELECT 1")
        );
        assert_eq!(
            extract_sql_candidate("  select count(*) from orders ").as_deref(),
            Some("select count(*) from orders")
        );
        assert_eq!(extract_sql_candidate("I cannot help with that"), None);
    }

    #[test]
    fn prompt_carries_question_sql_error_and_schema() {
        let prompt = build_repair_prompt(CTX, "SELECT revenue FROM orders", "no such column: revenue");
        assert!(prompt.contains("total sales in 2024"));
        assert!(prompt.contains("SELECT revenue FROM orders"));
        assert!(prompt.contains("no such column: revenue"));
        assert!(prompt.contains("orders(total_amount REAL"));
    }

    #[tokio::test]
    async fn first_valid_candidate_wins() {
        let (provider, registry) = providers(
            ScriptedProvider::new()
                .with_completion("no sql here")
                .with_completion("```sql\nSELECT SUM(total_amount) FROM orders\n```"),
        );
        let mut controller = RepairController::new(2);
        let sql = controller
            .repair(
                CTX,
                "SELECT revenue FROM orders",
                "no such column: revenue",
                &SqlGuardPolicy::default(),
                &registry,
                &ModelTarget::default(),
                &llm(),
                &CancellationToken::new(),
            )
            .await
            .expect("repaired");
        assert!(sql.as_str().contains("SUM(total_amount)"));
        assert_eq!(controller.attempts(), 2);
        assert_eq!(provider.seen_prompts().len(), 2);
        assert!(provider.seen_prompts()[1].contains("did not contain a SQL query"));
    }

    #[tokio::test]
    async fn exhaustion_explains_every_failure() {
        let (_, registry) = providers(ScriptedProvider::new().with_completion("SELECT total_amount FROM orders WHERE"));
        let mut controller = RepairController::new(1);
        let err = controller
            .repair(
                CTX,
                "SELECT revenue FROM orders",
                "no such column: revenue",
                &SqlGuardPolicy::default(),
                &registry,
                &ModelTarget::default(),
                &llm(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("exhausted");
        match err {
            AgentError::RepairExhausted {
                attempts,
                explanation,
            } => {
                assert_eq!(attempts, 1);
                assert!(explanation.contains("original query: no such column"));
                assert!(explanation.contains("attempt 1: SQL could not be parsed"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(controller.remaining(), 0);
    }

    #[tokio::test]
    async fn unsafe_correction_is_terminal() {
        let (_, registry) = providers(ScriptedProvider::new().with_completion("```sql\nDROP TABLE orders\n```"));
        let err = RepairController::new(2)
            .repair(
                CTX,
                "SELECT revenue FROM orders",
                "no such column: revenue",
                &SqlGuardPolicy::default(),
                &registry,
                &ModelTarget::default(),
                &llm(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("denied");
        assert!(matches!(err, AgentError::Validation(DenyReason::ForbiddenStatement { .. })));
    }
}
