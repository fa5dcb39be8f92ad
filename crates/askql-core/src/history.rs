//! Prior turns reused as planner context. Assistant text is passed through a
//! configurable strip rule set first so stale error chatter from earlier runs
//! does not steer the planner.
//!
//! Default rules drop lines that start with `Error:` or `SQL error`, and any
//! sentence fragment naming a missing column/table or a syntax error.

use regex::Regex;
use serde::{Deserialize, Serialize};

use askql_providers::ChatMessage;
use askql_types::{HistoryMessage, Message, MessageRole, MessageStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StripRule {
    /// Remove every occurrence of the text.
    Substring { pattern: String },
    /// Remove every match of the expression.
    Regex { pattern: String },
    /// Drop whole lines starting with the prefix (leading whitespace ignored).
    LinePrefix { prefix: String },
}

pub fn default_strip_rules() -> Vec<StripRule> {
    vec![
        StripRule::LinePrefix {
            prefix: "Error:".to_string(),
        },
        StripRule::LinePrefix {
            prefix: "SQL error".to_string(),
        },
        StripRule::Regex {
            pattern: r"(?i)(no such (column|table)|syntax error)[^\n.]*\.?".to_string(),
        },
    ]
}

/// Compiled form of a rule list. Invalid regexes are skipped with a warning.
#[derive(Debug, Clone)]
pub struct HistorySanitizer {
    rules: Vec<CompiledRule>,
    limit: usize,
}

#[derive(Debug, Clone)]
enum CompiledRule {
    Substring(String),
    Regex(Regex),
    LinePrefix(String),
}

impl HistorySanitizer {
    pub fn new(rules: &[StripRule], limit: usize) -> Self {
        let rules = rules
            .iter()
            .filter_map(|rule| match rule {
                StripRule::Substring { pattern } if !pattern.is_empty() => {
                    Some(CompiledRule::Substring(pattern.clone()))
                }
                StripRule::Regex { pattern } => match Regex::new(pattern) {
                    Ok(re) => Some(CompiledRule::Regex(re)),
                    Err(err) => {
                        tracing::warn!("ignoring invalid history strip regex `{}`: {}", pattern, err);
                        None
                    }
                },
                StripRule::LinePrefix { prefix } if !prefix.is_empty() => {
                    Some(CompiledRule::LinePrefix(prefix.clone()))
                }
                _ => None,
            })
            .collect();
        Self { rules, limit }
    }

    pub fn strip(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in &self.rules {
            out = match rule {
                CompiledRule::Substring(pattern) => out.replace(pattern.as_str(), ""),
                CompiledRule::Regex(re) => re.replace_all(&out, "").into_owned(),
                CompiledRule::LinePrefix(prefix) => out
                    .lines()
                    .filter(|line| !line.trim_start().starts_with(prefix.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
        }
        out.trim().to_string()
    }

    /// Finished turns of a stored session, oldest first, capped at `limit`.
    pub fn from_session(&self, messages: &[Message]) -> Vec<ChatMessage> {
        let turns = messages
            .iter()
            .filter(|m| m.status == MessageStatus::Sent)
            .map(|m| (m.role, m.content.as_str()));
        self.collect(turns)
    }

    /// History supplied with the request.
    pub fn from_request(&self, history: &[HistoryMessage]) -> Vec<ChatMessage> {
        self.collect(history.iter().map(|m| (m.role, m.content.as_str())))
    }

    fn collect<'a>(&self, turns: impl Iterator<Item = (MessageRole, &'a str)>) -> Vec<ChatMessage> {
        let mut out = turns
            .filter_map(|(role, content)| {
                let content = match role {
                    MessageRole::User => content.trim().to_string(),
                    MessageRole::Assistant => self.strip(content),
                    MessageRole::System => return None,
                };
                if content.is_empty() {
                    return None;
                }
                let role = match role {
                    MessageRole::User => "user",
                    _ => "assistant",
                };
                Some(ChatMessage::new(role, content))
            })
            .collect::<Vec<_>>();
        if out.len() > self.limit {
            out.drain(..out.len() - self.limit);
        }
        out
    }
}
