//! Read-only SQL gate. Every statement that reaches a data source, and every
//! SQL string shown to a user, goes through [`validate_sql`] first.

use std::fmt;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use sqlparser::ast::{visit_expressions, visit_relations, Expr, ObjectName, Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    #[default]
    Generic,
    Postgres,
    Mysql,
    Sqlite,
}

impl SqlDialect {
    fn dialect(self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Generic => Box::new(GenericDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
            SqlDialect::Mysql => Box::new(MySqlDialect {}),
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SqlGuardPolicy {
    pub dialect: SqlDialect,
    pub blocked_schemas: Vec<String>,
    pub blocked_relation_prefixes: Vec<String>,
    /// Fully qualified (or bare) relation names exempt from the catalog rules.
    pub allowed_relations: Vec<String>,
    pub blocked_functions: Vec<String>,
}

impl Default for SqlGuardPolicy {
    fn default() -> Self {
        Self {
            dialect: SqlDialect::Generic,
            blocked_schemas: to_strings(&[
                "pg_catalog",
                "information_schema",
                "mysql",
                "performance_schema",
                "sys",
            ]),
            blocked_relation_prefixes: to_strings(&["pg_", "sqlite_"]),
            allowed_relations: Vec::new(),
            blocked_functions: to_strings(&[
                "pg_sleep",
                "pg_read_file",
                "pg_ls_dir",
                "load_file",
                "dblink",
                "lo_import",
                "lo_export",
                "sleep",
                "benchmark",
            ]),
        }
    }
}

impl SqlGuardPolicy {
    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// SQL that passed [`validate_sql`]. Only this module can build one, so a
/// function taking `&ValidatedSql` cannot be handed unchecked text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidatedSql(String);

impl ValidatedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ValidatedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    #[error("empty SQL statement")]
    Empty,
    #[error("multiple statements are not allowed ({count} found)")]
    MultipleStatements { count: usize },
    #[error("only SELECT queries are allowed, found {keyword}")]
    ForbiddenStatement { keyword: String },
    #[error("SQL could not be parsed: {message}")]
    Unparseable { message: String },
    #[error("access to system relation `{relation}` is not allowed")]
    SystemCatalog { relation: String },
    #[error("function `{name}` is not allowed")]
    BlockedFunction { name: String },
}

impl DenyReason {
    /// Security denials end the run. Only a parse failure may be repaired.
    pub fn is_security_violation(&self) -> bool {
        !matches!(self, DenyReason::Unparseable { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Empty => "empty",
            DenyReason::MultipleStatements { .. } => "multiple_statements",
            DenyReason::ForbiddenStatement { .. } => "forbidden_statement",
            DenyReason::Unparseable { .. } => "unparseable",
            DenyReason::SystemCatalog { .. } => "system_catalog",
            DenyReason::BlockedFunction { .. } => "blocked_function",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SqlVerdict {
    Allow { sql: ValidatedSql },
    Deny { reason: DenyReason },
}

impl SqlVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SqlVerdict::Allow { .. })
    }

    pub fn into_result(self) -> Result<ValidatedSql, DenyReason> {
        match self {
            SqlVerdict::Allow { sql } => Ok(sql),
            SqlVerdict::Deny { reason } => Err(reason),
        }
    }
}

pub fn validate_sql(candidate: &str, policy: &SqlGuardPolicy) -> SqlVerdict {
    match check(candidate, policy) {
        Ok(sql) => SqlVerdict::Allow { sql },
        Err(reason) => SqlVerdict::Deny { reason },
    }
}

fn check(candidate: &str, policy: &SqlGuardPolicy) -> Result<ValidatedSql, DenyReason> {
    let trimmed = candidate.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim();
    if trimmed.is_empty() {
        return Err(DenyReason::Empty);
    }

    let dialect = policy.dialect.dialect();
    let tokens = Tokenizer::new(dialect.as_ref(), trimmed)
        .tokenize()
        .map_err(|err| DenyReason::Unparseable {
            message: err.to_string(),
        })?;

    let statements = count_statements(&tokens);
    if statements == 0 {
        return Err(DenyReason::Empty);
    }
    if statements > 1 {
        return Err(DenyReason::MultipleStatements { count: statements });
    }

    match tokens.iter().find(|t| is_significant(t)) {
        Some(Token::Word(word)) if matches!(word.keyword, Keyword::SELECT | Keyword::WITH) => {}
        Some(Token::LParen) => {}
        Some(Token::Word(word)) => {
            return Err(DenyReason::ForbiddenStatement {
                keyword: word.value.to_ascii_uppercase(),
            })
        }
        Some(other) => {
            return Err(DenyReason::ForbiddenStatement {
                keyword: other.to_string(),
            })
        }
        None => return Err(DenyReason::Empty),
    }

    let mut parsed =
        Parser::parse_sql(dialect.as_ref(), trimmed).map_err(|err| DenyReason::Unparseable {
            message: err.to_string(),
        })?;
    if parsed.len() != 1 {
        return Err(DenyReason::MultipleStatements {
            count: parsed.len(),
        });
    }
    let statement = parsed.remove(0);
    let Statement::Query(query) = &statement else {
        return Err(DenyReason::ForbiddenStatement {
            keyword: statement_keyword(&statement),
        });
    };

    check_query(query)?;
    check_relations(&statement, policy)?;
    check_functions(&statement, policy)?;

    let normalized = statement.to_string();
    let normalized = normalized.trim().trim_end_matches(';').to_string();
    Ok(ValidatedSql(normalized))
}

fn is_significant(token: &Token) -> bool {
    !matches!(token, Token::Whitespace(_) | Token::EOF)
}

/// Counts `;`-separated segments holding at least one significant token.
/// Comments and quoted text are single tokens, so semicolons inside them
/// never split.
fn count_statements(tokens: &[Token]) -> usize {
    let mut count = 0;
    let mut segment_has_content = false;
    for token in tokens {
        match token {
            Token::SemiColon => {
                if segment_has_content {
                    count += 1;
                }
                segment_has_content = false;
            }
            t if is_significant(t) => segment_has_content = true,
            _ => {}
        }
    }
    if segment_has_content {
        count += 1;
    }
    count
}

fn statement_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_ascii_uppercase()
}

fn check_query(query: &Query) -> Result<(), DenyReason> {
    if !query.locks.is_empty() {
        return Err(DenyReason::ForbiddenStatement {
            keyword: "FOR UPDATE".to_string(),
        });
    }
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            check_query(&cte.query)?;
        }
    }
    check_set_expr(&query.body)
}

fn check_set_expr(body: &SetExpr) -> Result<(), DenyReason> {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return Err(DenyReason::ForbiddenStatement {
                    keyword: "SELECT INTO".to_string(),
                });
            }
            Ok(())
        }
        SetExpr::Query(inner) => check_query(inner),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left)?;
            check_set_expr(right)
        }
        SetExpr::Insert(_) => Err(DenyReason::ForbiddenStatement {
            keyword: "INSERT".to_string(),
        }),
        SetExpr::Update(_) => Err(DenyReason::ForbiddenStatement {
            keyword: "UPDATE".to_string(),
        }),
        _ => Ok(()),
    }
}

fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0.iter().map(|ident| ident.value.to_lowercase()).collect()
}

fn check_relations(statement: &Statement, policy: &SqlGuardPolicy) -> Result<(), DenyReason> {
    let flow = visit_relations(statement, |relation: &ObjectName| {
        let parts = name_parts(relation);
        let qualified = parts.join(".");
        let Some(bare) = parts.last() else {
            return ControlFlow::Continue(());
        };
        let allowed = policy
            .allowed_relations
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&qualified) || a.eq_ignore_ascii_case(bare));
        if allowed {
            return ControlFlow::Continue(());
        }
        let schema_blocked = parts[..parts.len() - 1].iter().any(|part| {
            policy
                .blocked_schemas
                .iter()
                .any(|s| s.eq_ignore_ascii_case(part))
        });
        let prefix_blocked = policy
            .blocked_relation_prefixes
            .iter()
            .any(|prefix| bare.starts_with(&prefix.to_lowercase()));
        if schema_blocked || prefix_blocked {
            return ControlFlow::Break(DenyReason::SystemCatalog {
                relation: qualified,
            });
        }
        // table-valued functions show up as relations
        if is_blocked_function(bare, policy) {
            return ControlFlow::Break(DenyReason::BlockedFunction { name: bare.clone() });
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(reason) => Err(reason),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn is_blocked_function(name: &str, policy: &SqlGuardPolicy) -> bool {
    policy
        .blocked_functions
        .iter()
        .any(|f| f.eq_ignore_ascii_case(name))
}

fn check_functions(statement: &Statement, policy: &SqlGuardPolicy) -> Result<(), DenyReason> {
    let flow = visit_expressions(statement, |expr: &Expr| {
        if let Expr::Function(function) = expr {
            if let Some(name) = name_parts(&function.name).last() {
                if is_blocked_function(name, policy) {
                    return ControlFlow::Break(DenyReason::BlockedFunction { name: name.clone() });
                }
            }
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(reason) => Err(reason),
        ControlFlow::Continue(()) => Ok(()),
    }
}
