use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::{json, Value};
use tokio::task;

use askql_types::{ColumnSchema, RowSet, SchemaDescriptor, TableSchema};

use crate::datasource::{DataSource, ExecutionError};
use crate::sql_guard::SqlDialect;

const DEFAULT_MAX_ROWS: usize = 10_000;

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Read-only SQLite data source. Every execution opens its own connection,
/// so concurrent runs neither queue behind each other nor share an
/// interrupt handle. File databases are opened with `SQLITE_OPEN_READ_ONLY`;
/// every connection also runs with `PRAGMA query_only`.
pub struct SqliteDataSource {
    id: String,
    target: PathBuf,
    flags: OpenFlags,
    // Holds a shared-cache in-memory database open between executions.
    _keeper: Option<Mutex<Connection>>,
    max_rows: usize,
}

impl SqliteDataSource {
    pub fn open_readonly(id: impl Into<String>, path: &Path) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        // Fail at startup rather than on the first question.
        connect(path, flags)?;
        Ok(Self {
            id: id.into(),
            target: path.to_path_buf(),
            flags,
            _keeper: None,
            max_rows: DEFAULT_MAX_ROWS,
        })
    }

    /// In-memory database seeded by `setup_sql`, read-only for queries.
    pub fn in_memory(id: impl Into<String>, setup_sql: &str) -> anyhow::Result<Self> {
        let uri = format!(
            "file:askql-mem-{}-{}?mode=memory&cache=shared",
            std::process::id(),
            MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let keeper = Connection::open_with_flags(&uri, flags | OpenFlags::SQLITE_OPEN_CREATE)?;
        keeper.execute_batch(setup_sql)?;
        Ok(Self {
            id: id.into(),
            target: PathBuf::from(uri),
            flags,
            _keeper: Some(Mutex::new(keeper)),
            max_rows: DEFAULT_MAX_ROWS,
        })
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    fn unavailable(&self, message: impl ToString) -> ExecutionError {
        ExecutionError::Unavailable(self.id.clone(), message.to_string())
    }
}

fn connect(target: &Path, flags: OpenFlags) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(target, flags)?;
    conn.execute_batch("PRAGMA query_only = 1;")?;
    Ok(conn)
}

/// Interrupts one connection when dropped armed. Held across the query's
/// await, so abandoning the future stops exactly that statement.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            tracing::debug!("interrupting abandoned sqlite statement");
            handle.interrupt();
        }
    }
}

#[async_trait]
impl DataSource for SqliteDataSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn get_schema(&self) -> anyhow::Result<SchemaDescriptor> {
        let (target, flags) = (self.target.clone(), self.flags);
        let id = self.id.clone();
        task::spawn_blocking(move || read_schema(&connect(&target, flags)?, id))
            .await
            .map_err(|err| anyhow::anyhow!("schema task join error: {}", err))?
    }

    async fn execute_readonly(&self, sql: &str) -> Result<RowSet, ExecutionError> {
        let (target, flags) = (self.target.clone(), self.flags);
        let conn = task::spawn_blocking(move || connect(&target, flags))
            .await
            .map_err(|err| self.unavailable(err))?
            .map_err(|err| self.unavailable(err))?;
        let mut interrupt = InterruptOnDrop(Some(conn.get_interrupt_handle()));
        let sql = sql.to_string();
        let max_rows = self.max_rows;
        let result = task::spawn_blocking(move || run_query(&conn, &sql, max_rows))
            .await
            .map_err(|err| self.unavailable(err))?;
        interrupt.disarm();
        result
    }
}

fn read_schema(conn: &Connection, data_source_id: String) -> anyhow::Result<SchemaDescriptor> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
        let mut info = conn.prepare(&pragma)?;
        let columns = info
            .query_map([], |row| {
                Ok(ColumnSchema {
                    name: row.get(1)?,
                    data_type: row.get::<_, String>(2)?,
                    nullable: row.get::<_, i64>(3)? == 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        tables.push(TableSchema { name, columns });
    }
    Ok(SchemaDescriptor {
        data_source_id,
        tables,
    })
}

fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> Result<RowSet, ExecutionError> {
    let query_error = |err: rusqlite::Error| ExecutionError::Query(err.to_string());
    let mut stmt = conn.prepare(sql).map_err(query_error)?;
    if !stmt.readonly() {
        return Err(ExecutionError::Query(
            "statement would modify the database".to_string(),
        ));
    }
    let columns = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(query_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(query_error)? {
        if out.len() >= max_rows {
            break;
        }
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(to_json(row.get_ref(idx).map_err(query_error)?));
        }
        out.push(values);
    }
    Ok(RowSet::new(columns, out))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => json!(v),
        ValueRef::Real(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}
