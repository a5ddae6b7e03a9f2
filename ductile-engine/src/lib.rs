//! Single ownership of the embedded DuckDB engine.
//!
//! All DDL (connection init statements, cache refreshes) is serialized
//! through one writer connection; read queries run on a small pool of
//! cloned connections bounded by a semaphore. Every DuckDB call happens
//! inside `spawn_blocking` so request flows never block a runtime worker.

mod error;
mod value;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use ductile_config::{ConnectionConfig, DuckdbSettings};
use duckdb::Connection;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

pub use error::{sanitize_message, EngineError};
pub use value::duck_to_json;

/// One result row: column name → typed JSON value.
pub type Row = Map<String, Value>;

/// Result of a write statement.
#[derive(Debug, Default)]
pub struct WriteResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
    /// Rows produced by a `RETURNING` clause, when the statement had one.
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
enum ConnectionState {
    Available,
    Unavailable(String),
}

pub struct Engine {
    writer: Arc<Mutex<Connection>>,
    readers: Vec<Arc<Mutex<Connection>>>,
    read_slots: Arc<Semaphore>,
    next_reader: AtomicUsize,
    connections: DashMap<String, ConnectionState>,
}

impl Engine {
    /// Open the engine, apply settings, install extensions, and register
    /// every named connection by running its init statements in order.
    ///
    /// A connection whose init fails is marked unavailable rather than
    /// failing startup; endpoints naming it get database errors on use.
    pub fn init(
        settings: &DuckdbSettings,
        connections: &BTreeMap<String, ConnectionConfig>,
    ) -> Result<Self, EngineError> {
        let conn = open_database(settings)?;
        apply_settings(&conn, settings)?;
        install_extensions(&conn, &settings.extensions);

        let states = DashMap::new();
        for (name, config) in connections {
            let state = match &config.init {
                Some(init) if !init.trim().is_empty() => match conn.execute_batch(init) {
                    Ok(()) => {
                        tracing::info!(connection = %name, "connection initialized");
                        ConnectionState::Available
                    }
                    Err(err) => {
                        let message = sanitize_message(&err.to_string());
                        tracing::error!(connection = %name, error = %message, "connection init failed");
                        ConnectionState::Unavailable(message)
                    }
                },
                _ => ConnectionState::Available,
            };
            states.insert(name.clone(), state);
        }

        let pool_size = settings.max_concurrent_reads.max(1);
        let mut readers = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let reader = conn
                .try_clone()
                .map_err(|e| EngineError::Init(format!("cannot clone read connection: {e}")))?;
            readers.push(Arc::new(Mutex::new(reader)));
        }

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers,
            read_slots: Arc::new(Semaphore::new(pool_size)),
            next_reader: AtomicUsize::new(0),
            connections: states,
        })
    }

    /// Check the named connection exists and survived init.
    pub fn check_connection(&self, name: &str) -> Result<(), EngineError> {
        match self.connections.get(name).map(|s| s.value().clone()) {
            Some(ConnectionState::Available) => Ok(()),
            Some(ConnectionState::Unavailable(_)) => {
                Err(EngineError::Unavailable(name.to_string()))
            }
            None => Err(EngineError::UnknownConnection(name.to_string())),
        }
    }

    /// Connection names and their availability, for diagnostics.
    pub fn connection_status(&self) -> BTreeMap<String, Option<String>> {
        self.connections
            .iter()
            .map(|entry| {
                let error = match entry.value() {
                    ConnectionState::Available => None,
                    ConnectionState::Unavailable(message) => Some(message.clone()),
                };
                (entry.key().clone(), error)
            })
            .collect()
    }

    /// Run a read query on the reader pool, collecting at most `limit`
    /// rows. The fetch stops early once the limit is reached, so callers
    /// probe for more rows by asking for one extra.
    pub async fn query_rows(
        &self,
        connection: &str,
        sql: String,
        limit: usize,
    ) -> Result<Vec<Row>, EngineError> {
        self.check_connection(connection)?;
        let _permit = self
            .read_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?;
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("reader lock poisoned");
            collect_rows(&conn, &sql, limit)
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
    }

    /// Run a system query (catalog introspection) on the reader pool.
    /// Unlike [`Self::query_rows`] this is not tied to a named connection.
    pub async fn query_rows_system(
        &self,
        sql: String,
        limit: usize,
    ) -> Result<Vec<Row>, EngineError> {
        let _permit = self
            .read_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?;
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("reader lock poisoned");
            collect_rows(&conn, &sql, limit)
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
    }

    /// Run a scalar query (counts) on the reader pool.
    pub async fn query_scalar_i64(&self, sql: String) -> Result<i64, EngineError> {
        let _permit = self
            .read_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?;
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("reader lock poisoned");
            conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                .map_err(|e| EngineError::Query(sanitize_message(&e.to_string())))
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
    }

    /// Run a write statement through the serialized writer lane.
    ///
    /// Statements with a `RETURNING` clause yield their rows; plain DML
    /// reports the affected-row count. `transactional` wraps the statement
    /// (and the optional `follow_up` select) in one transaction.
    pub async fn execute_write(
        &self,
        connection: &str,
        sql: String,
        follow_up: Option<String>,
        transactional: bool,
    ) -> Result<WriteResult, EngineError> {
        self.check_connection(connection)?;
        self.with_writer(move |conn| {
            let run = |conn: &Connection| -> Result<WriteResult, EngineError> {
                let mut result = run_statement(conn, &sql)?;
                if let Some(follow_up) = &follow_up {
                    result.rows = collect_rows(conn, follow_up, usize::MAX)?;
                }
                // DuckDB has no rowid counter; an assigned key reaches the
                // caller through RETURNING rows instead.
                Ok(result)
            };

            if transactional {
                conn.execute_batch("BEGIN TRANSACTION")
                    .map_err(|e| EngineError::Query(sanitize_message(&e.to_string())))?;
                match run(conn) {
                    Ok(result) => {
                        conn.execute_batch("COMMIT")
                            .map_err(|e| EngineError::Query(sanitize_message(&e.to_string())))?;
                        Ok(result)
                    }
                    Err(err) => {
                        let _ = conn.execute_batch("ROLLBACK");
                        Err(err)
                    }
                }
            } else {
                run(conn)
            }
        })
        .await
    }

    /// Run arbitrary work on the writer connection (the DDL lane). Cache
    /// refreshes and schema statements go through here so they serialize
    /// with each other and with connection init.
    pub async fn with_writer<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut Connection) -> Result<R, EngineError> + Send + 'static,
        R: Send + 'static,
    {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = writer.lock().expect("writer lock poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
    }

    /// Execute a batch of statements on the DDL lane.
    pub async fn execute_ddl(&self, sql: String) -> Result<(), EngineError> {
        self.with_writer(move |conn| {
            conn.execute_batch(&sql)
                .map_err(|e| EngineError::Query(sanitize_message(&e.to_string())))
        })
        .await
    }
}

fn open_database(settings: &DuckdbSettings) -> Result<Connection, EngineError> {
    let path = settings.db_path.as_deref().unwrap_or(":memory:");
    let conn = if path == ":memory:" {
        Connection::open_in_memory()
    } else {
        Connection::open(path)
    };
    conn.map_err(|e| EngineError::Init(format!("cannot open database {path:?}: {e}")))
}

fn apply_settings(conn: &Connection, settings: &DuckdbSettings) -> Result<(), EngineError> {
    let mut statements = Vec::new();
    if let Some(threads) = settings.threads {
        statements.push(format!("SET threads = {threads}"));
    }
    if let Some(max_memory) = &settings.max_memory {
        statements.push(format!("SET max_memory = '{max_memory}'"));
    }
    if let Some(access_mode) = &settings.access_mode {
        // Access mode is a config-time flag in DuckDB; reject values the
        // engine will not accept rather than failing at open.
        match access_mode.to_ascii_lowercase().as_str() {
            "read_only" | "read_write" | "automatic" => {}
            other => {
                return Err(EngineError::Init(format!("invalid access_mode {other:?}")));
            }
        }
    }
    for (key, value) in &settings.settings {
        if let Some(literal) = yaml_sql_literal(value) {
            statements.push(format!("SET {key} = {literal}"));
        }
    }
    for statement in statements {
        conn.execute_batch(&statement)
            .map_err(|e| EngineError::Init(format!("{statement}: {e}")))?;
    }
    Ok(())
}

fn yaml_sql_literal(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        _ => None,
    }
}

fn install_extensions(conn: &Connection, extensions: &[String]) {
    for name in extensions {
        let sql = format!("INSTALL {name}; LOAD {name};");
        if let Err(err) = conn.execute_batch(&sql) {
            tracing::warn!(extension = %name, error = %err, "extension load failed");
        }
    }
}

/// Whether a statement yields rows through a RETURNING clause.
fn has_returning(sql: &str) -> bool {
    sql.to_ascii_uppercase().contains("RETURNING")
}

fn run_statement(conn: &Connection, sql: &str) -> Result<WriteResult, EngineError> {
    if has_returning(sql) {
        let rows = collect_rows(conn, sql, usize::MAX)?;
        Ok(WriteResult {
            rows_affected: rows.len() as u64,
            last_insert_id: None,
            rows,
        })
    } else {
        let affected = conn
            .execute(sql, [])
            .map_err(|e| EngineError::Query(sanitize_message(&e.to_string())))?;
        Ok(WriteResult {
            rows_affected: affected as u64,
            last_insert_id: None,
            rows: Vec::new(),
        })
    }
}

/// Collect up to `limit` rows of a query as name→JSON maps.
fn collect_rows(conn: &Connection, sql: &str, limit: usize) -> Result<Vec<Row>, EngineError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| EngineError::Query(sanitize_message(&e.to_string())))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| EngineError::Query(sanitize_message(&e.to_string())))?;

    let mut names: Option<Vec<String>> = None;
    let mut out = Vec::new();
    loop {
        if out.len() >= limit {
            break;
        }
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => return Err(EngineError::Query(sanitize_message(&e.to_string()))),
        };
        let names = names.get_or_insert_with(|| {
            row.as_ref()
                .column_names()
                .into_iter()
                .map(|n| n.to_string())
                .collect()
        });
        let mut map = Map::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let value: duckdb::types::Value = row
                .get(idx)
                .map_err(|e| EngineError::Query(sanitize_message(&e.to_string())))?;
            map.insert(name.clone(), duck_to_json(value));
        }
        out.push(map);
    }
    Ok(out)
}

/// Quote an identifier for interpolation into DDL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
