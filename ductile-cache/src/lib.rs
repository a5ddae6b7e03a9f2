//! Materialized cache tables.
//!
//! Each cache-enabled endpoint owns one table in the engine (optionally in
//! an attached DuckLake catalog). The manager is the only writer: it
//! expands the endpoint's source template, runs the mode-specific refresh
//! through the engine's DDL lane, and commits a snapshot record. Reads
//! always see the last committed snapshot; a failed refresh leaves it in
//! place.

mod scheduler;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ductile_core::{ApiError, CacheBindings, RequestContext};
use ductile_config::{CacheConfig, CacheMode, EndpointConfig, ProjectConfig};
use ductile_engine::{quote_ident, quote_literal, sanitize_message, Engine, EngineError};
use ductile_template::{Expander, TemplateDir};

pub use scheduler::Heartbeat;

/// One committed cache snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub cursor_high_water: Option<String>,
    pub row_count: i64,
}

/// Per-endpoint refresh state. Guarded by a per-endpoint mutex; the
/// request path only clones the committed snapshot out of it.
#[derive(Debug, Default, Clone)]
pub struct CacheState {
    pub last_snapshot: Option<Snapshot>,
    pub previous_snapshot: Option<Snapshot>,
    pub last_error: Option<String>,
    pub last_refresh_ms: Option<u128>,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed(Snapshot),
    /// A refresh was already in flight; the request was absorbed by it.
    Coalesced,
}

/// The stable identity of an endpoint for cache bookkeeping.
pub fn endpoint_key(endpoint: &EndpointConfig) -> String {
    endpoint
        .url_path
        .clone()
        .or_else(|| endpoint.mcp_tool.as_ref().map(|v| format!("tool:{}", v.name)))
        .or_else(|| {
            endpoint
                .mcp_resource
                .as_ref()
                .map(|v| format!("resource:{}", v.name))
        })
        .or_else(|| {
            endpoint
                .mcp_prompt
                .as_ref()
                .map(|v| format!("prompt:{}", v.name))
        })
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Per-endpoint cache slot: the committed state, readable at any time,
/// and the refresh lock that serializes writers. Readers during a refresh
/// keep seeing the last committed snapshot.
#[derive(Default)]
struct CacheSlot {
    committed: std::sync::RwLock<CacheState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

pub struct CacheManager {
    engine: Arc<Engine>,
    templates: Arc<TemplateDir>,
    project: Arc<ProjectConfig>,
    env: BTreeMap<String, String>,
    states: DashMap<String, Arc<CacheSlot>>,
    snapshot_counter: AtomicI64,
}

impl CacheManager {
    pub fn new(
        engine: Arc<Engine>,
        templates: Arc<TemplateDir>,
        project: Arc<ProjectConfig>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            engine,
            templates,
            project,
            env,
            states: DashMap::new(),
            snapshot_counter: AtomicI64::new(0),
        }
    }

    /// Attach the DuckLake catalog when enabled. Best-effort: a missing
    /// extension degrades to plain tables in the main catalog.
    pub async fn attach_catalog(&self) -> Result<(), ApiError> {
        let lake = &self.project.ducklake;
        if !lake.enabled {
            return Ok(());
        }
        let alias = quote_ident(&lake.alias);
        let metadata = lake
            .metadata_path
            .clone()
            .unwrap_or_else(|| format!("{}.ducklake", lake.alias));
        let mut sql = format!(
            "INSTALL ducklake; LOAD ducklake; ATTACH IF NOT EXISTS {} AS {alias}",
            quote_literal(&format!("ducklake:{metadata}"))
        );
        if let Some(data_path) = &lake.data_path {
            sql.push_str(&format!(" (DATA_PATH {})", quote_literal(data_path)));
        }
        match self.engine.execute_ddl(sql).await {
            Ok(()) => {
                tracing::info!(alias = %lake.alias, "versioned catalog attached");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "catalog attach failed, caches fall back to main catalog");
                Ok(())
            }
        }
    }

    /// The committed state for one endpoint, if any refresh ever ran.
    /// Always answers, even while a refresh is in flight.
    pub fn state(&self, key: &str) -> Option<CacheState> {
        let slot = self.states.get(key)?.clone();
        let committed = slot.committed.read().expect("cache state lock poisoned");
        Some(committed.clone())
    }

    /// Whether the endpoint's cache is stale against its schedule.
    pub fn is_stale(&self, key: &str, cache: &CacheConfig) -> bool {
        let Some(schedule) = cache.schedule.filter(|s| !s.is_zero()) else {
            return false;
        };
        match self.state(key).and_then(|s| s.last_snapshot) {
            Some(snapshot) => {
                let age = Utc::now().signed_duration_since(snapshot.timestamp);
                age.to_std().map(|age| age >= schedule).unwrap_or(true)
            }
            None => true,
        }
    }

    /// Bindings for the read path: table location and the committed
    /// snapshot, no refresh fields.
    pub fn read_bindings(&self, key: &str, cache: &CacheConfig) -> CacheBindings {
        let (catalog, schema) = self.location(cache);
        let snapshot = self.state(key).and_then(|s| s.last_snapshot);
        CacheBindings {
            catalog,
            schema,
            table: cache.table.clone(),
            mode: cache.mode().as_str().to_string(),
            snapshot_id: snapshot.as_ref().map(|s| s.id),
            snapshot_timestamp: snapshot.as_ref().map(|s| s.timestamp.to_rfc3339()),
            cursor_column: cache.cursor.as_ref().map(|c| c.column.clone()),
            cursor_type: cache.cursor.as_ref().map(|c| c.kind.clone()),
            cursor_value: snapshot.and_then(|s| s.cursor_high_water),
            primary_keys: cache.primary_key.clone(),
            ..Default::default()
        }
    }

    fn location(&self, cache: &CacheConfig) -> (String, String) {
        let lake = &self.project.ducklake;
        let catalog = cache
            .catalog
            .clone()
            .unwrap_or_else(|| {
                if lake.enabled {
                    lake.alias.clone()
                } else {
                    String::new()
                }
            });
        let schema = cache.schema.clone().unwrap_or_else(|| "main".to_string());
        (catalog, schema)
    }

    fn qualified_table(&self, cache: &CacheConfig) -> String {
        let (catalog, schema) = self.location(cache);
        let mut parts = Vec::new();
        if !catalog.is_empty() {
            parts.push(quote_ident(&catalog));
        }
        parts.push(quote_ident(&schema));
        parts.push(quote_ident(&cache.table));
        parts.join(".")
    }

    /// Refresh one endpoint's cache table.
    ///
    /// At most one refresh runs per endpoint; a second caller gets
    /// [`RefreshOutcome::Coalesced`] without queueing. Failures keep the
    /// previous snapshot committed and are recorded on the state.
    pub async fn refresh(
        &self,
        endpoint: &EndpointConfig,
        reason: &str,
    ) -> Result<RefreshOutcome, ApiError> {
        let cache = endpoint
            .cache
            .as_ref()
            .filter(|c| c.enabled)
            .ok_or_else(|| ApiError::NotFound("endpoint has no cache".into()))?;
        let key = endpoint_key(endpoint);

        let slot = self
            .states
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheSlot::default()))
            .clone();
        let Ok(_refresh_guard) = slot.refresh_lock.try_lock() else {
            tracing::debug!(endpoint = %key, reason, "refresh already in progress, coalesced");
            return Ok(RefreshOutcome::Coalesced);
        };

        let started = Instant::now();
        let snapshot_id = self.snapshot_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = Utc::now();
        tracing::info!(endpoint = %key, snapshot_id, reason, "cache refresh starting");

        let before = slot
            .committed
            .read()
            .expect("cache state lock poisoned")
            .clone();
        let result = self
            .run_refresh(endpoint, cache, &before, snapshot_id, timestamp)
            .await;
        let elapsed_ms = started.elapsed().as_millis();

        let result = {
            let mut state = slot.committed.write().expect("cache state lock poisoned");
            state.last_refresh_ms = Some(elapsed_ms);
            match result {
                Ok(snapshot) => {
                    tracing::info!(
                        endpoint = %key,
                        snapshot_id = snapshot.id,
                        rows = snapshot.row_count,
                        elapsed_ms = elapsed_ms as u64,
                        "cache refresh committed"
                    );
                    state.previous_snapshot = state.last_snapshot.take();
                    state.last_snapshot = Some(snapshot.clone());
                    state.last_error = None;
                    Ok(snapshot)
                }
                Err(err) => {
                    let message = err.to_string();
                    tracing::error!(endpoint = %key, error = %message, "cache refresh failed");
                    state.last_error = Some(message);
                    Err(err)
                }
            }
        };
        match result {
            Ok(snapshot) => {
                self.apply_retention(cache).await;
                Ok(RefreshOutcome::Refreshed(snapshot))
            }
            Err(err) => Err(err),
        }
    }

    async fn run_refresh(
        &self,
        endpoint: &EndpointConfig,
        cache: &CacheConfig,
        state: &CacheState,
        snapshot_id: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<Snapshot, ApiError> {
        let template_file = cache
            .template_file
            .as_deref()
            .ok_or_else(|| ApiError::Configuration("cache has no template-file".into()))?;

        let context = self.refresh_context(endpoint, cache, state, snapshot_id, timestamp);
        let source = self.templates.read(template_file)?;
        let select = Expander::with_partials(self.templates.as_ref())
            .expand(&source, &context.bindings())?;
        let select = select.trim().trim_end_matches(';').to_string();

        let table = self.qualified_table(cache);
        let mode = cache.mode();
        let cursor = cache.cursor.clone();
        let high_water = state
            .last_snapshot
            .as_ref()
            .and_then(|s| s.cursor_high_water.clone());
        let primary_keys = cache.primary_key.clone();

        let (row_count, new_high_water) = self
            .engine
            .with_writer(move |conn| {
                execute_refresh(
                    conn,
                    &table,
                    &select,
                    mode,
                    &primary_keys,
                    cursor.as_ref().map(|c| c.column.as_str()),
                    cursor.as_ref().map(|c| c.kind.as_str()),
                    high_water.as_deref(),
                )
            })
            .await?;

        Ok(Snapshot {
            id: snapshot_id,
            timestamp,
            cursor_high_water: new_high_water,
            row_count,
        })
    }

    fn refresh_context(
        &self,
        endpoint: &EndpointConfig,
        cache: &CacheConfig,
        state: &CacheState,
        snapshot_id: i64,
        timestamp: DateTime<Utc>,
    ) -> RequestContext {
        let (catalog, schema) = self.location(cache);
        let previous = state.last_snapshot.as_ref();
        let conn = endpoint
            .primary_connection()
            .and_then(|name| self.project.connections.get(name))
            .map(|c| c.properties.clone())
            .unwrap_or_default();
        RequestContext {
            params: Default::default(),
            conn,
            user: None,
            env: self.env.clone(),
            cache: Some(CacheBindings {
                catalog,
                schema,
                table: cache.table.clone(),
                mode: cache.mode().as_str().to_string(),
                snapshot_id: Some(snapshot_id),
                snapshot_timestamp: Some(timestamp.to_rfc3339()),
                previous_snapshot_id: previous.map(|s| s.id),
                previous_snapshot_timestamp: previous.map(|s| s.timestamp.to_rfc3339()),
                cursor_column: cache.cursor.as_ref().map(|c| c.column.clone()),
                cursor_type: cache.cursor.as_ref().map(|c| c.kind.clone()),
                cursor_value: previous.and_then(|s| s.cursor_high_water.clone()),
                primary_keys: cache.primary_key.clone(),
            }),
        }
    }

    /// Retention against the versioned catalog, best effort.
    async fn apply_retention(&self, cache: &CacheConfig) {
        let lake = &self.project.ducklake;
        if !lake.enabled {
            return;
        }
        let max_age = cache
            .retention
            .max_snapshot_age
            .or(lake.retention.max_snapshot_age);
        if let Some(max_age) = max_age {
            let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
            let sql = format!(
                "CALL ducklake_expire_snapshots({}, older_than => TIMESTAMP {})",
                quote_literal(&lake.alias),
                quote_literal(&cutoff.format("%Y-%m-%d %H:%M:%S").to_string()),
            );
            if let Err(err) = self.engine.execute_ddl(sql).await {
                tracing::debug!(error = %err, "snapshot expiry skipped");
            }
        }
    }

    /// Status projection for the configuration API.
    pub fn status(&self, endpoints: &[(String, CacheConfig)]) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (key, cache) in endpoints {
            let state = self.state(key).unwrap_or_default();
            let snapshot = state.last_snapshot.as_ref();
            out.insert(
                key.clone(),
                serde_json::json!({
                    "table": self.qualified_table(cache),
                    "mode": cache.mode().as_str(),
                    "schedule_seconds": cache.schedule.map(|s| s.as_secs()),
                    "snapshot_id": snapshot.map(|s| s.id),
                    "snapshot_timestamp": snapshot.map(|s| s.timestamp.to_rfc3339()),
                    "row_count": snapshot.map(|s| s.row_count),
                    "cursor_high_water": snapshot.and_then(|s| s.cursor_high_water.clone()),
                    "last_error": state.last_error,
                    "last_refresh_ms": state.last_refresh_ms.map(|ms| ms as u64),
                    "stale": self.is_stale(key, cache),
                }),
            );
        }
        serde_json::Value::Object(out)
    }
}

/// Literal form of a cursor value for SQL comparison: numeric SQL types
/// stay bare, everything else is quoted.
fn cursor_sql_literal(kind: Option<&str>, value: &str) -> String {
    let numeric = matches!(
        kind.map(|k| k.to_ascii_uppercase()).as_deref(),
        Some(
            "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT"
                | "USMALLINT" | "UINTEGER" | "UBIGINT" | "FLOAT" | "DOUBLE" | "DECIMAL"
        )
    );
    if numeric {
        value.to_string()
    } else {
        quote_literal(value)
    }
}

#[allow(clippy::too_many_arguments)]
fn execute_refresh(
    conn: &mut duckdb::Connection,
    table: &str,
    select: &str,
    mode: CacheMode,
    primary_keys: &[String],
    cursor_column: Option<&str>,
    cursor_type: Option<&str>,
    high_water: Option<&str>,
) -> Result<(i64, Option<String>), EngineError> {
    let query = |e: duckdb::Error| EngineError::Query(sanitize_message(&e.to_string()));

    // Cursor filter applied by the manager: incremental modes only pull
    // rows past the committed high-water mark.
    let filtered = match (cursor_column, high_water) {
        (Some(column), Some(high)) if matches!(mode, CacheMode::Append | CacheMode::IncrementalMerge) => {
            format!(
                "SELECT * FROM ({select}) WHERE {} > {}",
                quote_ident(column),
                cursor_sql_literal(cursor_type, high)
            )
        }
        _ => format!("SELECT * FROM ({select})"),
    };

    match mode {
        CacheMode::FullRefresh => {
            conn.execute_batch(&format!("CREATE OR REPLACE TABLE {table} AS {filtered}"))
                .map_err(query)?;
        }
        CacheMode::Append => {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} AS SELECT * FROM ({filtered}) LIMIT 0"
            ))
            .map_err(query)?;
            conn.execute_batch(&format!("INSERT INTO {table} {filtered}"))
                .map_err(query)?;
        }
        CacheMode::Merge | CacheMode::IncrementalMerge => {
            let stage = "__ductile_stage";
            let key_list = primary_keys
                .iter()
                .map(|k| quote_ident(k))
                .collect::<Vec<_>>()
                .join(", ");
            let tx = conn.transaction().map_err(query)?;
            tx.execute_batch(&format!(
                "CREATE OR REPLACE TEMP TABLE {stage} AS {filtered}"
            ))
            .map_err(query)?;
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} AS SELECT * FROM {stage} LIMIT 0"
            ))
            .map_err(query)?;
            tx.execute_batch(&format!(
                "DELETE FROM {table} WHERE ({key_list}) IN (SELECT {key_list} FROM {stage})"
            ))
            .map_err(query)?;
            tx.execute_batch(&format!("INSERT INTO {table} SELECT * FROM {stage}"))
                .map_err(query)?;
            tx.execute_batch(&format!("DROP TABLE {stage}")).map_err(query)?;
            tx.commit().map_err(query)?;
        }
    }

    let row_count = conn
        .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(query)?;

    let new_high_water = match cursor_column {
        Some(column) => conn
            .query_row(
                &format!(
                    "SELECT CAST(max({}) AS VARCHAR) FROM {table}",
                    quote_ident(column)
                ),
                [],
                |row| row.get::<_, Option<String>>(0),
            )
            .map_err(query)?,
        None => None,
    };

    Ok((row_count, new_high_water))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductile_config::{ConnectionConfig, CursorConfig, DuckdbSettings, RetentionConfig};
    use std::time::Duration;

    fn setup(template: &str, cache: CacheConfig) -> (CacheManager, EndpointConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("source.sql"), template).unwrap();

        let mut connections = BTreeMap::new();
        connections.insert(
            "main".to_string(),
            ConnectionConfig {
                init: Some(
                    "CREATE TABLE source_rows (id INTEGER, name VARCHAR, seq INTEGER); \
                     INSERT INTO source_rows VALUES (1, 'a', 1), (2, 'b', 2)"
                        .to_string(),
                ),
                ..Default::default()
            },
        );
        let engine = Arc::new(
            Engine::init(
                &DuckdbSettings {
                    max_concurrent_reads: 2,
                    ..Default::default()
                },
                &connections,
            )
            .unwrap(),
        );

        let project = Arc::new(ProjectConfig {
            connections,
            ..Default::default()
        });
        let templates = Arc::new(TemplateDir::new(dir.path()));

        let manager = CacheManager::new(engine, templates, project, BTreeMap::new());
        let endpoint = EndpointConfig {
            url_path: Some("/cached/".into()),
            connection: vec!["main".into()],
            template: Some("SELECT * FROM {{{ cache.fullTable }}}".into()),
            cache: Some(cache),
            ..Default::default()
        };
        (manager, endpoint, dir)
    }

    fn cache_config() -> CacheConfig {
        CacheConfig {
            enabled: true,
            catalog: None,
            schema: None,
            table: "cached_rows".into(),
            schedule: Some(Duration::from_secs(3600)),
            refresh_endpoint: true,
            template_file: Some("source.sql".into()),
            primary_key: vec![],
            cursor: None,
            retention: RetentionConfig::default(),
        }
    }

    #[tokio::test]
    async fn full_refresh_creates_snapshot() {
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache_config());
        let outcome = manager.refresh(&endpoint, "test").await.unwrap();
        let RefreshOutcome::Refreshed(snapshot) = outcome else {
            panic!("expected a refresh");
        };
        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.row_count, 2);

        let count = manager
            .engine
            .query_scalar_i64("SELECT count(*) FROM \"main\".\"cached_rows\"".into())
            .await
            .unwrap();
        assert_eq!(count, 2);

        // Second refresh replaces and bumps the snapshot id.
        let RefreshOutcome::Refreshed(snapshot) =
            manager.refresh(&endpoint, "test").await.unwrap()
        else {
            panic!("expected a refresh");
        };
        assert_eq!(snapshot.id, 2);
    }

    #[tokio::test]
    async fn merge_upserts_by_primary_key() {
        let mut cache = cache_config();
        cache.primary_key = vec!["id".into()];
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache);

        manager.refresh(&endpoint, "initial").await.unwrap();
        // Change one row and add one in the source.
        manager
            .engine
            .execute_ddl(
                "UPDATE source_rows SET name = 'a2' WHERE id = 1; \
                 INSERT INTO source_rows VALUES (3, 'c', 3)"
                    .into(),
            )
            .await
            .unwrap();
        let RefreshOutcome::Refreshed(snapshot) =
            manager.refresh(&endpoint, "second").await.unwrap()
        else {
            panic!("expected a refresh");
        };
        assert_eq!(snapshot.row_count, 3);

        let rows = manager
            .engine
            .query_rows(
                "main",
                "SELECT name FROM \"main\".\"cached_rows\" WHERE id = 1".into(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], serde_json::json!("a2"));
    }

    #[tokio::test]
    async fn append_filters_by_cursor_high_water() {
        let mut cache = cache_config();
        cache.cursor = Some(CursorConfig {
            column: "seq".into(),
            kind: "BIGINT".into(),
        });
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache);

        let RefreshOutcome::Refreshed(first) =
            manager.refresh(&endpoint, "initial").await.unwrap()
        else {
            panic!("expected a refresh");
        };
        assert_eq!(first.row_count, 2);
        assert_eq!(first.cursor_high_water.as_deref(), Some("2"));

        manager
            .engine
            .execute_ddl("INSERT INTO source_rows VALUES (3, 'c', 3)".into())
            .await
            .unwrap();
        let RefreshOutcome::Refreshed(second) =
            manager.refresh(&endpoint, "second").await.unwrap()
        else {
            panic!("expected a refresh");
        };
        // Only the new row crossed the high-water mark; earlier rows are
        // not re-appended.
        assert_eq!(second.row_count, 3);
        assert_eq!(second.cursor_high_water.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn incremental_merge_upserts_only_past_cursor() {
        let mut cache = cache_config();
        cache.primary_key = vec!["id".into()];
        cache.cursor = Some(CursorConfig {
            column: "seq".into(),
            kind: "BIGINT".into(),
        });
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache);

        let RefreshOutcome::Refreshed(first) =
            manager.refresh(&endpoint, "initial").await.unwrap()
        else {
            panic!("expected a refresh");
        };
        assert_eq!(first.row_count, 2);
        assert_eq!(first.cursor_high_water.as_deref(), Some("2"));

        // Row 1 is updated past the cursor; row 3 is brand new. Rows at or
        // below the high-water mark are not re-read.
        manager
            .engine
            .execute_ddl(
                "UPDATE source_rows SET name = 'a2', seq = 3 WHERE id = 1; \
                 INSERT INTO source_rows VALUES (3, 'c', 4)"
                    .into(),
            )
            .await
            .unwrap();
        let RefreshOutcome::Refreshed(second) =
            manager.refresh(&endpoint, "second").await.unwrap()
        else {
            panic!("expected a refresh");
        };
        assert_eq!(second.row_count, 3);
        assert_eq!(second.cursor_high_water.as_deref(), Some("4"));

        let rows = manager
            .engine
            .query_rows(
                "main",
                "SELECT name FROM \"main\".\"cached_rows\" WHERE id = 1".into(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], serde_json::json!("a2"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache_config());
        manager.refresh(&endpoint, "good").await.unwrap();

        // Break the source table so the next refresh fails.
        manager
            .engine
            .execute_ddl("DROP TABLE source_rows".into())
            .await
            .unwrap();
        let err = manager.refresh(&endpoint, "bad").await.unwrap_err();
        assert!(matches!(err, ApiError::Database { .. }));

        let state = manager.state("/cached/").unwrap();
        assert!(state.last_error.is_some());
        let snapshot = state.last_snapshot.unwrap();
        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.row_count, 2);
    }

    #[tokio::test]
    async fn concurrent_refresh_is_coalesced() {
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache_config());
        let key = endpoint_key(&endpoint);
        let slot = manager
            .states
            .entry(key)
            .or_insert_with(|| Arc::new(CacheSlot::default()))
            .clone();
        let guard = slot.refresh_lock.lock().await;
        let outcome = manager.refresh(&endpoint, "while-locked").await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Coalesced));
        drop(guard);

        let outcome = manager.refresh(&endpoint, "after-unlock").await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Refreshed(_)));
    }

    #[tokio::test]
    async fn committed_state_readable_during_refresh() {
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache_config());
        manager.refresh(&endpoint, "warm").await.unwrap();

        let key = endpoint_key(&endpoint);
        let slot = manager.states.get(&key).unwrap().clone();
        let guard = slot.refresh_lock.lock().await;
        // A refresh is "in flight"; readers still see snapshot 1.
        let state = manager.state(&key).unwrap();
        assert_eq!(state.last_snapshot.unwrap().id, 1);
        drop(guard);
    }

    #[tokio::test]
    async fn staleness_tracks_schedule() {
        let mut cache = cache_config();
        cache.schedule = Some(Duration::from_secs(3600));
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache.clone());
        let key = endpoint_key(&endpoint);

        assert!(manager.is_stale(&key, &cache), "no snapshot yet");
        manager.refresh(&endpoint, "warm").await.unwrap();
        assert!(!manager.is_stale(&key, &cache));

        cache.schedule = None;
        assert!(!manager.is_stale(&key, &cache), "unscheduled is never stale");
    }

    #[tokio::test]
    async fn read_bindings_expose_snapshot() {
        let (manager, endpoint, _dir) = setup("SELECT * FROM source_rows", cache_config());
        let cache = endpoint.cache.clone().unwrap();
        manager.refresh(&endpoint, "warm").await.unwrap();

        let bindings = manager.read_bindings("/cached/", &cache);
        assert_eq!(bindings.table, "cached_rows");
        assert_eq!(bindings.schema, "main");
        assert_eq!(bindings.mode, "full");
        assert_eq!(bindings.snapshot_id, Some(1));
        assert_eq!(bindings.qualified_table(), "main.cached_rows");
    }

    #[test]
    fn cursor_literals_quote_by_type() {
        assert_eq!(cursor_sql_literal(Some("BIGINT"), "42"), "42");
        assert_eq!(
            cursor_sql_literal(Some("TIMESTAMP"), "2024-01-01 00:00:00"),
            "'2024-01-01 00:00:00'"
        );
        assert_eq!(cursor_sql_literal(None, "x"), "'x'");
    }
}
