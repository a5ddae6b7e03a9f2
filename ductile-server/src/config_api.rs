//! Configuration API under `/api/v1/_config`: project and registry
//! inspection, the endpoint live-edit surface, runtime log level, schema
//! introspection, and cache status/refresh.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use ductile_cache::{endpoint_key, RefreshOutcome};
use ductile_config::{validate_request, EndpointEntry, SuppliedParams};
use ductile_core::{path_to_slug, slug_to_path, ApiError};
use ductile_engine::quote_literal;

use crate::handler::expand_template;
use crate::{openapi, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/project", get(get_project))
        .route("/endpoints", get(list_endpoints))
        .route(
            "/endpoints/{slug}",
            get(get_endpoint).put(put_endpoint).delete(delete_endpoint),
        )
        .route("/endpoints/{slug}/validate", post(validate_endpoint))
        .route("/endpoints/{slug}/reload", post(reload_endpoint))
        .route("/endpoints/{slug}/parameters", get(endpoint_parameters))
        .route("/endpoints/{slug}/test", post(test_endpoint))
        .route("/log-level", get(get_log_level).put(put_log_level))
        .route("/schema", get(get_schema))
        .route("/cache/status", get(cache_status))
        .route("/cache/{slug}/refresh", post(refresh_cache))
}

/// Walk a JSON tree redacting secret-bearing values.
fn redact(value: &mut Value) {
    const SECRET_KEYS: [&str; 4] = ["password", "secret", "token", "private-key"];
    if let Value::Object(map) = value {
        for (key, entry) in map.iter_mut() {
            let lower = key.to_ascii_lowercase();
            if SECRET_KEYS.iter().any(|s| lower.contains(s)) && entry.is_string() {
                *entry = json!("<redacted>");
            } else {
                redact(entry);
            }
        }
    } else if let Value::Array(items) = value {
        for item in items {
            redact(item);
        }
    }
}

async fn get_project(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut project = serde_json::to_value(state.project.as_ref())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    redact(&mut project);
    Ok(Json(project))
}

async fn list_endpoints(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let registry = state.registry.snapshot();
    let mut out = serde_json::Map::new();
    for entry in registry.entries() {
        let key = endpoint_key(&entry.endpoint);
        let mut doc = serde_json::to_value(entry.endpoint.as_ref())
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        redact(&mut doc);
        doc["slug"] = json!(entry
            .endpoint
            .url_path
            .as_deref()
            .map(path_to_slug)
            .unwrap_or_else(|| key.clone()));
        doc["source-file"] = json!(entry.source_file);
        out.insert(key, doc);
    }
    Ok(Json(Value::Object(out)))
}

fn find_entry(state: &AppState, slug: &str) -> Result<EndpointEntry, ApiError> {
    let path = slug_to_path(slug);
    state
        .registry
        .snapshot()
        .by_path(&path)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("no endpoint at {path}")))
}

async fn get_endpoint(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = find_entry(&state, &slug)?;
    let mut doc = serde_json::to_value(entry.endpoint.as_ref())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    redact(&mut doc);
    Ok(Json(doc))
}

async fn put_endpoint(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let path = slug_to_path(&slug);
    let doc =
        serde_yaml::to_value(&body).map_err(|e| ApiError::Configuration(e.to_string()))?;
    let mut endpoint = state.loader.validate_endpoint_value(doc)?;
    // The route is addressed by slug; the document's own url-path must
    // agree or be absent.
    match endpoint.url_path.as_deref() {
        None => endpoint.url_path = Some(path.clone()),
        Some(declared) if declared == path => {}
        Some(declared) => {
            return Err(ApiError::Configuration(format!(
                "document url-path {declared:?} does not match route {path:?}"
            )));
        }
    }
    state.registry.upsert(EndpointEntry::new(endpoint, None));
    state.auth.invalidate(&path);
    tracing::info!(%path, "endpoint replaced via configuration API");
    Ok(Json(json!({ "status": "updated", "url-path": path })))
}

async fn delete_endpoint(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = slug_to_path(&slug);
    if !state.registry.remove(&path) {
        return Err(ApiError::NotFound(format!("no endpoint at {path}")));
    }
    state.auth.invalidate(&path);
    Ok(Json(json!({ "status": "deleted", "url-path": path })))
}

async fn validate_endpoint(
    State(state): State<AppState>,
    Path(_slug): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let doc =
        serde_yaml::to_value(&body).map_err(|e| ApiError::Configuration(e.to_string()))?;
    match state.loader.validate_endpoint_value(doc) {
        Ok(_) => Ok(Json(json!({ "valid": true }))),
        Err(err) => Ok(Json(json!({ "valid": false, "error": err.to_string() }))),
    }
}

async fn reload_endpoint(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = find_entry(&state, &slug)?;
    let source = entry.source_file.clone().ok_or_else(|| {
        ApiError::Configuration("endpoint has no source file to reload from".into())
    })?;
    // On error the old registry entry stays in place.
    let reloaded = state.loader.reload_endpoint(&source)?;
    let path = slug_to_path(&slug);
    state.registry.upsert(reloaded);
    state.auth.invalidate(&path);
    tracing::info!(%path, file = %source, "endpoint reloaded");
    Ok(Json(json!({ "status": "reloaded", "url-path": path })))
}

async fn endpoint_parameters(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = find_entry(&state, &slug)?;
    let params = serde_json::to_value(&entry.endpoint.request)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(params))
}

#[derive(Debug, Deserialize)]
struct TestRequest {
    #[serde(default)]
    args: serde_json::Map<String, Value>,
}

/// Dry-run an endpoint: validate the supplied arguments and show the SQL
/// they expand to, without executing it.
async fn test_endpoint(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(body): Json<TestRequest>,
) -> Result<Json<Value>, ApiError> {
    let entry = find_entry(&state, &slug)?;
    let mut supplied = SuppliedParams::default();
    for (name, value) in &body.args {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        supplied.query.insert(name.clone(), text);
    }

    match validate_request(&entry.endpoint, &supplied) {
        Ok(params) => {
            let context = ductile_core::RequestContext {
                params,
                env: state.env.clone(),
                conn: entry
                    .endpoint
                    .primary_connection()
                    .and_then(|name| state.project.connections.get(name))
                    .map(|c| c.properties.clone())
                    .unwrap_or_default(),
                ..Default::default()
            };
            let sql = expand_template(&state, &entry.endpoint, &context)?;
            Ok(Json(json!({ "valid": true, "sql": sql })))
        }
        Err(errors) => Ok(Json(json!({
            "valid": false,
            "errors": errors
                .iter()
                .map(|e| json!({ "field": e.field, "message": e.message }))
                .collect::<Vec<_>>(),
        }))),
    }
}

async fn get_log_level(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.log.as_ref() {
        Some(handle) => Ok(Json(json!({ "level": handle.current() }))),
        None => Ok(Json(json!({ "level": null }))),
    }
}

#[derive(Debug, Deserialize)]
struct LogLevelRequest {
    level: String,
}

async fn put_log_level(
    State(state): State<AppState>,
    Json(body): Json<LogLevelRequest>,
) -> Result<Json<Value>, ApiError> {
    let handle = state
        .log
        .as_ref()
        .as_ref()
        .ok_or_else(|| ApiError::Configuration("log level handle not installed".into()))?;
    handle
        .set(&body.level)
        .map_err(ApiError::Configuration)?;
    Ok(Json(json!({ "level": handle.current() })))
}

#[derive(Debug, Deserialize)]
struct SchemaQuery {
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    table: Option<String>,
}

async fn get_schema(
    State(state): State<AppState>,
    Query(query): Query<SchemaQuery>,
) -> Result<Json<Value>, ApiError> {
    if let Some(connection) = &query.connection {
        state.engine.check_connection(connection)?;
    }
    let sql = match &query.table {
        Some(table) => format!(
            "SELECT column_name, data_type, is_nullable \
             FROM information_schema.columns WHERE table_name = {} \
             ORDER BY ordinal_position",
            quote_literal(table)
        ),
        None => "SELECT table_catalog, table_schema, table_name, table_type \
                 FROM information_schema.tables ORDER BY table_schema, table_name"
            .to_string(),
    };
    let rows = state.engine.query_rows_system(sql, 10_000).await?;
    Ok(Json(json!({
        "data": rows.into_iter().map(Value::Object).collect::<Vec<_>>()
    })))
}

async fn cache_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let registry = state.registry.snapshot();
    let endpoints: Vec<(String, ductile_config::CacheConfig)> = registry
        .cached_entries()
        .filter_map(|entry| {
            entry
                .endpoint
                .cache
                .clone()
                .map(|cache| (endpoint_key(&entry.endpoint), cache))
        })
        .collect();
    Ok(Json(state.cache.status(&endpoints)))
}

async fn refresh_cache(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = find_entry(&state, &slug)?;
    let cache = entry
        .endpoint
        .cache
        .as_ref()
        .filter(|c| c.enabled)
        .ok_or_else(|| ApiError::NotFound("endpoint has no cache".into()))?;
    if !cache.refresh_endpoint {
        return Err(ApiError::Authorization(
            "manual refresh is not enabled for this endpoint".into(),
        ));
    }
    match state.cache.refresh(&entry.endpoint, "manual").await? {
        RefreshOutcome::Refreshed(snapshot) => Ok(Json(json!({
            "status": "refreshed",
            "snapshot_id": snapshot.id,
            "row_count": snapshot.row_count,
        }))),
        RefreshOutcome::Coalesced => Ok(Json(json!({
            "status": "already_in_progress",
        }))),
    }
}

/// `GET /api/v1/openapi.json`.
pub async fn openapi_document(State(state): State<AppState>) -> Json<Value> {
    let registry = state.registry.snapshot();
    Json(openapi::build_spec(&state.project, &registry))
}
