//! The request pipeline: resolve endpoint → authenticate → rate limit →
//! validate → build context → expand template → execute → shape response.
//!
//! This module is the only place errors turn into HTTP responses, and the
//! only place panics are caught (mapped to an opaque 500 with a request
//! id).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::FutureExt;
use serde_json::{Map, Value};

use ductile_cache::endpoint_key;
use ductile_config::{validate_request, EndpointConfig, SuppliedParams};
use ductile_core::{
    ApiError, FieldError, Page, PageParams, Principal, RequestContext, WriteOutcome,
};
use ductile_security::{effective_max, principal_key, RateDecision};
use ductile_template::Expander;

use crate::AppState;

/// Request body size cap for declared body parameters.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Fallback handler serving the dynamic endpoint table.
pub async fn dynamic_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let fut = handle_request(state, req);
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => err.into_response(),
        Err(_) => {
            let request_id = uuid::Uuid::new_v4();
            tracing::error!(%request_id, "handler panicked");
            ApiError::Internal(format!("unexpected error, request id {request_id}"))
                .into_response()
        }
    }
}

async fn handle_request(state: AppState, req: Request<Body>) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();

    // The snapshot captured here serves the whole request; a concurrent
    // reload cannot change what this request sees.
    let registry = state.registry.snapshot();
    let Some((endpoint, path_params)) = registry.match_route(&method, &path) else {
        return Err(ApiError::NotFound(format!("no endpoint for {method} {path}")));
    };

    let query = parse_query(parts.uri.query());
    let headers = header_map(&parts.headers);
    let body = read_body_object(body).await?;
    let supplied = SuppliedParams {
        query,
        path: path_params,
        headers,
        body,
    };

    let authorization = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let client_addr = client_address(&parts.headers);

    let value = invoke(
        &state,
        &endpoint,
        supplied,
        authorization.as_deref(),
        &client_addr,
    )
    .await?;
    Ok(Json(value).into_response())
}

/// Run the pipeline for one endpoint. Shared by REST and the MCP views.
pub async fn invoke(
    state: &AppState,
    endpoint: &Arc<EndpointConfig>,
    supplied: SuppliedParams,
    authorization: Option<&str>,
    client_addr: &str,
) -> Result<Value, ApiError> {
    let key = endpoint_key(endpoint);

    // Auth: the endpoint block wins over the project default.
    let auth_config = endpoint
        .auth
        .as_ref()
        .or(state.project.auth.as_ref())
        .filter(|a| a.enabled);
    let principal = match auth_config {
        Some(config) => Some(
            state
                .auth
                .authenticate(&key, config, authorization)
                .await?,
        ),
        None => None,
    };

    // Rate limit before any engine work.
    let rate_config = endpoint
        .rate_limit
        .as_ref()
        .or(state.project.rate_limit.as_ref())
        .filter(|r| r.enabled);
    if let Some(config) = rate_config {
        let max = effective_max(config, principal.as_ref());
        let bucket = principal_key(&key, principal.as_ref(), client_addr);
        let interval = Duration::from_secs(config.interval_seconds.max(1));
        if let RateDecision::Limited { retry_after } =
            state.rate_limiter.check(&bucket, max, interval)
        {
            return Err(ApiError::RateLimit {
                message: "Too many requests".into(),
                retry_after,
            });
        }
    }

    // Validation: pagination and declared parameters, all failures at
    // once. No SQL runs past this point on error.
    let mut errors: Vec<FieldError> = Vec::new();
    let page = match PageParams::parse(
        supplied.query.get("limit").map(String::as_str),
        supplied.query.get("offset").map(String::as_str),
    ) {
        Ok(page) => page,
        Err(mut errs) => {
            errors.append(&mut errs);
            PageParams::default()
        }
    };
    let params = match validate_request(endpoint, &supplied) {
        Ok(params) => params,
        Err(mut errs) => {
            errors.append(&mut errs);
            Map::new()
        }
    };
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let context = build_context(state, endpoint, params, principal);
    let sql = expand_template(state, endpoint, &context)?;

    if let Some(conn) = endpoint
        .primary_connection()
        .and_then(|name| state.project.connections.get(name))
    {
        if conn.log_queries {
            tracing::info!(endpoint = %key, %sql, "expanded query");
        }
        if conn.log_parameters {
            tracing::info!(endpoint = %key, params = %Value::Object(context.params.clone()), "request parameters");
        }
    }

    let timeout = Duration::from_secs(state.project.timeout.max(1));
    let result = if endpoint.is_write() {
        tokio::time::timeout(timeout, execute_write(state, endpoint, &sql, &context)).await
    } else {
        tokio::time::timeout(timeout, execute_read(state, endpoint, &sql, page)).await
    };
    match result {
        Ok(value) => value,
        Err(_) => Err(ApiError::Database {
            message: "query deadline exceeded".into(),
            details: None,
        }),
    }
}

fn build_context(
    state: &AppState,
    endpoint: &EndpointConfig,
    params: Map<String, Value>,
    principal: Option<Principal>,
) -> RequestContext {
    let conn = endpoint
        .primary_connection()
        .and_then(|name| state.project.connections.get(name))
        .map(|c| c.properties.clone())
        .unwrap_or_default();
    let cache = endpoint
        .cache
        .as_ref()
        .filter(|c| c.enabled)
        .map(|cache| state.cache.read_bindings(&endpoint_key(endpoint), cache));
    RequestContext {
        params,
        conn,
        user: principal,
        env: state.env.clone(),
        cache,
    }
}

/// Expand the endpoint's template (inline or from the template root).
pub fn expand_template(
    state: &AppState,
    endpoint: &EndpointConfig,
    context: &RequestContext,
) -> Result<String, ApiError> {
    let source = match (&endpoint.template, &endpoint.template_source) {
        (Some(inline), _) => inline.clone(),
        (None, Some(file)) => state.templates.read(file)?,
        (None, None) => {
            return Err(ApiError::Configuration(
                "endpoint has no template".into(),
            ));
        }
    };
    let expanded = Expander::with_partials(state.templates.as_ref())
        .expand(&source, &context.bindings())?;
    Ok(expanded.trim().trim_end_matches(';').trim().to_string())
}

async fn execute_read(
    state: &AppState,
    endpoint: &EndpointConfig,
    sql: &str,
    page: PageParams,
) -> Result<Value, ApiError> {
    let connection = endpoint
        .primary_connection()
        .ok_or_else(|| ApiError::Configuration("endpoint has no connection".into()))?;

    // total_count policy: one wrapping count over the expanded query.
    // DuckDB computes this cheaply; the page below never affects it.
    let count_sql = format!("SELECT count(*) FROM ({sql})");
    let total_count = state.engine.query_scalar_i64(count_sql).await?;

    let page_sql = format!(
        "SELECT * FROM ({sql}) LIMIT {} OFFSET {}",
        page.limit + 1,
        page.offset
    );
    let mut rows = state
        .engine
        .query_rows(connection, page_sql, page.limit as usize + 1)
        .await?;
    let has_more = rows.len() > page.limit as usize;
    rows.truncate(page.limit as usize);

    let shaped = Page {
        data: rows.into_iter().map(Value::Object).collect(),
        next: page.next_cursor(has_more),
        total_count,
    };
    serde_json::to_value(shaped).map_err(|e| ApiError::Internal(e.to_string()))
}

async fn execute_write(
    state: &AppState,
    endpoint: &EndpointConfig,
    sql: &str,
    context: &RequestContext,
) -> Result<Value, ApiError> {
    let connection = endpoint
        .primary_connection()
        .ok_or_else(|| ApiError::Configuration("endpoint has no connection".into()))?;
    let operation = endpoint.operation.clone().unwrap_or_default();

    // Statements without RETURNING surface rows through the configured
    // follow-up select, expanded with the same bindings as the write. It
    // runs after the statement, sharing its transaction when
    // `operation.transaction` is set; ordering across the two statements
    // is only guaranteed in that case.
    let follow_up = match operation.returns_data.follow_up() {
        Some(template) => {
            let expanded = Expander::with_partials(state.templates.as_ref())
                .expand(template, &context.bindings())?;
            Some(expanded.trim().trim_end_matches(';').trim().to_string())
        }
        None => None,
    };

    let result = state
        .engine
        .execute_write(connection, sql.to_string(), follow_up, operation.transaction)
        .await?;

    let mut outcome = WriteOutcome {
        rows_affected: result.rows_affected,
        last_insert_id: result.last_insert_id,
        data: None,
    };
    if !result.rows.is_empty() {
        outcome.data = Some(result.rows.into_iter().map(Value::Object).collect());
    }
    serde_json::to_value(outcome).map_err(|e| ApiError::Internal(e.to_string()))
}

fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    let Some(query) = query else {
        return BTreeMap::new();
    };
    form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn header_map(headers: &axum::http::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn client_address(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

async fn read_body_object(body: Body) -> Result<Map<String, Value>, ApiError> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::Validation(vec![FieldError::new("body", e.to_string())]))?;
    if bytes.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::Validation(vec![FieldError::new(
            "body",
            "request body must be a JSON object",
        )])),
        Err(e) => Err(ApiError::Validation(vec![FieldError::new(
            "body",
            format!("invalid JSON body: {e}"),
        )])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_parsing_decodes_pairs() {
        let map = parse_query(Some("id=1&segment=BUILDING&name=John%20Doe"));
        assert_eq!(map["id"], "1");
        assert_eq!(map["name"], "John Doe");
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn client_address_prefers_forwarded_header() {
        let mut headers = axum::http::HeaderMap::new();
        assert_eq!(client_address(&headers), "local");
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(client_address(&headers), "10.1.2.3");
    }

    #[tokio::test]
    async fn body_must_be_json_object() {
        let ok = read_body_object(Body::from(r#"{"a": 1}"#)).await.unwrap();
        assert_eq!(ok["a"], json!(1));
        assert!(read_body_object(Body::from("[1,2]")).await.is_err());
        assert!(read_body_object(Body::from("not json")).await.is_err());
        assert!(read_body_object(Body::empty()).await.unwrap().is_empty());
    }
}
