//! MCP surface: JSON-RPC 2.0 over HTTP POST, projecting the same endpoint
//! registry as tools, resources, and prompts.
//!
//! The wire types follow the Model Context Protocol; tool calls run
//! through the exact same pipeline as REST requests, with arguments
//! standing in for query parameters.

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use ductile_config::{EndpointEntry, ParamLocation, SuppliedParams};
use ductile_core::ApiError;
use ductile_template::Expander;

use crate::handler::{expand_template, invoke};
use crate::openapi::parameters_object_schema;
use crate::AppState;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const RESOURCE_URI_PREFIX: &str = "ductile://resource/";

/// Request ID (number or string per JSON-RPC).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<RequestId>, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data,
            }),
        }
    }
}

/// JSON-RPC error codes used by the dispatch.
mod code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL: i32 = -32603;
}

pub async fn jsonrpc_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Json<Value> {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            let resp = JsonRpcResponse::failure(
                None,
                code::PARSE_ERROR,
                format!("invalid JSON-RPC request: {e}"),
                None,
            );
            return Json(serde_json::to_value(resp).unwrap_or_default());
        }
    };

    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let id = request.id.clone();
    let response = dispatch(&state, request, authorization.as_deref()).await;
    let response = match response {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err((rpc_code, message, data)) => JsonRpcResponse::failure(id, rpc_code, message, data),
    };
    Json(serde_json::to_value(response).unwrap_or_default())
}

type RpcResult = Result<Value, (i32, String, Option<Value>)>;

async fn dispatch(
    state: &AppState,
    request: JsonRpcRequest,
    authorization: Option<&str>,
) -> RpcResult {
    let params = request.params.unwrap_or(Value::Null);
    match request.method.as_str() {
        "initialize" => Ok(initialize(state)),
        "notifications/initialized" | "ping" => Ok(json!({})),
        "tools/list" => Ok(tools_list(state)),
        "tools/call" => tools_call(state, &params, authorization).await,
        "resources/list" => Ok(resources_list(state)),
        "resources/read" => resources_read(state, &params, authorization).await,
        "prompts/list" => Ok(prompts_list(state)),
        "prompts/get" => prompts_get(state, &params),
        other => Err((
            code::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
            None,
        )),
    }
}

fn initialize(state: &AppState) -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "tools": {},
            "resources": {},
            "prompts": {},
        },
        "serverInfo": {
            "name": if state.project.project_name.is_empty() {
                env!("CARGO_PKG_NAME").to_string()
            } else {
                state.project.project_name.clone()
            },
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

fn tools_list(state: &AppState) -> Value {
    let registry = state.registry.snapshot();
    let tools: Vec<Value> = registry
        .entries()
        .iter()
        .filter_map(|entry| {
            let view = entry.endpoint.mcp_tool.as_ref()?;
            Some(json!({
                "name": view.name,
                "description": view.description,
                "inputSchema": parameters_object_schema(&view_parameters(entry)),
            }))
        })
        .collect();
    json!({ "tools": tools })
}

/// The parameter subset an MCP view exposes: the view's `arguments` list
/// when present, the endpoint's full request list otherwise.
fn view_parameters(entry: &EndpointEntry) -> Vec<ductile_config::ParameterSpec> {
    let view = entry
        .endpoint
        .mcp_tool
        .as_ref()
        .or(entry.endpoint.mcp_prompt.as_ref());
    match view.and_then(|v| v.arguments.as_ref()) {
        Some(names) => entry
            .endpoint
            .request
            .iter()
            .filter(|p| names.contains(&p.name))
            .cloned()
            .collect(),
        None => entry.endpoint.request.clone(),
    }
}

/// Distribute tool-call arguments into the locations the endpoint
/// declares; undeclared names land in the query map so the validator's
/// unknown-parameter rejection sees them.
fn supplied_from_arguments(
    entry: &EndpointEntry,
    arguments: &Map<String, Value>,
) -> SuppliedParams {
    let mut supplied = SuppliedParams::default();
    for (name, value) in arguments {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match entry.endpoint.find_parameter(name).map(|p| p.location) {
            Some(ParamLocation::Body) => {
                supplied.body.insert(name.clone(), value.clone());
            }
            Some(ParamLocation::Path) => {
                supplied.path.insert(name.clone(), text);
            }
            Some(ParamLocation::Header) => {
                supplied.headers.insert(name.to_ascii_lowercase(), text);
            }
            _ => {
                supplied.query.insert(name.clone(), text);
            }
        }
    }
    supplied
}

async fn tools_call(state: &AppState, params: &Value, authorization: Option<&str>) -> RpcResult {
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| (code::INVALID_PARAMS, "missing tool name".to_string(), None))?;
    let registry = state.registry.snapshot();
    let entry = registry
        .tool(name)
        .ok_or_else(|| (code::INVALID_PARAMS, format!("unknown tool {name:?}"), None))?;

    let arguments = params
        .get("arguments")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let supplied = supplied_from_arguments(entry, &arguments);

    let endpoint = entry.endpoint.clone();
    match invoke(state, &endpoint, supplied, authorization, "mcp").await {
        Ok(result) => Ok(json!({
            "content": [{
                "type": "text",
                "text": serde_json::to_string_pretty(&result).unwrap_or_default(),
            }],
            "isError": false,
        })),
        // Tool-level failures stay inside the tool result so clients see
        // the same wire shape REST callers get.
        Err(err) => Ok(json!({
            "content": [{
                "type": "text",
                "text": serde_json::to_string_pretty(&err.to_body()).unwrap_or_default(),
            }],
            "isError": true,
        })),
    }
}

fn resources_list(state: &AppState) -> Value {
    let registry = state.registry.snapshot();
    let resources: Vec<Value> = registry
        .entries()
        .iter()
        .filter_map(|entry| {
            let view = entry.endpoint.mcp_resource.as_ref()?;
            Some(json!({
                "uri": format!("{RESOURCE_URI_PREFIX}{}", view.name),
                "name": view.name,
                "description": view.description,
                "mimeType": "application/json",
            }))
        })
        .collect();
    json!({ "resources": resources })
}

async fn resources_read(
    state: &AppState,
    params: &Value,
    authorization: Option<&str>,
) -> RpcResult {
    let uri = params
        .get("uri")
        .and_then(|v| v.as_str())
        .ok_or_else(|| (code::INVALID_PARAMS, "missing resource uri".to_string(), None))?;
    let name = uri.strip_prefix(RESOURCE_URI_PREFIX).ok_or_else(|| {
        (
            code::INVALID_PARAMS,
            format!("unknown resource uri {uri:?}"),
            None,
        )
    })?;
    let registry = state.registry.snapshot();
    let entry = registry.resource(name).ok_or_else(|| {
        (
            code::INVALID_PARAMS,
            format!("unknown resource {name:?}"),
            None,
        )
    })?;

    // Resources are the read-only, argument-free view.
    let endpoint = entry.endpoint.clone();
    let result = invoke(
        state,
        &endpoint,
        SuppliedParams::default(),
        authorization,
        "mcp",
    )
    .await
    .map_err(rpc_error)?;
    Ok(json!({
        "contents": [{
            "uri": uri,
            "mimeType": "application/json",
            "text": serde_json::to_string_pretty(&result).unwrap_or_default(),
        }]
    }))
}

fn prompts_list(state: &AppState) -> Value {
    let registry = state.registry.snapshot();
    let prompts: Vec<Value> = registry
        .entries()
        .iter()
        .filter_map(|entry| {
            let view = entry.endpoint.mcp_prompt.as_ref()?;
            let arguments: Vec<Value> = view_parameters(entry)
                .iter()
                .map(|p| {
                    json!({
                        "name": p.name,
                        "description": p.description,
                        "required": p.required,
                    })
                })
                .collect();
            Some(json!({
                "name": view.name,
                "description": view.description,
                "arguments": arguments,
            }))
        })
        .collect();
    json!({ "prompts": prompts })
}

fn prompts_get(state: &AppState, params: &Value) -> RpcResult {
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| (code::INVALID_PARAMS, "missing prompt name".to_string(), None))?;
    let registry = state.registry.snapshot();
    let entry = registry
        .prompt(name)
        .ok_or_else(|| (code::INVALID_PARAMS, format!("unknown prompt {name:?}"), None))?;
    let view = entry
        .endpoint
        .mcp_prompt
        .as_ref()
        .expect("prompt lookup returned a prompt entry");

    let arguments = params
        .get("arguments")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    // Prompts are template-only: no SQL, no engine.
    let text = match &view.template {
        Some(template) => {
            let bindings = json!({ "params": arguments });
            Expander::with_partials(state.templates.as_ref())
                .expand(template, &bindings)
                .map_err(|e| rpc_error(ApiError::from(e)))?
        }
        None => {
            let context = ductile_core::RequestContext {
                params: arguments,
                env: state.env.clone(),
                ..Default::default()
            };
            expand_template(state, &entry.endpoint, &context).map_err(rpc_error)?
        }
    };

    Ok(json!({
        "description": view.description,
        "messages": [{
            "role": "user",
            "content": { "type": "text", "text": text },
        }]
    }))
}

fn rpc_error(err: ApiError) -> (i32, String, Option<Value>) {
    let code = match &err {
        ApiError::Validation(_) => code::INVALID_PARAMS,
        ApiError::NotFound(_) => code::INVALID_PARAMS,
        _ => code::INTERNAL,
    };
    (code, err.message(), Some(err.to_body()))
}
