//! OpenAPI projection of the endpoint registry. Pure function of the
//! descriptors; holds no state.

use ductile_config::{
    EndpointRegistry, ParamLocation, ParameterSpec, ProjectConfig, ValidatorSpec,
};
use serde_json::{json, Map, Value};

/// JSON-schema type of a parameter, derived from its first typed
/// validator.
fn schema_for(param: &ParameterSpec) -> Value {
    let kind = param.validators.first();
    match kind {
        Some(ValidatorSpec::Int { min, max }) => {
            let mut schema = Map::new();
            schema.insert("type".into(), json!("integer"));
            if let Some(min) = min {
                schema.insert("minimum".into(), json!(min));
            }
            if let Some(max) = max {
                schema.insert("maximum".into(), json!(max));
            }
            Value::Object(schema)
        }
        Some(ValidatorSpec::Bool) => json!({ "type": "boolean" }),
        Some(ValidatorSpec::Enum { allowed_values }) => {
            json!({ "type": "string", "enum": allowed_values })
        }
        Some(ValidatorSpec::Email) => json!({ "type": "string", "format": "email" }),
        Some(ValidatorSpec::Uuid) => json!({ "type": "string", "format": "uuid" }),
        Some(ValidatorSpec::Date { .. }) => json!({ "type": "string", "format": "date" }),
        Some(ValidatorSpec::Time { .. }) => json!({ "type": "string", "format": "time" }),
        Some(ValidatorSpec::String { regex, .. }) => {
            let mut schema = Map::new();
            schema.insert("type".into(), json!("string"));
            if let Some(regex) = regex {
                schema.insert("pattern".into(), json!(regex));
            }
            Value::Object(schema)
        }
        None => json!({ "type": "string" }),
    }
}

/// The argument schema shared by OpenAPI request bodies and MCP tools.
pub fn parameters_object_schema(params: &[ParameterSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        let mut schema = schema_for(param);
        if !param.description.is_empty() {
            schema["description"] = json!(param.description);
        }
        properties.insert(param.name.clone(), schema);
        if param.required {
            required.push(json!(param.name));
        }
    }
    let mut object = Map::new();
    object.insert("type".into(), json!("object"));
    object.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        object.insert("required".into(), Value::Array(required));
    }
    Value::Object(object)
}

/// Build an OpenAPI 3.1.0 document from the registry.
pub fn build_spec(project: &ProjectConfig, registry: &EndpointRegistry) -> Value {
    let mut paths: Map<String, Value> = Map::new();

    for entry in registry.entries() {
        let endpoint = &entry.endpoint;
        let Some(url_path) = endpoint.url_path.as_deref() else {
            continue;
        };
        // `:param` segments become `{param}` path templates.
        let doc_path = url_path
            .split('/')
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => format!("{{{name}}}"),
                None => segment.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");
        let method = endpoint.method.to_ascii_lowercase();

        let mut operation: Map<String, Value> = Map::new();
        operation.insert(
            "operationId".into(),
            json!(format!("{}_{}", method, ductile_core::path_to_slug(url_path))),
        );

        let mut parameters = Vec::new();
        let mut body_params = Vec::new();
        for param in &endpoint.request {
            match param.location {
                ParamLocation::Body => body_params.push(param.clone()),
                location => {
                    let location = match location {
                        ParamLocation::Query => "query",
                        ParamLocation::Path => "path",
                        ParamLocation::Header => "header",
                        ParamLocation::Body => unreachable!(),
                    };
                    parameters.push(json!({
                        "name": param.name,
                        "in": location,
                        "required": param.required || location == "path",
                        "description": param.description,
                        "schema": schema_for(param),
                    }));
                }
            }
        }
        if !endpoint.is_write() {
            parameters.push(json!({
                "name": "limit", "in": "query", "required": false,
                "schema": { "type": "integer" }
            }));
            parameters.push(json!({
                "name": "offset", "in": "query", "required": false,
                "schema": { "type": "integer" }
            }));
        }
        if !parameters.is_empty() {
            operation.insert("parameters".into(), Value::Array(parameters));
        }
        if !body_params.is_empty() {
            operation.insert(
                "requestBody".into(),
                json!({
                    "required": body_params.iter().any(|p| p.required),
                    "content": {
                        "application/json": {
                            "schema": parameters_object_schema(&body_params)
                        }
                    }
                }),
            );
        }

        let mut responses: Map<String, Value> = Map::new();
        if endpoint.is_write() {
            responses.insert(
                "200".into(),
                json!({
                    "description": "Write result",
                    "content": { "application/json": { "schema": {
                        "type": "object",
                        "properties": {
                            "rows_affected": { "type": "integer" },
                            "last_insert_id": { "type": "integer" },
                            "data": { "type": "array", "items": { "type": "object" } }
                        }
                    }}}
                }),
            );
        } else {
            responses.insert(
                "200".into(),
                json!({
                    "description": "Query result page",
                    "content": { "application/json": { "schema": {
                        "type": "object",
                        "properties": {
                            "data": { "type": "array", "items": { "type": "object" } },
                            "next": { "type": "string" },
                            "total_count": { "type": "integer" }
                        }
                    }}}
                }),
            );
        }
        responses.insert("400".into(), json!({ "description": "Validation failure" }));
        let has_auth = endpoint.auth.is_some() || project.auth.is_some();
        if has_auth {
            responses.insert("401".into(), json!({ "description": "Unauthorized" }));
            responses.insert("403".into(), json!({ "description": "Forbidden" }));
        }
        if endpoint.rate_limit.is_some() || project.rate_limit.is_some() {
            responses.insert("429".into(), json!({ "description": "Rate limited" }));
        }
        responses.insert("500".into(), json!({ "description": "Engine or internal error" }));
        operation.insert("responses".into(), Value::Object(responses));

        let path_entry = paths.entry(doc_path).or_insert_with(|| json!({}));
        if let Some(obj) = path_entry.as_object_mut() {
            obj.insert(method, Value::Object(operation));
        }
    }

    let mut info: Map<String, Value> = Map::new();
    info.insert("title".into(), json!(project.project_name));
    info.insert("version".into(), json!("1.0.0"));
    if !project.project_description.is_empty() {
        info.insert("description".into(), json!(project.project_description));
    }

    json!({
        "openapi": "3.1.0",
        "info": info,
        "paths": paths,
        "components": {
            "securitySchemes": {
                "basicAuth": { "type": "http", "scheme": "basic" },
                "bearerAuth": { "type": "http", "scheme": "bearer", "bearerFormat": "JWT" }
            }
        }
    })
}
