use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// A field-level validation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The single error taxonomy carried through every component.
///
/// Components return `ApiError` upward; the request handler is the only
/// place that turns one into an HTTP (or MCP) response.
pub enum ApiError {
    /// One or more request parameters failed validation.
    Validation(Vec<FieldError>),
    /// Missing or invalid credentials.
    Authentication(String),
    /// Authenticated but not allowed (role mismatch).
    Authorization(String),
    /// Unknown endpoint or missing row.
    NotFound(String),
    /// Principal exceeded its request budget. `retry_after` is seconds
    /// until the current window resets.
    RateLimit { message: String, retry_after: u64 },
    /// The engine rejected a query. `details` carries the engine message
    /// with credentials stripped.
    Database { message: String, details: Option<String> },
    /// Invalid project or endpoint descriptor, at startup or on reload.
    Configuration(String),
    /// Unexpected failure; never carries internal detail to the client.
    Internal(String),
}

impl ApiError {
    /// Stable category string used in the JSON body.
    pub fn category(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::Authentication(_) => "authentication",
            ApiError::Authorization(_) => "authorization",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimit { .. } => "rate_limit",
            ApiError::Database { .. } => "database",
            ApiError::Configuration(_) => "configuration",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ApiError::Authorization(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Database { .. }
            | ApiError::Configuration(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::Validation(errors) => {
                format!("Validation failed: {} error(s)", errors.len())
            }
            ApiError::Authentication(msg)
            | ApiError::Authorization(msg)
            | ApiError::NotFound(msg)
            | ApiError::Configuration(msg)
            | ApiError::Internal(msg) => msg.clone(),
            ApiError::RateLimit { message, .. } => message.clone(),
            ApiError::Database { message, .. } => message.clone(),
        }
    }

    /// The stable wire shape:
    /// `{ success:false, category, message, details?, errors? }`.
    pub fn to_body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "success": false,
            "category": self.category(),
            "message": self.message(),
        });
        match self {
            ApiError::Validation(errors) => {
                body["errors"] = serde_json::to_value(errors).unwrap_or_default();
            }
            ApiError::Database { details: Some(details), .. } => {
                body["details"] = serde_json::Value::String(details.clone());
            }
            _ => {}
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.to_body();
        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimit { retry_after, .. } = self {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Validation(errors) => {
                write!(f, "Validation failed ({} errors)", errors.len())
            }
            ApiError::Authentication(msg) => write!(f, "Authentication: {msg}"),
            ApiError::Authorization(msg) => write!(f, "Authorization: {msg}"),
            ApiError::NotFound(msg) => write!(f, "Not found: {msg}"),
            ApiError::RateLimit { message, .. } => write!(f, "Rate limit: {message}"),
            ApiError::Database { message, details } => match details {
                Some(details) => write!(f, "Database: {message} ({details})"),
                None => write!(f, "Database: {message}"),
            },
            ApiError::Configuration(msg) => write!(f, "Configuration: {msg}"),
            ApiError::Internal(msg) => write!(f, "Internal: {msg}"),
        }
    }
}

impl std::fmt::Debug for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for ApiError {}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn error_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn validation_carries_field_errors() {
        let err = ApiError::Validation(vec![
            FieldError::new("id", "Value below minimum"),
            FieldError::new("email", "Invalid email format"),
        ]);
        let (status, body) = error_parts(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["category"], "validation");
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
        assert_eq!(body["errors"][0]["field"], "id");
    }

    #[tokio::test]
    async fn authentication_maps_to_401() {
        let (status, body) = error_parts(ApiError::Authentication("bad credentials".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["category"], "authentication");
        assert_eq!(body["message"], "bad credentials");
    }

    #[tokio::test]
    async fn authorization_maps_to_403() {
        let (status, body) = error_parts(ApiError::Authorization("role mismatch".into())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["category"], "authorization");
    }

    #[tokio::test]
    async fn rate_limit_sets_retry_after_header() {
        let err = ApiError::RateLimit {
            message: "Too many requests".into(),
            retry_after: 42,
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "42");
    }

    #[tokio::test]
    async fn database_includes_details() {
        let err = ApiError::Database {
            message: "query failed".into(),
            details: Some("Binder Error: column x not found".into()),
        };
        let (status, body) = error_parts(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["category"], "database");
        assert!(body["details"].as_str().unwrap().contains("Binder Error"));
    }

    #[tokio::test]
    async fn internal_has_no_details_key() {
        let (_, body) = error_parts(ApiError::Internal("boom".into())).await;
        assert!(body.get("details").is_none());
        assert!(body.get("errors").is_none());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            ApiError::NotFound("no such endpoint".into()).to_string(),
            "Not found: no such endpoint"
        );
        assert_eq!(
            ApiError::Configuration("bad yaml".into()).to_string(),
            "Configuration: bad yaml"
        );
    }
}
