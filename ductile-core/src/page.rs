use serde::Serialize;

use crate::error::FieldError;

/// Default page size when the request does not pass `limit`.
pub const DEFAULT_LIMIT: u64 = 100;
/// Hard ceiling on `limit`.
pub const MAX_LIMIT: u64 = 10_000;

/// Reserved pagination parameters, consumed by the handler before
/// unknown-parameter rejection runs.
pub const RESERVED_PARAMS: [&str; 2] = ["limit", "offset"];

/// Parsed `limit`/`offset` query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub limit: u64,
    pub offset: u64,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl PageParams {
    /// Parse pagination parameters from raw query values. Parse failures
    /// are reported as field errors so they aggregate with validator
    /// failures.
    pub fn parse(
        limit: Option<&str>,
        offset: Option<&str>,
    ) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();
        let mut params = Self::default();

        if let Some(raw) = limit {
            match raw.parse::<u64>() {
                Ok(v) if v >= 1 && v <= MAX_LIMIT => params.limit = v,
                Ok(_) => errors.push(FieldError::new(
                    "limit",
                    format!("limit must be between 1 and {MAX_LIMIT}"),
                )),
                Err(_) => errors.push(FieldError::new("limit", "limit must be an integer")),
            }
        }
        if let Some(raw) = offset {
            match raw.parse::<u64>() {
                Ok(v) => params.offset = v,
                Err(_) => errors.push(FieldError::new("offset", "offset must be an integer")),
            }
        }

        if errors.is_empty() {
            Ok(params)
        } else {
            Err(errors)
        }
    }

    /// The `next` cursor for a page: the next offset as a string when more
    /// rows exist, the empty string when the result set is exhausted.
    pub fn next_cursor(&self, has_more: bool) -> String {
        if has_more {
            (self.offset + self.limit).to_string()
        } else {
            String::new()
        }
    }
}

/// Standard read response: `{ data, next, total_count }`.
#[derive(Debug, Serialize)]
pub struct Page {
    pub data: Vec<serde_json::Value>,
    pub next: String,
    pub total_count: i64,
}

/// Standard write response: `{ rows_affected, last_insert_id?, data? }`.
#[derive(Debug, Default, Serialize)]
pub struct WriteOutcome {
    pub rows_affected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<serde_json::Value>>,
}
