//! Per-request parameter validation.
//!
//! Validators run in declaration order and every failure is collected
//! before returning, so one response reports all reasons. The required
//! check short-circuits the rest of a field's validators; unknown
//! request-supplied fields are rejected outright.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveTime};
use ductile_core::{FieldError, RESERVED_PARAMS};
use regex::Regex;
use serde_json::{Map, Value};

use crate::model::{EndpointConfig, ParamLocation, ValidatorSpec};

pub const MSG_REQUIRED: &str = "Required field is missing";
pub const MSG_UNKNOWN: &str = "Unknown parameter not defined in endpoint configuration";

/// Raw request values, grouped by declared location.
#[derive(Debug, Default, Clone)]
pub struct SuppliedParams {
    pub query: BTreeMap<String, String>,
    pub path: BTreeMap<String, String>,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Map<String, Value>,
}

/// A raw value before coercion: strings from the URL/headers, arbitrary
/// JSON from the body.
enum Raw<'a> {
    Str(&'a str),
    Json(&'a Value),
}

impl Raw<'_> {
    fn as_text(&self) -> String {
        match self {
            Raw::Str(s) => (*s).to_string(),
            Raw::Json(Value::String(s)) => s.clone(),
            Raw::Json(other) => other.to_string(),
        }
    }

    fn passthrough(&self) -> Value {
        match self {
            Raw::Str(s) => Value::String((*s).to_string()),
            Raw::Json(v) => (*v).clone(),
        }
    }
}

/// Validate a request against the endpoint's declared parameters.
///
/// Returns the coerced parameter map on success, or every collected field
/// error on failure. No SQL runs when this fails.
pub fn validate_request(
    endpoint: &EndpointConfig,
    supplied: &SuppliedParams,
) -> Result<Map<String, Value>, Vec<FieldError>> {
    let mut errors = Vec::new();
    let mut coerced = Map::new();

    // Unknown-parameter rejection for caller-controlled locations.
    for key in supplied.query.keys() {
        if RESERVED_PARAMS.contains(&key.as_str()) {
            continue;
        }
        if endpoint.find_parameter(key).is_none() {
            errors.push(FieldError::new(key.clone(), MSG_UNKNOWN));
        }
    }
    for key in supplied.body.keys() {
        if endpoint.find_parameter(key).is_none() {
            errors.push(FieldError::new(key.clone(), MSG_UNKNOWN));
        }
    }

    for param in &endpoint.request {
        let raw = lookup(supplied, param.location, &param.name);
        let Some(raw) = raw else {
            if param.required {
                errors.push(FieldError::new(param.name.clone(), MSG_REQUIRED));
            } else if let Some(default) = &param.default {
                if let Ok(value) = serde_json::to_value(default) {
                    coerced.insert(param.name.clone(), value);
                }
            }
            continue;
        };

        let mut value: Option<Value> = None;
        for validator in &param.validators {
            match run_validator(validator, &param.name, &raw) {
                Ok(v) => {
                    value.get_or_insert(v);
                }
                Err(mut errs) => errors.append(&mut errs),
            }
        }
        coerced.insert(
            param.name.clone(),
            value.unwrap_or_else(|| raw.passthrough()),
        );
    }

    if errors.is_empty() {
        Ok(coerced)
    } else {
        Err(errors)
    }
}

fn lookup<'a>(
    supplied: &'a SuppliedParams,
    location: ParamLocation,
    name: &str,
) -> Option<Raw<'a>> {
    match location {
        ParamLocation::Query => supplied.query.get(name).map(|s| Raw::Str(s.as_str())),
        ParamLocation::Path => supplied.path.get(name).map(|s| Raw::Str(s.as_str())),
        ParamLocation::Header => supplied
            .headers
            .get(&name.to_ascii_lowercase())
            .map(|s| Raw::Str(s.as_str())),
        ParamLocation::Body => supplied.body.get(name).map(Raw::Json),
    }
}

fn run_validator(
    spec: &ValidatorSpec,
    field: &str,
    raw: &Raw<'_>,
) -> Result<Value, Vec<FieldError>> {
    let text = raw.as_text();
    match spec {
        ValidatorSpec::Int { min, max } => {
            let parsed = match raw {
                Raw::Json(Value::Number(n)) => n.as_i64(),
                _ => text.parse::<i64>().ok(),
            };
            let Some(n) = parsed else {
                return Err(vec![FieldError::new(field, "Invalid integer format")]);
            };
            let mut errs = Vec::new();
            if let Some(min) = min {
                if n < *min {
                    errs.push(FieldError::new(field, format!("Value is below minimum of {min}")));
                }
            }
            if let Some(max) = max {
                if n > *max {
                    errs.push(FieldError::new(field, format!("Value is above maximum of {max}")));
                }
            }
            if errs.is_empty() {
                Ok(Value::from(n))
            } else {
                Err(errs)
            }
        }
        ValidatorSpec::String {
            regex,
            min_length,
            max_length,
            prevent_sql_injection,
            forbidden_keywords,
        } => {
            let mut errs = Vec::new();
            if let Some(min) = min_length {
                if text.chars().count() < *min {
                    errs.push(FieldError::new(
                        field,
                        format!("Value is shorter than minimum length of {min}"),
                    ));
                }
            }
            if let Some(max) = max_length {
                if text.chars().count() > *max {
                    errs.push(FieldError::new(
                        field,
                        format!("Value is longer than maximum length of {max}"),
                    ));
                }
            }
            if let Some(pattern) = regex {
                match Regex::new(pattern) {
                    Ok(re) if re.is_match(&text) => {}
                    Ok(_) => {
                        errs.push(FieldError::new(field, "Value does not match pattern"))
                    }
                    Err(_) => errs.push(FieldError::new(field, "Invalid validator pattern")),
                }
            }
            if *prevent_sql_injection {
                errs.extend(injection_errors(field, &text, forbidden_keywords.as_deref()));
            }
            if errs.is_empty() {
                Ok(Value::String(text))
            } else {
                Err(errs)
            }
        }
        ValidatorSpec::Enum { allowed_values } => {
            if allowed_values.iter().any(|v| v == &text) {
                Ok(Value::String(text))
            } else {
                Err(vec![FieldError::new(
                    field,
                    "Value is not one of the allowed values",
                )])
            }
        }
        ValidatorSpec::Email => {
            static EMAIL: OnceLock<Regex> = OnceLock::new();
            let re = EMAIL.get_or_init(|| {
                Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static pattern")
            });
            if re.is_match(&text) {
                Ok(Value::String(text))
            } else {
                Err(vec![FieldError::new(field, "Invalid email format")])
            }
        }
        ValidatorSpec::Uuid => match uuid::Uuid::parse_str(&text) {
            Ok(parsed) => Ok(Value::String(parsed.to_string())),
            Err(_) => Err(vec![FieldError::new(field, "Invalid UUID format")]),
        },
        ValidatorSpec::Date { min, max } => {
            let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") else {
                return Err(vec![FieldError::new(field, "Invalid date format")]);
            };
            let mut errs = Vec::new();
            if let Some(min) = min.as_deref().and_then(parse_date) {
                if date < min {
                    errs.push(FieldError::new(field, format!("Date is before minimum of {min}")));
                }
            }
            if let Some(max) = max.as_deref().and_then(parse_date) {
                if date > max {
                    errs.push(FieldError::new(field, format!("Date is after maximum of {max}")));
                }
            }
            if errs.is_empty() {
                Ok(Value::String(text))
            } else {
                Err(errs)
            }
        }
        ValidatorSpec::Time { min, max } => {
            let Ok(time) = NaiveTime::parse_from_str(&text, "%H:%M:%S") else {
                return Err(vec![FieldError::new(field, "Invalid time format")]);
            };
            let mut errs = Vec::new();
            if let Some(min) = min.as_deref().and_then(parse_time) {
                if time < min {
                    errs.push(FieldError::new(field, format!("Time is before minimum of {min}")));
                }
            }
            if let Some(max) = max.as_deref().and_then(parse_time) {
                if time > max {
                    errs.push(FieldError::new(field, format!("Time is after maximum of {max}")));
                }
            }
            if errs.is_empty() {
                Ok(Value::String(text))
            } else {
                Err(errs)
            }
        }
        ValidatorSpec::Bool => match raw {
            Raw::Json(Value::Bool(b)) => Ok(Value::Bool(*b)),
            _ => match text.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(vec![FieldError::new(field, "Invalid boolean value")]),
            },
        },
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S").ok()
}

const DEFAULT_FORBIDDEN_KEYWORDS: [&str; 11] = [
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "CREATE", "TRUNCATE", "EXEC", "UNION",
    "GRANT", "REVOKE",
];

/// Injection screening for user-controlled strings that templates splice
/// into SQL literals: comment sequences, statement terminators, unbalanced
/// quotes, and statement keywords.
fn injection_errors(
    field: &str,
    text: &str,
    keywords: Option<&[String]>,
) -> Vec<FieldError> {
    let mut errs = Vec::new();

    if text.contains("--") || text.contains("/*") || text.contains("*/") {
        errs.push(FieldError::new(
            field,
            "Value contains a SQL comment sequence",
        ));
    }
    if text.contains(';') {
        errs.push(FieldError::new(
            field,
            "Value contains a statement terminator",
        ));
    }
    if text.matches('\'').count() % 2 != 0 || text.matches('"').count() % 2 != 0 {
        errs.push(FieldError::new(field, "Value contains unbalanced quotes"));
    }

    let upper = text.to_ascii_uppercase();
    let matched = match keywords {
        Some(custom) => custom
            .iter()
            .find(|kw| contains_word(&upper, &kw.to_ascii_uppercase()))
            .map(|kw| kw.to_string()),
        None => DEFAULT_FORBIDDEN_KEYWORDS
            .iter()
            .find(|kw| contains_word(&upper, kw))
            .map(|kw| kw.to_string()),
    };
    if let Some(keyword) = matched {
        errs.push(FieldError::new(
            field,
            format!("Value contains forbidden keyword {keyword}"),
        ));
    }

    errs
}

fn contains_word(haystack: &str, word: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        let after = abs + word.len();
        let after_ok = after >= haystack.len()
            || !haystack[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}
