//! Descriptor model: the project document, named connections, and the
//! per-endpoint documents scanned from the template root.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

// ── Durations ──────────────────────────────────────────────────────────

/// Parse a schedule/interval value: `"30s"`, `"15m"`, `"1h"`, `"2d"`,
/// `"500ms"`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = raw.split_at(split);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        "d" => Some(Duration::from_secs(value * 86400)),
        _ => None,
    }
}

fn de_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Num(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(Raw::Str(s)) => parse_duration(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s:?}"))),
    }
}

// ── Project document ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub project_description: String,
    #[serde(default)]
    pub template: TemplateSettings,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub duckdb: DuckdbSettings,
    #[serde(default)]
    pub ducklake: DucklakeSettings,
    #[serde(default, rename = "enforce-https", alias = "enforce_https")]
    pub enforce_https: HttpsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Global auth defaults applied to endpoints without their own block.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Global rate-limit defaults.
    #[serde(default, rename = "rate-limit", alias = "rate_limit")]
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateSettings {
    /// Template root directory, relative to the project file.
    #[serde(default = "default_template_path")]
    pub path: String,
    /// Regex patterns naming the environment variables templates may see.
    #[serde(
        default,
        rename = "environment-whitelist",
        alias = "environment_whitelist"
    )]
    pub environment_whitelist: Vec<String>,
}

fn default_template_path() -> String {
    "endpoints".to_string()
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            path: default_template_path(),
            environment_whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// SQL statements run once when the engine registers the connection.
    #[serde(default)]
    pub init: Option<String>,
    /// String properties exposed to templates as `conn.*`. Values may
    /// reference allow-listed environment variables via `${NAME}`.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default, rename = "log-queries", alias = "log_queries")]
    pub log_queries: bool,
    #[serde(default, rename = "log-parameters", alias = "log_parameters")]
    pub log_parameters: bool,
    /// Allow-pattern restricting what the connection may touch.
    #[serde(default)]
    pub allow: Option<String>,
}

/// Generic engine settings bag. Named fields cover the common knobs; any
/// other key lands in `settings` and is applied as `SET <key> = <value>`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DuckdbSettings {
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub access_mode: Option<String>,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub max_memory: Option<String>,
    /// Extensions to INSTALL/LOAD at startup.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Maximum concurrent read queries.
    #[serde(default = "default_max_readers")]
    pub max_concurrent_reads: usize,
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

fn default_max_readers() -> usize {
    8
}

/// Versioned-catalog settings (a DuckLake attachment).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DucklakeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ducklake_alias")]
    pub alias: String,
    #[serde(default, rename = "metadata-path", alias = "metadata_path")]
    pub metadata_path: Option<String>,
    #[serde(default, rename = "data-path", alias = "data_path")]
    pub data_path: Option<String>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub scheduler: DucklakeSchedulerConfig,
}

fn default_ducklake_alias() -> String {
    "lake".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DucklakeSchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(
        default,
        rename = "scan-interval",
        alias = "scan_interval",
        deserialize_with = "de_duration_opt"
    )]
    pub scan_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HttpsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "ssl-cert-file", alias = "ssl_cert_file")]
    pub ssl_cert_file: Option<String>,
    #[serde(default, rename = "ssl-key-file", alias = "ssl_key_file")]
    pub ssl_key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default = "default_worker_interval",
        rename = "worker-interval",
        alias = "worker_interval",
        deserialize_with = "de_duration"
    )]
    pub worker_interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_worker_interval() -> Duration {
    Duration::from_secs(10)
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    de_duration_opt(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("missing duration"))
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_interval: default_worker_interval(),
        }
    }
}

// ── Auth & rate limit ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `basic` or `bearer`.
    #[serde(default, rename = "type")]
    pub kind: AuthKind,
    /// Inline user table for Basic auth.
    #[serde(default)]
    pub users: Vec<AuthUser>,
    /// Load the user table from a YAML file at startup instead of inline.
    /// A fetch failure marks endpoints using this block unavailable.
    #[serde(default, rename = "users-file", alias = "users_file")]
    pub users_file: Option<String>,
    /// Bearer/JWT settings.
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
    /// Roles the caller must hold (any of); empty means authenticated is
    /// enough.
    #[serde(default, rename = "require-roles", alias = "require_roles")]
    pub require_roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    Basic,
    Bearer,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthUser {
    pub username: String,
    /// Plain text, or a digest entry of the form `sha256:<hex>`.
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JwtConfig {
    /// Shared HMAC secret. Mutually exclusive with `jwks-url`.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default, rename = "jwks-url", alias = "jwks_url")]
    pub jwks_url: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    /// Claim holding the role list; defaults to `roles`.
    #[serde(default, rename = "roles-claim", alias = "roles_claim")]
    pub roles_claim: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_max")]
    pub max: u64,
    #[serde(
        default = "default_rate_interval",
        rename = "interval-seconds",
        alias = "interval_seconds"
    )]
    pub interval_seconds: u64,
    /// Per-user max overrides, keyed by principal id.
    #[serde(default)]
    pub overrides: BTreeMap<String, u64>,
}

fn default_rate_max() -> u64 {
    60
}

fn default_rate_interval() -> u64 {
    60
}

// ── Endpoint document ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EndpointConfig {
    #[serde(default, rename = "url-path", alias = "url_path")]
    pub url_path: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub request: Vec<ParameterSpec>,
    #[serde(default, rename = "template-source", alias = "template_source")]
    pub template_source: Option<String>,
    /// Inline template, used when `template-source` is absent.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub connection: Vec<String>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default, rename = "rate-limit", alias = "rate_limit")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub operation: Option<OperationConfig>,
    #[serde(default, rename = "mcp-tool", alias = "mcp_tool")]
    pub mcp_tool: Option<McpView>,
    #[serde(default, rename = "mcp-resource", alias = "mcp_resource")]
    pub mcp_resource: Option<McpView>,
    #[serde(default, rename = "mcp-prompt", alias = "mcp_prompt")]
    pub mcp_prompt: Option<McpView>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl EndpointConfig {
    /// Primary connection name, when any is declared.
    pub fn primary_connection(&self) -> Option<&str> {
        self.connection.first().map(String::as_str)
    }

    /// Whether the endpoint is a write per method or operation hint.
    pub fn is_write(&self) -> bool {
        if let Some(op) = &self.operation {
            if op.kind == OperationKind::Write {
                return true;
            }
        }
        matches!(
            self.method.to_ascii_uppercase().as_str(),
            "POST" | "PUT" | "PATCH" | "DELETE"
        )
    }

    pub fn find_parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.request.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParameterSpec {
    #[serde(rename = "field-name", alias = "field_name")]
    pub name: String,
    #[serde(default, rename = "field-in", alias = "field_in")]
    pub location: ParamLocation,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    #[serde(default)]
    pub validators: Vec<ValidatorSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    #[default]
    Query,
    Path,
    Header,
    Body,
}

/// Tagged validator variants. Unknown `type` values fail descriptor
/// parsing, surfacing a configuration error with the file name.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValidatorSpec {
    Int {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    String {
        #[serde(default)]
        regex: Option<String>,
        #[serde(default, rename = "min-length", alias = "min_length")]
        min_length: Option<usize>,
        #[serde(default, rename = "max-length", alias = "max_length")]
        max_length: Option<usize>,
        #[serde(
            default,
            rename = "preventSqlInjection",
            alias = "prevent-sql-injection",
            alias = "prevent_sql_injection"
        )]
        prevent_sql_injection: bool,
        /// Statement keywords rejected by the injection check, on top of
        /// comment sequences and unbalanced quotes.
        #[serde(default, rename = "forbidden-keywords", alias = "forbidden_keywords")]
        forbidden_keywords: Option<Vec<String>>,
    },
    Enum {
        #[serde(default, rename = "allowed-values", alias = "allowed_values", alias = "values")]
        allowed_values: Vec<String>,
    },
    Email,
    Uuid,
    Date {
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
    Time {
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
    Bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    /// Refresh period; zero/absent disables scheduled refresh.
    #[serde(default, deserialize_with = "de_duration_opt")]
    pub schedule: Option<Duration>,
    /// Expose a manual refresh route for this endpoint.
    #[serde(default, rename = "refresh-endpoint", alias = "refresh_endpoint")]
    pub refresh_endpoint: bool,
    /// Source template producing the cache table contents.
    #[serde(default, rename = "template-file", alias = "template_file")]
    pub template_file: Option<String>,
    #[serde(default, rename = "primary-key", alias = "primary_key")]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub cursor: Option<CursorConfig>,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CursorConfig {
    pub column: String,
    /// SQL type of the cursor column (`BIGINT`, `TIMESTAMP`, ...). Drives
    /// literal quoting when the manager filters by high-water mark.
    #[serde(default = "default_cursor_type", rename = "type")]
    pub kind: String,
}

fn default_cursor_type() -> String {
    "BIGINT".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(
        default,
        rename = "keep-last-snapshots",
        alias = "keep_last_snapshots"
    )]
    pub keep_last_snapshots: Option<u64>,
    #[serde(
        default,
        rename = "max-snapshot-age",
        alias = "max_snapshot_age",
        deserialize_with = "de_duration_opt"
    )]
    pub max_snapshot_age: Option<Duration>,
}

/// Derived cache write mode; see [`CacheConfig::mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    FullRefresh,
    Append,
    Merge,
    IncrementalMerge,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::FullRefresh => "full",
            CacheMode::Append => "append",
            CacheMode::Merge => "merge",
            CacheMode::IncrementalMerge => "incremental-merge",
        }
    }
}

impl CacheConfig {
    /// Mode derivation: no key & no cursor → full refresh; key only →
    /// merge; key + cursor → incremental merge; cursor only → append.
    pub fn mode(&self) -> CacheMode {
        match (!self.primary_key.is_empty(), self.cursor.is_some()) {
            (false, false) => CacheMode::FullRefresh,
            (true, false) => CacheMode::Merge,
            (true, true) => CacheMode::IncrementalMerge,
            (false, true) => CacheMode::Append,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OperationConfig {
    #[serde(default, rename = "type")]
    pub kind: OperationKind,
    #[serde(default)]
    pub transaction: bool,
    #[serde(default = "default_true")]
    pub validate_before_write: bool,
    #[serde(default)]
    pub returns_data: ReturnsData,
}

/// What a write endpoint returns under `data`.
///
/// `true`/`false` rely on the statement's own `RETURNING` clause; a string
/// is a follow-up select template, expanded with the same bindings as the
/// write statement and run after it (inside the same transaction when
/// `operation.transaction` is set). The follow-up path serves dialects and
/// statements without `RETURNING` support.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ReturnsData {
    Flag(bool),
    FollowUp(String),
}

impl Default for ReturnsData {
    fn default() -> Self {
        ReturnsData::Flag(false)
    }
}

impl ReturnsData {
    /// The follow-up select template, when one is configured.
    pub fn follow_up(&self) -> Option<&str> {
        match self {
            ReturnsData::FollowUp(template) if !template.trim().is_empty() => Some(template),
            _ => None,
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, ReturnsData::Flag(false))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Read,
    Write,
}

/// MCP projection of an endpoint: tool, resource, or prompt view.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpView {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Prompt-only template override.
    #[serde(default)]
    pub template: Option<String>,
    /// Optional argument subset; defaults to the endpoint's request list.
    #[serde(default)]
    pub arguments: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("60m"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("week"), None);
        assert_eq!(parse_duration("10w"), None);
    }

    #[test]
    fn cache_mode_derivation() {
        let mut cache = CacheConfig {
            enabled: true,
            catalog: None,
            schema: None,
            table: "t".into(),
            schedule: None,
            refresh_endpoint: false,
            template_file: None,
            primary_key: vec![],
            cursor: None,
            retention: RetentionConfig::default(),
        };
        assert_eq!(cache.mode(), CacheMode::FullRefresh);

        cache.primary_key = vec!["id".into()];
        assert_eq!(cache.mode(), CacheMode::Merge);

        cache.cursor = Some(CursorConfig {
            column: "updated_at".into(),
            kind: "TIMESTAMP".into(),
        });
        assert_eq!(cache.mode(), CacheMode::IncrementalMerge);

        cache.primary_key.clear();
        assert_eq!(cache.mode(), CacheMode::Append);
    }

    #[test]
    fn endpoint_yaml_round_trip() {
        let yaml = r#"
url-path: /customers/
method: GET
request:
  - field-name: id
    field-in: query
    description: Customer key
    required: false
    validators:
      - type: int
        min: 1
        max: 1000000
  - field-name: segment
    field-in: query
    validators:
      - type: enum
        allowed-values: [BUILDING, AUTOMOBILE, MACHINERY]
template-source: customers.sql
connection: [customers-parquet]
"#;
        let endpoint: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(endpoint.url_path.as_deref(), Some("/customers/"));
        assert_eq!(endpoint.method, "GET");
        assert_eq!(endpoint.request.len(), 2);
        assert_eq!(endpoint.request[0].name, "id");
        assert!(matches!(
            endpoint.request[0].validators[0],
            ValidatorSpec::Int { min: Some(1), .. }
        ));
        assert_eq!(endpoint.primary_connection(), Some("customers-parquet"));
        assert!(!endpoint.is_write());
    }

    #[test]
    fn unknown_validator_type_is_rejected() {
        let yaml = r#"
url-path: /x/
request:
  - field-name: id
    validators:
      - type: telepathy
"#;
        let parsed: Result<EndpointConfig, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }

    #[test]
    fn write_detection_from_method_and_operation() {
        let mut endpoint = EndpointConfig {
            url_path: Some("/x/".into()),
            method: "POST".into(),
            ..Default::default()
        };
        assert!(endpoint.is_write());

        endpoint.method = "GET".into();
        assert!(!endpoint.is_write());

        endpoint.operation = Some(OperationConfig {
            kind: OperationKind::Write,
            ..Default::default()
        });
        assert!(endpoint.is_write());
    }

    #[test]
    fn returns_data_accepts_flag_or_follow_up_select() {
        let flag: OperationConfig =
            serde_yaml::from_str("type: write\nreturns_data: true\n").unwrap();
        assert!(flag.returns_data.enabled());
        assert_eq!(flag.returns_data.follow_up(), None);

        let off: OperationConfig = serde_yaml::from_str("type: write\n").unwrap();
        assert!(!off.returns_data.enabled());

        let follow_up: OperationConfig = serde_yaml::from_str(
            "type: write\nreturns_data: \"SELECT * FROM t WHERE id = {{ params.id }}\"\n",
        )
        .unwrap();
        assert!(follow_up.returns_data.enabled());
        assert_eq!(
            follow_up.returns_data.follow_up(),
            Some("SELECT * FROM t WHERE id = {{ params.id }}")
        );
    }

    #[test]
    fn project_yaml_with_settings_bag() {
        let yaml = r#"
project_name: demo
template:
  path: endpoints
  environment-whitelist:
    - '^DUCTILE_.*'
connections:
  main:
    init: "CREATE TABLE t AS SELECT 1 AS a"
    properties:
      path: data/t.parquet
duckdb:
  db_path: ":memory:"
  threads: 4
  max_memory: 2GB
  default_order: DESC
heartbeat:
  enabled: true
  worker-interval: 5s
"#;
        let project: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(project.project_name, "demo");
        assert_eq!(project.duckdb.threads, Some(4));
        assert!(project.duckdb.settings.contains_key("default_order"));
        assert_eq!(
            project.heartbeat.worker_interval,
            Duration::from_secs(5)
        );
        assert_eq!(project.connections["main"].properties["path"], "data/t.parquet");
    }
}
