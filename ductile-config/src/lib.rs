//! Descriptor model and loading for Ductile.
//!
//! A project document names connections and engine settings; endpoint
//! documents under the template root each describe one REST and/or MCP
//! exposure of a SQL template. Documents compose through
//! `{include:<section> from <path>}` directives and may reference
//! allow-listed environment variables via `${NAME}`.

pub mod envsub;
pub mod error;
pub mod include;
pub mod loader;
pub mod model;
pub mod registry;
pub mod validation;

pub use envsub::EnvAllowlist;
pub use error::ConfigError;
pub use loader::{check_endpoint, ConfigLoader, LoadOutcome};
pub use model::{
    AuthConfig, AuthKind, AuthUser, CacheConfig, CacheMode, ConnectionConfig, CursorConfig,
    DuckdbSettings, DucklakeSettings, EndpointConfig, HeartbeatConfig, JwtConfig, McpView,
    OperationConfig, OperationKind, ParamLocation, ParameterSpec, ProjectConfig, RateLimitConfig,
    RetentionConfig, ReturnsData, TemplateSettings, ValidatorSpec,
};
pub use registry::{EndpointEntry, EndpointRegistry, RegistryHandle};
pub use validation::{validate_request, SuppliedParams, MSG_REQUIRED, MSG_UNKNOWN};
