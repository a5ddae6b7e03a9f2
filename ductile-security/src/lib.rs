//! Authentication and rate limiting.
//!
//! Endpoints carry their own auth blocks; the [`AuthService`] prepares
//! each block once (resolving user-table files, building JWT validators)
//! and answers per-request credential checks. Rate limiting is a fixed
//! window per (endpoint, principal).

mod basic;
mod jwks;
mod jwt;
mod rate_limit;

use dashmap::DashMap;
use std::sync::Arc;

use ductile_core::{ApiError, Principal};
use ductile_config::{AuthConfig, AuthKind, AuthUser};

pub use basic::{authenticate_basic, load_users_file, parse_basic_header};
pub use jwks::JwksCache;
pub use jwt::{principal_from_claims, JwtValidator};
pub use rate_limit::{effective_max, principal_key, RateDecision, RateLimiter};

enum PreparedAuth {
    Basic(Vec<AuthUser>),
    /// The external user table could not be fetched at startup; endpoints
    /// using this block answer 401 until restart.
    Unavailable(String),
    Bearer(JwtValidator),
}

/// Prepared per-endpoint authenticators, keyed by endpoint identity.
#[derive(Default)]
pub struct AuthService {
    prepared: DashMap<String, Arc<PreparedAuth>>,
}

impl AuthService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a prepared entry (after an endpoint reload).
    pub fn invalidate(&self, key: &str) {
        self.prepared.remove(key);
    }

    fn prepare(&self, key: &str, config: &AuthConfig) -> Arc<PreparedAuth> {
        if let Some(existing) = self.prepared.get(key) {
            return existing.clone();
        }
        let prepared = match config.kind {
            AuthKind::Basic => {
                let mut users = config.users.clone();
                let loaded = match &config.users_file {
                    Some(path) => match basic::load_users_file(path) {
                        Ok(mut extra) => {
                            users.append(&mut extra);
                            None
                        }
                        Err(err) => Some(err),
                    },
                    None => None,
                };
                match loaded {
                    Some(err) => {
                        tracing::error!(endpoint = %key, error = %err, "user table fetch failed");
                        PreparedAuth::Unavailable(err)
                    }
                    None => PreparedAuth::Basic(users),
                }
            }
            AuthKind::Bearer => match config.jwt.as_ref() {
                Some(jwt) => match JwtValidator::from_config(jwt) {
                    Ok(validator) => PreparedAuth::Bearer(validator),
                    Err(err) => PreparedAuth::Unavailable(err.to_string()),
                },
                None => PreparedAuth::Unavailable(
                    "bearer auth configured without a jwt block".to_string(),
                ),
            },
        };
        let prepared = Arc::new(prepared);
        self.prepared.insert(key.to_string(), prepared.clone());
        prepared
    }

    /// Verify request credentials for an endpoint. `authorization` is the
    /// raw `Authorization` header, when present.
    pub async fn authenticate(
        &self,
        key: &str,
        config: &AuthConfig,
        authorization: Option<&str>,
    ) -> Result<Principal, ApiError> {
        let prepared = self.prepare(key, config);
        let principal = match prepared.as_ref() {
            PreparedAuth::Unavailable(_) => {
                return Err(ApiError::Authentication(
                    "Authentication backend unavailable".into(),
                ));
            }
            PreparedAuth::Basic(users) => authenticate_basic(users, authorization)?,
            PreparedAuth::Bearer(validator) => {
                let header = authorization.ok_or_else(|| {
                    ApiError::Authentication("Missing Authorization header".into())
                })?;
                let token = header
                    .strip_prefix("Bearer ")
                    .or_else(|| header.strip_prefix("bearer "))
                    .ok_or_else(|| {
                        ApiError::Authentication("Expected Bearer authorization".into())
                    })?;
                validator.validate(token.trim()).await?
            }
        };

        if !config.require_roles.is_empty() && !principal.has_any_role(&config.require_roles) {
            return Err(ApiError::Authorization(format!(
                "caller lacks required role ({})",
                config.require_roles.join(", ")
            )));
        }
        Ok(principal)
    }
}
