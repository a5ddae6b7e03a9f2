//! Bearer/JWT verification for endpoints with `auth.type: bearer`.
//!
//! The decoding key comes from either a shared HMAC secret or a JWKS URL
//! (keys cached by kid). Validated claims map onto the request principal:
//! `sub`, `email`, and the configured roles claim with a fallback to the
//! Keycloak-style `realm_access.roles`.

use std::sync::Arc;

use ductile_core::{ApiError, Principal};
use ductile_config::JwtConfig;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use tracing::{debug, warn};

use crate::jwks::JwksCache;

enum KeySource {
    Static(DecodingKey),
    Jwks(Arc<JwksCache>),
}

pub struct JwtValidator {
    key_source: KeySource,
    config: JwtConfig,
}

impl JwtValidator {
    /// Build a validator from endpoint configuration. A shared secret wins
    /// over a JWKS URL when both are present.
    pub fn from_config(config: &JwtConfig) -> Result<Self, ApiError> {
        let key_source = if let Some(secret) = &config.secret {
            KeySource::Static(DecodingKey::from_secret(secret.as_bytes()))
        } else if let Some(url) = &config.jwks_url {
            KeySource::Jwks(Arc::new(JwksCache::new(url.clone())))
        } else {
            return Err(ApiError::Configuration(
                "bearer auth needs either jwt.secret or jwt.jwks-url".into(),
            ));
        };
        Ok(Self {
            key_source,
            config: config.clone(),
        })
    }

    /// Validate a bearer token and build the principal.
    pub async fn validate(&self, token: &str) -> Result<Principal, ApiError> {
        let header = decode_header(token)
            .map_err(|e| ApiError::Authentication(format!("Invalid token header: {e}")))?;

        let (key, algorithm) = match &self.key_source {
            KeySource::Static(key) => (key.clone(), Algorithm::HS256),
            KeySource::Jwks(jwks) => {
                let kid = header.kid.as_deref().ok_or_else(|| {
                    ApiError::Authentication("Token header missing kid".into())
                })?;
                let key = jwks
                    .get_key(kid)
                    .await
                    .map_err(ApiError::Authentication)?;
                (key, header.alg)
            }
        };

        let mut validation = Validation::new(algorithm);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }
        validation.validate_exp = true;

        let data = decode::<serde_json::Value>(token, &key, &validation).map_err(|e| {
            let message = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => "Token expired".to_string(),
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => "Invalid issuer".to_string(),
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    "Invalid audience".to_string()
                }
                _ => format!("Invalid token: {e}"),
            };
            warn!(error = %message, "bearer token rejected");
            ApiError::Authentication(message)
        })?;

        let claims = data.claims;
        let principal = principal_from_claims(claims, self.config.roles_claim.as_deref());
        debug!(sub = %principal.id, "bearer token accepted");
        Ok(principal)
    }
}

/// Map validated claims onto the principal.
pub fn principal_from_claims(claims: serde_json::Value, roles_claim: Option<&str>) -> Principal {
    let id = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let email = claims
        .get("email")
        .and_then(|v| v.as_str())
        .map(String::from);
    let roles = extract_roles(&claims, roles_claim);
    Principal {
        id,
        email,
        roles,
        claims,
    }
}

fn extract_roles(claims: &serde_json::Value, roles_claim: Option<&str>) -> Vec<String> {
    let configured = roles_claim.unwrap_or("roles");
    let from_claim = claims.get(configured).and_then(roles_list);
    if let Some(roles) = from_claim {
        return roles;
    }
    // Keycloak-style fallback.
    claims
        .get("realm_access")
        .and_then(|ra| ra.get("roles"))
        .and_then(roles_list)
        .unwrap_or_default()
}

fn roles_list(value: &serde_json::Value) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn config(secret: &str) -> JwtConfig {
        JwtConfig {
            secret: Some(secret.to_string()),
            ..Default::default()
        }
    }

    fn exp_in(secs: i64) -> i64 {
        unix_now() + secs
    }

    fn unix_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[tokio::test]
    async fn valid_token_maps_claims() {
        let validator = JwtValidator::from_config(&config("s3cret")).unwrap();
        let token = token(
            json!({
                "sub": "user-1",
                "email": "u@example.com",
                "roles": ["reader", "writer"],
                "exp": exp_in(3600),
            }),
            "s3cret",
        );
        let principal = validator.validate(&token).await.unwrap();
        assert_eq!(principal.id, "user-1");
        assert_eq!(principal.email.as_deref(), Some("u@example.com"));
        assert_eq!(principal.roles, vec!["reader", "writer"]);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let validator = JwtValidator::from_config(&config("right")).unwrap();
        let token = token(json!({"sub": "x", "exp": exp_in(3600)}), "wrong");
        let err = validator.validate(&token).await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let validator = JwtValidator::from_config(&config("s")).unwrap();
        let token = token(json!({"sub": "x", "exp": exp_in(-3600)}), "s");
        let err = validator.validate(&token).await.unwrap_err();
        assert!(err.to_string().contains("expired") || err.to_string().contains("Expired"));
    }

    #[tokio::test]
    async fn issuer_and_audience_enforced() {
        let mut cfg = config("s");
        cfg.issuer = Some("ductile".into());
        cfg.audience = Some("api".into());
        let validator = JwtValidator::from_config(&cfg).unwrap();

        let good = token(
            json!({"sub": "x", "iss": "ductile", "aud": "api", "exp": exp_in(60)}),
            "s",
        );
        assert!(validator.validate(&good).await.is_ok());

        let bad = token(
            json!({"sub": "x", "iss": "other", "aud": "api", "exp": exp_in(60)}),
            "s",
        );
        assert!(validator.validate(&bad).await.is_err());
    }

    #[test]
    fn keycloak_fallback_roles() {
        let principal = principal_from_claims(
            json!({"sub": "x", "realm_access": {"roles": ["admin"]}}),
            None,
        );
        assert_eq!(principal.roles, vec!["admin"]);
    }

    #[test]
    fn configured_roles_claim() {
        let principal = principal_from_claims(
            json!({"sub": "x", "groups": ["g1"], "roles": ["ignored-if-configured"]}),
            Some("groups"),
        );
        assert_eq!(principal.roles, vec!["g1"]);
    }

    #[test]
    fn missing_key_material_is_config_error() {
        let err = JwtValidator::from_config(&JwtConfig::default()).unwrap_err();
        assert!(matches!(err, ApiError::Configuration(_)));
    }
}
