//! Basic authentication against an in-config user table.
//!
//! Password entries are either plain text or `sha256:<hex>` digests. The
//! user table may also be loaded from a YAML file at startup; a fetch
//! failure marks the auth block unavailable without crashing the process.

use base64::Engine as _;
use ductile_core::{ApiError, Principal};
use ductile_config::AuthUser;
use sha2::{Digest, Sha256};

/// Decode the `Authorization: Basic ...` header into (username, password).
pub fn parse_basic_header(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ").or_else(|| header.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn password_matches(supplied: &str, stored: &str) -> bool {
    match stored.strip_prefix("sha256:") {
        Some(digest) => {
            let hashed = Sha256::digest(supplied.as_bytes());
            let hex: String = hashed.iter().map(|b| format!("{b:02x}")).collect();
            // Digest comparison; both sides are fixed-length hex.
            hex.eq_ignore_ascii_case(digest)
        }
        None => supplied == stored,
    }
}

/// Check credentials against the user table, producing the principal.
pub fn authenticate_basic(
    users: &[AuthUser],
    header: Option<&str>,
) -> Result<Principal, ApiError> {
    let header =
        header.ok_or_else(|| ApiError::Authentication("Missing Authorization header".into()))?;
    let (username, password) = parse_basic_header(header)
        .ok_or_else(|| ApiError::Authentication("Malformed Basic credentials".into()))?;

    let user = users
        .iter()
        .find(|u| u.username == username)
        .filter(|u| password_matches(&password, &u.password))
        .ok_or_else(|| ApiError::Authentication("Invalid username or password".into()))?;

    Ok(Principal {
        id: user.username.clone(),
        email: None,
        roles: user.roles.clone(),
        claims: serde_json::json!({}),
    })
}

/// Load a user table from a YAML file (`users: [{username, password,
/// roles}]` or a bare list).
pub fn load_users_file(path: &str) -> Result<Vec<AuthUser>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| format!("{path}: {e}"))?;
    let users_value = doc.get("users").cloned().unwrap_or(doc);
    serde_yaml::from_value(users_value).map_err(|e| format!("{path}: {e}"))
}
