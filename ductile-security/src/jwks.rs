//! JWKS fetching and key caching for bearer endpoints configured with a
//! `jwks-url` instead of a shared secret.

use std::collections::HashMap;

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// Cache of decoding keys by `kid`, refetched when an unknown key id shows
/// up (key rotation).
pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Get the decoding key for a `kid`, refreshing the set once when the
    /// id is unknown.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, String> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Ok(key.clone());
        }
        self.refresh().await?;
        self.keys
            .read()
            .await
            .get(kid)
            .cloned()
            .ok_or_else(|| format!("unknown signing key {kid:?}"))
    }

    async fn refresh(&self) -> Result<(), String> {
        debug!(url = %self.url, "fetching JWKS");
        let document: JwksDocument = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| format!("JWKS fetch failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("JWKS parse failed: {e}"))?;

        let mut keys = self.keys.write().await;
        keys.clear();
        for jwk in document.keys {
            let Some(kid) = jwk.kid.clone() else {
                continue;
            };
            match build_key(&jwk) {
                Some(key) => {
                    keys.insert(kid, key);
                }
                None => warn!(kid = %kid, kty = %jwk.kty, "unsupported JWK skipped"),
            }
        }
        debug!(count = keys.len(), "JWKS cache refreshed");
        Ok(())
    }
}

fn build_key(jwk: &Jwk) -> Option<DecodingKey> {
    if jwk.kty != "RSA" {
        return None;
    }
    let n = jwk.n.as_deref()?;
    let e = jwk.e.as_deref()?;
    DecodingKey::from_rsa_components(n, e).ok()
}
