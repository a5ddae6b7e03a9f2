use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

/// The authenticated caller, as extracted by the security layer.
#[derive(Clone, Debug, Serialize)]
pub struct Principal {
    /// Unique caller identifier (Basic username or JWT `sub`).
    pub id: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    /// Raw claims for advanced template access; `{}` for Basic auth.
    pub claims: Value,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }
}

/// Cache metadata bound under `cache.*` during template expansion.
///
/// On the read path only the location fields are set; during a refresh the
/// snapshot and cursor fields carry the state the new snapshot is built
/// against.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheBindings {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub mode: String,
    pub snapshot_id: Option<i64>,
    pub snapshot_timestamp: Option<String>,
    pub previous_snapshot_id: Option<i64>,
    pub previous_snapshot_timestamp: Option<String>,
    pub cursor_column: Option<String>,
    pub cursor_type: Option<String>,
    /// Last committed cursor high-water mark, rendered as a SQL-comparable
    /// literal.
    pub cursor_value: Option<String>,
    pub primary_keys: Vec<String>,
}

impl CacheBindings {
    /// Dotted `catalog.schema.table` with empty components skipped, for
    /// templates that reference the cache table as one name.
    pub fn qualified_table(&self) -> String {
        [&self.catalog, &self.schema, &self.table]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    fn to_bindings(&self) -> Value {
        json!({
            "catalog": self.catalog,
            "schema": self.schema,
            "table": self.table,
            "fullTable": self.qualified_table(),
            "mode": self.mode,
            "snapshotId": self.snapshot_id,
            "snapshotTimestamp": self.snapshot_timestamp,
            "previousSnapshotId": self.previous_snapshot_id,
            "previousSnapshotTimestamp": self.previous_snapshot_timestamp,
            "cursorColumn": self.cursor_column,
            "cursorType": self.cursor_type,
            "cursorValue": self.cursor_value,
            "primaryKeys": self.primary_keys,
        })
    }
}

/// Per-request value bag, built by the handler and consumed by the
/// template expander. Stack-scoped to one request (or one cache refresh).
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Validated, type-coerced parameters.
    pub params: Map<String, Value>,
    /// Primary connection properties.
    pub conn: BTreeMap<String, String>,
    /// Authenticated principal, when the endpoint has an auth block.
    pub user: Option<Principal>,
    /// Allow-listed environment subset.
    pub env: BTreeMap<String, String>,
    pub cache: Option<CacheBindings>,
}

impl RequestContext {
    /// Assemble the template binding tree: `params.*`, `conn.*`,
    /// `context.user.*`, `env.*`, `cache.*`.
    pub fn bindings(&self) -> Value {
        let mut root = Map::new();
        root.insert("params".into(), Value::Object(self.params.clone()));
        root.insert(
            "conn".into(),
            Value::Object(
                self.conn
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        let context = match &self.user {
            Some(user) => json!({
                "user": {
                    "id": user.id,
                    "email": user.email,
                    "roles": user.roles,
                }
            }),
            None => json!({}),
        };
        root.insert("context".into(), context);
        root.insert(
            "env".into(),
            Value::Object(
                self.env
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        if let Some(cache) = &self.cache {
            root.insert("cache".into(), cache.to_bindings());
        }
        Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_expose_all_scopes() {
        let mut ctx = RequestContext::default();
        ctx.params.insert("id".into(), json!(7));
        ctx.conn.insert("path".into(), "data/customers.parquet".into());
        ctx.env.insert("REGION".into(), "eu-west-1".into());
        ctx.user = Some(Principal {
            id: "admin".into(),
            email: None,
            roles: vec!["admin".into()],
            claims: json!({}),
        });

        let bindings = ctx.bindings();
        assert_eq!(bindings["params"]["id"], json!(7));
        assert_eq!(bindings["conn"]["path"], "data/customers.parquet");
        assert_eq!(bindings["context"]["user"]["id"], "admin");
        assert_eq!(bindings["env"]["REGION"], "eu-west-1");
        assert!(bindings.get("cache").is_none());
    }

    #[test]
    fn cache_bindings_qualified_table() {
        let cache = CacheBindings {
            catalog: "lake".into(),
            schema: "analytics".into(),
            table: "customers_cache".into(),
            mode: "full".into(),
            ..Default::default()
        };
        assert_eq!(cache.qualified_table(), "lake.analytics.customers_cache");

        let bare = CacheBindings {
            table: "t".into(),
            ..Default::default()
        };
        assert_eq!(bare.qualified_table(), "t");
    }

    #[test]
    fn anonymous_context_has_no_user() {
        let ctx = RequestContext::default();
        let bindings = ctx.bindings();
        assert!(bindings["context"].get("user").is_none());
    }

    #[test]
    fn principal_role_checks() {
        let p = Principal {
            id: "u".into(),
            email: None,
            roles: vec!["reader".into()],
            claims: json!({}),
        };
        assert!(p.has_role("reader"));
        assert!(!p.has_role("writer"));
        assert!(p.has_any_role(&["writer".to_string(), "reader".to_string()]));
    }
}
