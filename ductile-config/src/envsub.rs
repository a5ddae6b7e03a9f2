//! `${NAME}` substitution against the project's environment allowlist.
//!
//! Only variables whose names match one of the allowlist patterns are
//! replaced; unmatched references stay literal and are logged.

use regex::Regex;
use std::collections::BTreeMap;

use crate::error::ConfigError;

/// Compiled environment-variable allowlist.
#[derive(Debug, Clone, Default)]
pub struct EnvAllowlist {
    patterns: Vec<Regex>,
}

impl EnvAllowlist {
    pub fn compile(patterns: &[String]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("^(?:{p})$")).map_err(|e| {
                    ConfigError::invalid(None, format!("bad environment-whitelist pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }

    /// The allow-listed subset of the current process environment, for the
    /// `env.*` template scope.
    pub fn environment(&self) -> BTreeMap<String, String> {
        std::env::vars()
            .filter(|(name, _)| self.matches(name))
            .collect()
    }
}

/// Replace `${NAME}` references in one string. Allow-listed names resolve
/// from the process environment; everything else is left literal.
pub fn substitute_str(value: &str, allowlist: &EnvAllowlist) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if allowlist.matches(name) {
                    match std::env::var(name) {
                        Ok(resolved) => out.push_str(&resolved),
                        Err(_) => {
                            tracing::warn!(name, "allow-listed environment variable is unset");
                            out.push_str(&rest[start..start + 2 + end + 1]);
                        }
                    }
                } else {
                    tracing::warn!(name, "environment variable not in whitelist, left literal");
                    out.push_str(&rest[start..start + 2 + end + 1]);
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference: keep as-is.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Walk a YAML document, substituting in every string value.
pub fn substitute_value(value: &mut serde_yaml::Value, allowlist: &EnvAllowlist) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${") {
                *s = substitute_str(s, allowlist);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                substitute_value(item, allowlist);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, allowlist);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(patterns: &[&str]) -> EnvAllowlist {
        EnvAllowlist::compile(&patterns.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .unwrap()
    }

    #[test]
    fn allowlisted_variable_is_substituted() {
        std::env::set_var("DUCTILE_TEST_REGION", "eu-west-1");
        let list = allow(&["DUCTILE_TEST_.*"]);
        assert_eq!(
            substitute_str("region=${DUCTILE_TEST_REGION}", &list),
            "region=eu-west-1"
        );
    }

    #[test]
    fn non_allowlisted_reference_stays_literal() {
        std::env::set_var("SECRET_TOKEN", "hunter2");
        let list = allow(&["DUCTILE_.*"]);
        assert_eq!(
            substitute_str("token=${SECRET_TOKEN}", &list),
            "token=${SECRET_TOKEN}"
        );
    }

    #[test]
    fn unterminated_reference_is_preserved() {
        let list = allow(&[".*"]);
        assert_eq!(substitute_str("broken ${NAME", &list), "broken ${NAME");
    }

    #[test]
    fn multiple_references_in_one_value() {
        std::env::set_var("DUCTILE_A", "1");
        std::env::set_var("DUCTILE_B", "2");
        let list = allow(&["DUCTILE_[AB]"]);
        assert_eq!(substitute_str("${DUCTILE_A}-${DUCTILE_B}", &list), "1-2");
    }

    #[test]
    fn patterns_are_anchored() {
        std::env::set_var("XDUCTILE_A", "nope");
        let list = allow(&["DUCTILE_A"]);
        assert!(!list.matches("XDUCTILE_A"));
        assert!(!list.matches("DUCTILE_AB"));
        assert!(list.matches("DUCTILE_A"));
    }

    #[test]
    fn yaml_walk_substitutes_nested_values() {
        std::env::set_var("DUCTILE_PATH", "/data");
        let list = allow(&["DUCTILE_PATH"]);
        let mut doc: serde_yaml::Value = serde_yaml::from_str(
            "connections:\n  main:\n    properties:\n      path: '${DUCTILE_PATH}/x.parquet'\n",
        )
        .unwrap();
        substitute_value(&mut doc, &list);
        let path = &doc["connections"]["main"]["properties"]["path"];
        assert_eq!(path.as_str().unwrap(), "/data/x.parquet");
    }
}
