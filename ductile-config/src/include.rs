//! Descriptor composition: `{include:<section> from <relative-path>}`.
//!
//! The directive copies the named top-level section out of the referenced
//! document. It can appear in two positions:
//!
//! - as a string value: the value is replaced wholesale by the section;
//! - as a key of a mapping (with a null value): the section, which must
//!   itself be a mapping, is merged into the surrounding mapping with
//!   locally defined keys winning.
//!
//! Paths resolve relative to the including file. Included documents may
//! include further; cycles are errors. A variant section is selected by
//! naming it outright (`auth-dev` instead of `auth`).

use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::error::ConfigError;

/// A parsed include directive.
struct Directive {
    section: String,
    path: String,
}

fn parse_directive(raw: &str) -> Option<Directive> {
    let inner = raw.strip_prefix("{include:")?.strip_suffix('}')?;
    let (section, path) = inner.split_once(" from ")?;
    let section = section.trim();
    let path = path.trim();
    if section.is_empty() || path.is_empty() {
        return None;
    }
    Some(Directive {
        section: section.to_string(),
        path: path.to_string(),
    })
}

/// Resolve every include directive in `doc`, which was read from `file`.
pub fn resolve_includes(doc: &mut Value, file: &Path) -> Result<(), ConfigError> {
    let mut stack = vec![canonical(file)];
    resolve_value(doc, file, &mut stack)
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn load_section(
    directive: &Directive,
    including_file: &Path,
    stack: &mut Vec<PathBuf>,
) -> Result<Value, ConfigError> {
    let base = including_file.parent().unwrap_or_else(|| Path::new("."));
    let target = base.join(&directive.path);
    let canon = canonical(&target);
    if stack.contains(&canon) {
        return Err(ConfigError::Include {
            file: including_file.display().to_string(),
            message: format!("include cycle through {}", target.display()),
        });
    }

    let content = std::fs::read_to_string(&target).map_err(|e| ConfigError::Include {
        file: including_file.display().to_string(),
        message: format!("cannot read {}: {e}", target.display()),
    })?;
    let mut doc: Value = serde_yaml::from_str(&content).map_err(|e| ConfigError::Include {
        file: target.display().to_string(),
        message: format!("invalid YAML: {e}"),
    })?;

    stack.push(canon);
    resolve_value(&mut doc, &target, stack)?;
    stack.pop();

    doc.get(directive.section.as_str())
        .cloned()
        .ok_or_else(|| ConfigError::Include {
            file: including_file.display().to_string(),
            message: format!(
                "section {:?} not found in {}",
                directive.section,
                target.display()
            ),
        })
}

fn resolve_value(
    value: &mut Value,
    file: &Path,
    stack: &mut Vec<PathBuf>,
) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if let Some(directive) = parse_directive(s) {
                *value = load_section(&directive, file, stack)?;
            }
        }
        Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                resolve_value(item, file, stack)?;
            }
        }
        Value::Mapping(map) => {
            // Key-position directives first, so that sibling keys override
            // what they pull in.
            let directive_keys: Vec<Value> = map
                .keys()
                .filter(|k| {
                    k.as_str()
                        .map(|s| parse_directive(s).is_some())
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            for key in directive_keys {
                map.remove(&key);
                let directive = parse_directive(key.as_str().unwrap())
                    .expect("filtered above");
                let section = load_section(&directive, file, stack)?;
                let Value::Mapping(section) = section else {
                    return Err(ConfigError::Include {
                        file: file.display().to_string(),
                        message: format!(
                            "section {:?} is not a mapping and cannot be merged",
                            directive.section
                        ),
                    });
                };
                for (k, v) in section {
                    if !map.contains_key(&k) {
                        map.insert(k, v);
                    }
                }
            }
            for (_, v) in map.iter_mut() {
                resolve_value(v, file, stack)?;
            }
        }
        _ => {}
    }
    Ok(())
}
