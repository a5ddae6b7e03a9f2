//! Project loading: parse the root descriptor, scan the template root for
//! endpoint documents, and validate structure. Reloads re-parse a single
//! descriptor in isolation so a bad edit never takes down the registry.

use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::envsub::{substitute_value, EnvAllowlist};
use crate::error::ConfigError;
use crate::include::resolve_includes;
use crate::model::{EndpointConfig, ProjectConfig, ValidatorSpec};
use crate::registry::{EndpointEntry, EndpointRegistry};

/// Result of a full project load. Per-endpoint structural violations are
/// collected rather than aborting the scan, so one bad descriptor does not
/// hide the rest; callers decide whether any error is fatal.
pub struct LoadOutcome {
    pub registry: EndpointRegistry,
    pub errors: Vec<ConfigError>,
}

pub struct ConfigLoader {
    root_file: PathBuf,
    project: ProjectConfig,
    template_root: PathBuf,
    allowlist: EnvAllowlist,
}

impl ConfigLoader {
    /// Parse the project descriptor. Fails on unreadable or structurally
    /// invalid project files; endpoint problems are reported by [`Self::scan`].
    pub fn new(root_file: &Path) -> Result<Self, ConfigError> {
        let display = root_file.display().to_string();
        let content = std::fs::read_to_string(root_file)
            .map_err(|e| ConfigError::load(Some(display.clone()), e.to_string()))?;
        let mut doc: Value = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::load(Some(display.clone()), e.to_string()))?;
        resolve_includes(&mut doc, root_file)?;

        // The allowlist lives inside the document, so it is read from the
        // raw tree before substitution runs over the same tree.
        let patterns = doc
            .get("template")
            .and_then(|t| {
                t.get("environment-whitelist")
                    .or_else(|| t.get("environment_whitelist"))
            })
            .and_then(|v| serde_yaml::from_value::<Vec<String>>(v.clone()).ok())
            .unwrap_or_default();
        let allowlist = EnvAllowlist::compile(&patterns)?;
        substitute_value(&mut doc, &allowlist);

        let project: ProjectConfig = serde_yaml::from_value(doc)
            .map_err(|e| ConfigError::invalid(Some(display), e.to_string()))?;

        let base = root_file.parent().unwrap_or_else(|| Path::new("."));
        let template_root = base.join(&project.template.path);

        Ok(Self {
            root_file: root_file.to_path_buf(),
            project,
            template_root,
            allowlist,
        })
    }

    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    pub fn root_file(&self) -> &Path {
        &self.root_file
    }

    pub fn template_root(&self) -> &Path {
        &self.template_root
    }

    pub fn allowlist(&self) -> &EnvAllowlist {
        &self.allowlist
    }

    /// Scan the template root recursively. Every YAML document carrying a
    /// `url-path` or an MCP view is an endpoint descriptor; other YAML
    /// files are shared fragments (include targets) and SQL files are
    /// templates, both left to their consumers.
    pub fn scan(&self) -> LoadOutcome {
        let mut entries = Vec::new();
        let mut errors = Vec::new();
        let mut files = Vec::new();
        collect_yaml_files(&self.template_root, &mut files);
        files.sort();

        for file in files {
            match self.parse_endpoint_file(&file) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(err) => errors.push(err),
            }
        }

        tracing::info!(
            endpoints = entries.len(),
            errors = errors.len(),
            root = %self.template_root.display(),
            "endpoint scan complete"
        );
        LoadOutcome {
            registry: EndpointRegistry::new(entries),
            errors,
        }
    }

    /// Re-parse one descriptor for the live-edit surface. On error the
    /// caller keeps the old registry entry.
    pub fn reload_endpoint(&self, relative: &str) -> Result<EndpointEntry, ConfigError> {
        let file = self.template_root.join(relative);
        match self.parse_endpoint_file(&file)? {
            Some(entry) => Ok(entry),
            None => Err(ConfigError::invalid(
                Some(file.display().to_string()),
                "document has neither url-path nor an mcp view",
            )),
        }
    }

    /// Validate a descriptor document without touching the registry.
    pub fn validate_endpoint_value(&self, mut doc: Value) -> Result<EndpointConfig, ConfigError> {
        substitute_value(&mut doc, &self.allowlist);
        let endpoint: EndpointConfig = serde_yaml::from_value(doc)
            .map_err(|e| ConfigError::invalid(None, e.to_string()))?;
        let errors = check_endpoint(&endpoint, &self.project, None);
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(endpoint),
        }
    }

    fn parse_endpoint_file(&self, file: &Path) -> Result<Option<EndpointEntry>, ConfigError> {
        let display = file.display().to_string();
        let content = std::fs::read_to_string(file)
            .map_err(|e| ConfigError::load(Some(display.clone()), e.to_string()))?;
        let mut doc: Value = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::load(Some(display.clone()), e.to_string()))?;

        if !is_endpoint_document(&doc) {
            return Ok(None);
        }

        resolve_includes(&mut doc, file)?;
        substitute_value(&mut doc, &self.allowlist);
        let endpoint: EndpointConfig = serde_yaml::from_value(doc)
            .map_err(|e| ConfigError::invalid(Some(display.clone()), e.to_string()))?;

        let errors = check_endpoint(&endpoint, &self.project, Some(&display));
        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }

        let relative = file
            .strip_prefix(&self.template_root)
            .map(|p| p.display().to_string())
            .ok();
        Ok(Some(EndpointEntry::new(endpoint, relative)))
    }
}

fn is_endpoint_document(doc: &Value) -> bool {
    let Value::Mapping(map) = doc else {
        return false;
    };
    ["url-path", "url_path", "mcp-tool", "mcp_tool", "mcp-resource", "mcp_resource", "mcp-prompt", "mcp_prompt"]
        .iter()
        .any(|key| map.contains_key(&Value::String((*key).to_string())))
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(&path, out);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
}

/// Structural validation of one endpoint descriptor.
pub fn check_endpoint(
    endpoint: &EndpointConfig,
    project: &ProjectConfig,
    file: Option<&str>,
) -> Vec<ConfigError> {
    let file = file.map(str::to_string);
    let mut errors = Vec::new();
    let mut invalid = |message: String| {
        errors.push(ConfigError::Invalid {
            file: file.clone(),
            message,
        });
    };

    // Parameter names are unique.
    for (i, param) in endpoint.request.iter().enumerate() {
        if endpoint.request[..i].iter().any(|p| p.name == param.name) {
            invalid(format!("duplicate parameter {:?}", param.name));
        }
    }

    // Declared path params appear in the url-path.
    let path_segments: Vec<&str> = endpoint
        .url_path
        .as_deref()
        .map(|p| {
            p.split('/')
                .filter_map(|s| s.strip_prefix(':'))
                .collect()
        })
        .unwrap_or_default();
    for param in &endpoint.request {
        if param.location == crate::model::ParamLocation::Path
            && !path_segments.contains(&param.name.as_str())
        {
            invalid(format!(
                "path parameter {:?} does not appear in url-path",
                param.name
            ));
        }
    }

    // Validators are well-formed.
    for param in &endpoint.request {
        for validator in &param.validators {
            if let Some(message) = check_validator(validator) {
                invalid(format!("parameter {:?}: {message}", param.name));
            }
        }
    }

    // Prompts are template-only; everything else executes SQL and needs a
    // connection and a template.
    let is_prompt_only = endpoint.mcp_prompt.is_some()
        && endpoint.url_path.is_none()
        && endpoint.mcp_tool.is_none()
        && endpoint.mcp_resource.is_none();
    if !is_prompt_only {
        if endpoint.connection.is_empty() {
            invalid("endpoint declares no connection".to_string());
        }
        for name in &endpoint.connection {
            if !project.connections.contains_key(name) {
                invalid(format!("unknown connection {name:?}"));
            }
        }
        if endpoint.template_source.is_none() && endpoint.template.is_none() {
            invalid("endpoint has neither template-source nor inline template".to_string());
        }
    }

    if let Some(cache) = &endpoint.cache {
        if cache.enabled {
            if cache.table.is_empty() {
                invalid("cache.table must not be empty".to_string());
            }
            if cache.template_file.is_none() {
                invalid("cache.template-file is required when cache is enabled".to_string());
            }
            if endpoint.primary_connection().is_none() {
                invalid("cached endpoint needs a primary connection".to_string());
            }
        }
    }

    errors
}

fn check_validator(spec: &ValidatorSpec) -> Option<String> {
    match spec {
        ValidatorSpec::Int { min, max } => match (min, max) {
            (Some(min), Some(max)) if min > max => {
                Some(format!("int validator min {min} exceeds max {max}"))
            }
            _ => None,
        },
        ValidatorSpec::String { regex, .. } => regex.as_deref().and_then(|pattern| {
            regex::Regex::new(pattern)
                .err()
                .map(|e| format!("invalid regex {pattern:?}: {e}"))
        }),
        ValidatorSpec::Enum { allowed_values } => {
            allowed_values.is_empty().then(|| "enum validator has no allowed values".to_string())
        }
        ValidatorSpec::Date { min, max } => [min, max]
            .into_iter()
            .flatten()
            .find(|bound| chrono::NaiveDate::parse_from_str(bound, "%Y-%m-%d").is_err())
            .map(|bound| format!("invalid date bound {bound:?}")),
        ValidatorSpec::Time { min, max } => [min, max]
            .into_iter()
            .flatten()
            .find(|bound| chrono::NaiveTime::parse_from_str(bound, "%H:%M:%S").is_err())
            .map(|bound| format!("invalid time bound {bound:?}")),
        ValidatorSpec::Email | ValidatorSpec::Uuid | ValidatorSpec::Bool => None,
    }
}
