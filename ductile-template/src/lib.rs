//! Mustache-style template expansion for SQL templates.
//!
//! The syntax is deliberately bounded: `{{ var }}` and `{{{ var }}}`
//! output, `{{#s}}`/`{{^s}}` sections, `{{! }}` comments, and
//! `{{> partial}}` inclusion from a fixed root directory. Bindings come in
//! as one JSON tree (`params.*`, `conn.*`, `context.*`, `env.*`,
//! `cache.*`); there is no logic beyond truthiness.
//!
//! Expansion does not escape quotes. User-controlled strings reach SQL
//! literal position only through `{{{ }}}` inside quotes written by the
//! template author, and only after the validator's injection screening.

mod parser;
mod render;

use std::path::{Component, Path, PathBuf};

use ductile_core::ApiError;

pub use parser::{parse, Node, Template};
pub use render::Expander;

#[derive(Debug)]
pub enum TemplateError {
    Parse(String),
    PartialNotFound(String),
    /// Partial name escapes the template root.
    PartialTraversal(String),
    Io(String),
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Parse(msg) => write!(f, "template parse error: {msg}"),
            TemplateError::PartialNotFound(name) => write!(f, "partial not found: {name}"),
            TemplateError::PartialTraversal(name) => {
                write!(f, "partial name escapes template root: {name}")
            }
            TemplateError::Io(msg) => write!(f, "template I/O error: {msg}"),
        }
    }
}

impl std::error::Error for TemplateError {}

impl From<TemplateError> for ApiError {
    fn from(err: TemplateError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

/// Source of `{{> partial}}` bodies.
pub trait PartialLoader {
    fn load(&self, name: &str) -> Result<String, TemplateError>;
}

/// Loads partials (and endpoint templates) from files beneath the template
/// root. Names may use subdirectories but never `..` or absolute paths;
/// a name without an extension gets `.sql` appended.
pub struct TemplateDir {
    root: PathBuf,
}

impl TemplateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a template name to a path inside the root.
    fn resolve(&self, name: &str) -> Result<PathBuf, TemplateError> {
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(TemplateError::PartialTraversal(name.to_string()));
        }
        let mut path = self.root.join(relative);
        if path.extension().is_none() {
            path.set_extension("sql");
        }
        Ok(path)
    }

    /// Read a template source by name.
    pub fn read(&self, name: &str) -> Result<String, TemplateError> {
        let path = self.resolve(name)?;
        std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TemplateError::PartialNotFound(name.to_string())
            } else {
                TemplateError::Io(format!("{}: {e}", path.display()))
            }
        })
    }
}

impl PartialLoader for TemplateDir {
    fn load(&self, name: &str) -> Result<String, TemplateError> {
        self.read(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partials_load_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("where.sql"), "WHERE id = {{ params.id }}").unwrap();
        std::fs::write(
            dir.path().join("main.sql"),
            "SELECT * FROM t {{> where }}",
        )
        .unwrap();

        let templates = TemplateDir::new(dir.path());
        let source = templates.read("main").unwrap();
        let out = Expander::with_partials(&templates)
            .expand(&source, &json!({"params": {"id": 5}}))
            .unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE id = 5");
    }

    #[test]
    fn partials_in_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();
        std::fs::write(dir.path().join("shared/footer.sql"), "LIMIT 10").unwrap();

        let templates = TemplateDir::new(dir.path());
        let out = Expander::with_partials(&templates)
            .expand("SELECT 1 {{> shared/footer }}", &json!({}))
            .unwrap();
        assert_eq!(out, "SELECT 1 LIMIT 10");
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let templates = TemplateDir::new(dir.path());
        let err = templates.read("../outside").unwrap_err();
        assert!(matches!(err, TemplateError::PartialTraversal(_)));
    }

    #[test]
    fn missing_partial_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let templates = TemplateDir::new(dir.path());
        assert!(matches!(
            templates.read("absent"),
            Err(TemplateError::PartialNotFound(_))
        ));
    }

    #[test]
    fn recursive_partials_hit_depth_bound() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loop.sql"), "{{> loop }}").unwrap();
        let templates = TemplateDir::new(dir.path());
        let err = Expander::with_partials(&templates)
            .expand("{{> loop }}", &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("nesting depth"));
    }
}
