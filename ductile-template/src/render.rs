//! Rendering: walk the node list against a JSON binding tree.
//!
//! Undefined variables expand to the empty string; sections treat
//! undefined guards as falsy. Truthiness: non-empty string, non-zero
//! number, `true`, non-empty list, or present object.

use serde_json::Value;

use crate::parser::{parse, Node, Template};
use crate::{PartialLoader, TemplateError};

/// Partial expansion depth bound; past it the template is cyclic.
const MAX_PARTIAL_DEPTH: usize = 16;

pub struct Expander<'a> {
    partials: Option<&'a dyn PartialLoader>,
}

impl<'a> Expander<'a> {
    pub fn new() -> Self {
        Self { partials: None }
    }

    pub fn with_partials(partials: &'a dyn PartialLoader) -> Self {
        Self {
            partials: Some(partials),
        }
    }

    /// Expand a template source against the binding tree.
    pub fn expand(&self, source: &str, bindings: &Value) -> Result<String, TemplateError> {
        let template = parse(source)?;
        self.render(&template, bindings)
    }

    pub fn render(&self, template: &Template, bindings: &Value) -> Result<String, TemplateError> {
        let mut out = String::new();
        self.render_nodes(&template.nodes, bindings, &mut out, 0)?;
        Ok(out)
    }

    fn render_nodes(
        &self,
        nodes: &[Node],
        bindings: &Value,
        out: &mut String,
        depth: usize,
    ) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Variable(name) | Node::Raw(name) => {
                    out.push_str(&scalar(lookup(bindings, name)));
                }
                Node::Section { name, children } => {
                    if truthy(lookup(bindings, name)) {
                        self.render_nodes(children, bindings, out, depth)?;
                    }
                }
                Node::Inverted { name, children } => {
                    if !truthy(lookup(bindings, name)) {
                        self.render_nodes(children, bindings, out, depth)?;
                    }
                }
                Node::Partial(name) => {
                    if depth >= MAX_PARTIAL_DEPTH {
                        return Err(TemplateError::Parse(format!(
                            "partial {name:?} exceeds maximum nesting depth"
                        )));
                    }
                    let Some(partials) = self.partials else {
                        return Err(TemplateError::PartialNotFound(name.clone()));
                    };
                    let source = partials.load(name)?;
                    let template = parse(&source)?;
                    self.render_nodes(&template.nodes, bindings, out, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Expander<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a dotted name (`params.id`) in the binding tree.
fn lookup<'v>(bindings: &'v Value, name: &str) -> Option<&'v Value> {
    let mut current = bindings;
    for part in name.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

fn scalar(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        // Lists and objects rarely end up in output position; JSON is the
        // only faithful text form they have.
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expand(source: &str, bindings: Value) -> String {
        Expander::new().expand(source, &bindings).unwrap()
    }

    #[test]
    fn variables_substitute_scalars() {
        let out = expand(
            "SELECT * FROM t WHERE id = {{ params.id }} AND name = '{{{ params.name }}}'",
            json!({"params": {"id": 7, "name": "O Brien"}}),
        );
        assert_eq!(out, "SELECT * FROM t WHERE id = 7 AND name = 'O Brien'");
    }

    #[test]
    fn undefined_variable_is_empty() {
        assert_eq!(expand("[{{ missing }}]", json!({})), "[]");
        assert_eq!(expand("[{{{ a.b.c }}}]", json!({"a": 1})), "[]");
    }

    #[test]
    fn sections_guard_on_truthiness() {
        let source = "SELECT 1{{#params.id}} WHERE id = {{ params.id }}{{/params.id}}";
        assert_eq!(
            expand(source, json!({"params": {"id": 3}})),
            "SELECT 1 WHERE id = 3"
        );
        assert_eq!(expand(source, json!({"params": {}})), "SELECT 1");
        assert_eq!(expand(source, json!({"params": {"id": 0}})), "SELECT 1");
        assert_eq!(expand(source, json!({"params": {"id": ""}})), "SELECT 1");
    }

    #[test]
    fn inverted_sections() {
        let source = "{{^params.segment}}WHERE 1=1{{/params.segment}}";
        assert_eq!(expand(source, json!({})), "WHERE 1=1");
        assert_eq!(
            expand(source, json!({"params": {"segment": "BUILDING"}})),
            ""
        );
    }

    #[test]
    fn empty_list_is_falsy_and_object_truthy() {
        let source = "{{#v}}yes{{/v}}{{^v}}no{{/v}}";
        assert_eq!(expand(source, json!({"v": []})), "no");
        assert_eq!(expand(source, json!({"v": [1]})), "yes");
        assert_eq!(expand(source, json!({"v": {}})), "yes");
        assert_eq!(expand(source, json!({"v": null})), "no");
        assert_eq!(expand(source, json!({"v": false})), "no");
    }

    #[test]
    fn expansion_with_no_bindings_strips_all_guards() {
        let source = "SELECT * FROM t {{#p.a}}WHERE a={{p.a}}{{/p.a}}{{! note }} ORDER BY 1";
        let out = expand(source, json!({}));
        assert_eq!(out, "SELECT * FROM t  ORDER BY 1");
        // Idempotent: expanding the output again changes nothing.
        assert_eq!(expand(&out, json!({})), out);
    }

    #[test]
    fn missing_partial_loader_is_an_error() {
        let err = Expander::new()
            .expand("{{> footer }}", &json!({}))
            .unwrap_err();
        assert!(matches!(err, TemplateError::PartialNotFound(_)));
    }
}
