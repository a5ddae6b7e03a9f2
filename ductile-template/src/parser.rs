//! Template parsing: text is split into a node list on `{{ ... }}` tags.
//!
//! Supported tags: `{{ var }}`, `{{{ var }}}`, `{{#section}}`,
//! `{{^inverted}}`, `{{/close}}`, `{{! comment }}`, `{{> partial}}`.

use crate::TemplateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    /// `{{ var }}` — scalar output, meant for numeric contexts.
    Variable(String),
    /// `{{{ var }}}` — raw output, meant for quoted string contexts.
    Raw(String),
    /// `{{#name}} ... {{/name}}`
    Section { name: String, children: Vec<Node> },
    /// `{{^name}} ... {{/name}}`
    Inverted { name: String, children: Vec<Node> },
    /// `{{> name}}`
    Partial(String),
}

/// A parsed template, ready for repeated rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub nodes: Vec<Node>,
}

enum Tag {
    Variable(String),
    Raw(String),
    SectionOpen(String),
    InvertedOpen(String),
    Close(String),
    Comment,
    Partial(String),
}

pub fn parse(input: &str) -> Result<Template, TemplateError> {
    let mut nodes = Vec::new();
    // Stack of open sections: (name, inverted, children-so-far).
    let mut stack: Vec<(String, bool, Vec<Node>)> = Vec::new();
    let mut rest = input;

    loop {
        let Some(start) = rest.find("{{") else {
            push_text(&mut nodes, &mut stack, rest);
            break;
        };
        push_text(&mut nodes, &mut stack, &rest[..start]);
        let after = &rest[start..];

        let (tag, consumed) = read_tag(after)?;
        rest = &after[consumed..];

        match tag {
            Tag::Variable(name) => push_node(&mut nodes, &mut stack, Node::Variable(name)),
            Tag::Raw(name) => push_node(&mut nodes, &mut stack, Node::Raw(name)),
            Tag::Partial(name) => push_node(&mut nodes, &mut stack, Node::Partial(name)),
            Tag::Comment => {}
            Tag::SectionOpen(name) => stack.push((name, false, Vec::new())),
            Tag::InvertedOpen(name) => stack.push((name, true, Vec::new())),
            Tag::Close(name) => {
                let Some((open_name, inverted, children)) = stack.pop() else {
                    return Err(TemplateError::Parse(format!(
                        "closing tag {{{{/{name}}}}} without an open section"
                    )));
                };
                if open_name != name {
                    return Err(TemplateError::Parse(format!(
                        "section {{{{#{open_name}}}}} closed by {{{{/{name}}}}}"
                    )));
                }
                let node = if inverted {
                    Node::Inverted {
                        name: open_name,
                        children,
                    }
                } else {
                    Node::Section {
                        name: open_name,
                        children,
                    }
                };
                push_node(&mut nodes, &mut stack, node);
            }
        }
    }

    if let Some((name, _, _)) = stack.pop() {
        return Err(TemplateError::Parse(format!(
            "unclosed section {{{{#{name}}}}}"
        )));
    }
    Ok(Template { nodes })
}

/// Read one tag starting at `{{`. Returns the tag and the bytes consumed.
fn read_tag(input: &str) -> Result<(Tag, usize), TemplateError> {
    if let Some(body_start) = input.strip_prefix("{{{") {
        let end = body_start.find("}}}").ok_or_else(|| {
            TemplateError::Parse("unterminated {{{ tag".to_string())
        })?;
        let name = body_start[..end].trim().to_string();
        if name.is_empty() {
            return Err(TemplateError::Parse("empty {{{ }}} tag".to_string()));
        }
        return Ok((Tag::Raw(name), 3 + end + 3));
    }

    let body_start = &input[2..];
    let end = body_start
        .find("}}")
        .ok_or_else(|| TemplateError::Parse("unterminated {{ tag".to_string()))?;
    let body = body_start[..end].trim();
    let consumed = 2 + end + 2;

    let tag = if let Some(name) = body.strip_prefix('#') {
        Tag::SectionOpen(name.trim().to_string())
    } else if let Some(name) = body.strip_prefix('^') {
        Tag::InvertedOpen(name.trim().to_string())
    } else if let Some(name) = body.strip_prefix('/') {
        Tag::Close(name.trim().to_string())
    } else if body.starts_with('!') {
        Tag::Comment
    } else if let Some(name) = body.strip_prefix('>') {
        Tag::Partial(name.trim().to_string())
    } else if body.is_empty() {
        return Err(TemplateError::Parse("empty {{ }} tag".to_string()));
    } else {
        Tag::Variable(body.to_string())
    };
    Ok((tag, consumed))
}

fn push_text(nodes: &mut Vec<Node>, stack: &mut [(String, bool, Vec<Node>)], text: &str) {
    if text.is_empty() {
        return;
    }
    let node = Node::Text(text.to_string());
    match stack.last_mut() {
        Some((_, _, children)) => children.push(node),
        None => nodes.push(node),
    }
}

fn push_node(nodes: &mut Vec<Node>, stack: &mut [(String, bool, Vec<Node>)], node: Node) {
    match stack.last_mut() {
        Some((_, _, children)) => children.push(node),
        None => nodes.push(node),
    }
}
