//! Template processing for prompts and code substitution
//!
//! Supports the substitution surface the handlers rely on:
//!
//! - `{{var}}`, `{{a.b.c}}`, `{{a[0]}}`, `{{a.b[1].c}}`
//! - `{{#if expr}}...{{/if}}` with the condition-expression language
//! - `{{#each list}}...{{/each}}` with `{{this}}` and item fields in scope
//!
//! Unknown variables render as empty strings and are reported in
//! `missing_keys`; a template without variables is returned unchanged.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::expr;

/// Outcome of one template render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateResult {
    pub content: String,
    pub missing_keys: Vec<String>,
    pub errors: Vec<String>,
}

/// Template port looked up from the service registry.
pub trait TemplateService: Send + Sync {
    fn process(&self, template: &str, values: &BTreeMap<String, Value>) -> TemplateResult;
}

/// The built-in regex-scanning template processor.
#[derive(Default)]
pub struct SimpleTemplateProcessor;

impl SimpleTemplateProcessor {
    pub fn new() -> Self {
        Self
    }
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("static regex"))
}

#[derive(Debug)]
enum Node {
    Text(String),
    Var(String),
    If { expr: String, body: Vec<Node> },
    Each { path: String, body: Vec<Node> },
}

#[derive(Debug)]
enum Tag {
    Var(String),
    IfStart(String),
    EachStart(String),
    IfEnd,
    EachEnd,
}

fn scan(template: &str) -> Vec<(Option<Tag>, String)> {
    // Returns alternating (tag, preceding-text) pairs; the final pair has no
    // tag and carries the trailing text.
    let re = tag_regex();
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let whole = caps.get(0).expect("match");
        let inner = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let text = template[last..whole.start()].to_string();
        last = whole.end();

        let tag = if let Some(rest) = inner.strip_prefix("#if ") {
            Tag::IfStart(rest.trim().to_string())
        } else if let Some(rest) = inner.strip_prefix("#each ") {
            Tag::EachStart(rest.trim().to_string())
        } else if inner == "/if" {
            Tag::IfEnd
        } else if inner == "/each" {
            Tag::EachEnd
        } else {
            Tag::Var(inner.to_string())
        };
        parts.push((Some(tag), text));
    }
    parts.push((None, template[last..].to_string()));
    parts
}

fn parse(template: &str) -> Result<Vec<Node>, String> {
    let parts = scan(template);
    let mut stack: Vec<Vec<Node>> = vec![Vec::new()];
    let mut open: Vec<Tag> = Vec::new();

    for (tag, text) in parts {
        if !text.is_empty() {
            stack.last_mut().expect("non-empty stack").push(Node::Text(text));
        }
        match tag {
            None => {}
            Some(Tag::Var(path)) => {
                stack.last_mut().expect("non-empty stack").push(Node::Var(path));
            }
            Some(tag @ (Tag::IfStart(_) | Tag::EachStart(_))) => {
                open.push(tag);
                stack.push(Vec::new());
            }
            Some(Tag::IfEnd) => {
                let body = stack.pop().ok_or("unbalanced {{/if}}")?;
                match open.pop() {
                    Some(Tag::IfStart(expr)) => stack
                        .last_mut()
                        .ok_or("unbalanced {{/if}}")?
                        .push(Node::If { expr, body }),
                    _ => return Err("{{/if}} without matching {{#if}}".to_string()),
                }
            }
            Some(Tag::EachEnd) => {
                let body = stack.pop().ok_or("unbalanced {{/each}}")?;
                match open.pop() {
                    Some(Tag::EachStart(path)) => stack
                        .last_mut()
                        .ok_or("unbalanced {{/each}}")?
                        .push(Node::Each { path, body }),
                    _ => return Err("{{/each}} without matching {{#each}}".to_string()),
                }
            }
        }
    }

    if !open.is_empty() {
        return Err("unterminated block tag".to_string());
    }
    Ok(stack.pop().unwrap_or_default())
}

/// Look up a dotted/indexed path (`a.b[1].c`) in a scope.
fn lookup(path: &str, scope: &BTreeMap<String, Value>) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let (name, indexes) = split_indexes(first);
    let mut current = scope.get(name)?.clone();
    current = apply_indexes(current, &indexes)?;

    for segment in segments {
        let (name, indexes) = split_indexes(segment);
        current = current.get(name)?.clone();
        current = apply_indexes(current, &indexes)?;
    }
    Some(current)
}

fn split_indexes(segment: &str) -> (&str, Vec<usize>) {
    match segment.find('[') {
        None => (segment, Vec::new()),
        Some(pos) => {
            let name = &segment[..pos];
            let indexes = segment[pos..]
                .trim_end_matches(']')
                .split("][")
                .filter_map(|part| part.trim_start_matches('[').trim_end_matches(']').parse().ok())
                .collect();
            (name, indexes)
        }
    }
}

fn apply_indexes(mut value: Value, indexes: &[usize]) -> Option<Value> {
    for idx in indexes {
        value = value.get(idx)?.clone();
    }
    Some(value)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render(nodes: &[Node], scope: &BTreeMap<String, Value>, result: &mut TemplateResult) {
    for node in nodes {
        match node {
            Node::Text(text) => result.content.push_str(text),
            Node::Var(path) => match lookup(path, scope) {
                Some(value) => result.content.push_str(&render_value(&value)),
                None => {
                    if !result.missing_keys.contains(path) {
                        result.missing_keys.push(path.clone());
                    }
                }
            },
            Node::If { expr: condition, body } => match expr::evaluate_bool(condition, scope) {
                Ok(true) => render(body, scope, result),
                Ok(false) => {}
                Err(e) => result.errors.push(format!("#if '{condition}': {e}")),
            },
            Node::Each { path, body } => {
                let Some(Value::Array(items)) = lookup(path, scope) else {
                    if !result.missing_keys.contains(path) {
                        result.missing_keys.push(path.clone());
                    }
                    continue;
                };
                for item in items {
                    let mut item_scope = scope.clone();
                    if let Value::Object(map) = &item {
                        for (k, v) in map {
                            item_scope.insert(k.clone(), v.clone());
                        }
                    }
                    item_scope.insert("this".to_string(), item.clone());
                    render(body, &item_scope, result);
                }
            }
        }
    }
}

impl TemplateService for SimpleTemplateProcessor {
    fn process(&self, template: &str, values: &BTreeMap<String, Value>) -> TemplateResult {
        let mut result = TemplateResult::default();
        match parse(template) {
            Ok(nodes) => render(&nodes, values, &mut result),
            Err(message) => {
                result.content = template.to_string();
                result.errors.push(message);
            }
        }
        result
    }
}

/// Build a template scope from a JSON object plus extra entries.
pub fn scope_from(inputs: &Value, extra: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut scope: BTreeMap<String, Value> = match inputs {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BTreeMap::new(),
    };
    for (k, v) in extra {
        scope.entry(k.clone()).or_insert_with(|| v.clone());
    }
    scope
}
