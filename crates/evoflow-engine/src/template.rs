//! Placeholder templates embedded in node inputs.
//!
//! A placeholder is `${...}` inside any JSON string. Two forms exist:
//!
//! - `${dependency_<id>}` or `${dependency_<id>.field.sub}` refers to the
//!   output of node `<id>` (or a field inside it).
//! - `${<key>}` refers to a key of the workflow's initial input.
//!
//! Parsing turns a string into [`Segment`]s once, so resolution can fail with
//! a precise, typed error instead of a generic interpolation failure.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const DEPENDENCY_PREFIX: &str = "dependency_";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"))
}

/// Whether `${dependency_<id>}` can name this node id unambiguously.
pub fn is_referenceable_id(id: &str) -> bool {
    !id.is_empty()
        && !id
            .chars()
            .any(|c| matches!(c, '.' | '{' | '}') || c.is_whitespace())
}

/// What a placeholder points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Output of another node, optionally narrowed by a dotted path.
    NodeOutput { node_id: String, path: Vec<String> },
    /// Key of the workflow's initial input.
    Input { key: String },
}

impl Reference {
    fn parse(token: &str) -> Self {
        let token = token.trim();
        match token.strip_prefix(DEPENDENCY_PREFIX) {
            Some(rest) if !rest.is_empty() => {
                let mut parts = rest.split('.');
                let node_id = parts.next().unwrap_or_default().to_string();
                let path = parts.map(str::to_string).collect();
                Self::NodeOutput { node_id, path }
            }
            _ => Self::Input {
                key: token.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Ref { raw: String, reference: Reference },
}

/// A parsed string template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in placeholder_re().captures_iter(text) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(text[last..whole.start()].to_string()));
            }
            segments.push(Segment::Ref {
                raw: whole.as_str().to_string(),
                reference: Reference::parse(inner.as_str()),
            });
            last = whole.end();
        }
        if last < text.len() {
            segments.push(Segment::Literal(text[last..].to_string()));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The reference if this template is exactly one placeholder and nothing else.
    pub fn sole_reference(&self) -> Option<&Reference> {
        match self.segments.as_slice() {
            [Segment::Ref { reference, .. }] => Some(reference),
            _ => None,
        }
    }

    pub fn has_references(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Ref { .. }))
    }
}

/// Every node id referenced by placeholders anywhere inside `value`.
pub fn referenced_nodes(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_nodes(value, &mut out);
    out
}

fn collect_nodes(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for segment in Template::parse(s).segments {
                if let Segment::Ref {
                    reference: Reference::NodeOutput { node_id, .. },
                    ..
                } = segment
                {
                    out.insert(node_id);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_nodes(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_nodes(v, out)),
        _ => {}
    }
}

/// Follow a dotted path into a JSON value. Numeric segments index arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |cur, segment| match cur {
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => cur.get(segment.as_str()),
    })
}

/// Text used when a value is embedded inside a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
