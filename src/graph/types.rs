//! Core types for the archgraph graph model.
//!
//! Defines the attribute value sum type, the per-node metadata record
//! and the non-fatal diagnostics produced while building a graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::id;

/// An attribute bag: attribute name to value, kept sorted so every
/// serialization of the same bag is byte-identical.
pub type AttrBag = BTreeMap<String, Value>;

/// A configuration value, either raw (strings may still hold `${…}`
/// expressions) or resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    /// Placeholder left behind when an expression could not be reduced.
    Unresolved(Unresolved),
    Map(BTreeMap<String, Value>),
}

/// Marker for an expression the interpreter gave up on.
/// Serializes as `{"$unresolved": "<expression>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Unresolved {
    #[serde(rename = "$unresolved")]
    pub expression: String,
}

impl Value {
    pub fn string<S: Into<String>>(s: S) -> Self {
        Value::String(s.into())
    }

    pub fn unresolved<S: Into<String>>(expression: S) -> Self {
        Value::Unresolved(Unresolved {
            expression: expression.into(),
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view. Integral floats and numeric strings are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s == "true" => Some(true),
            Value::String(s) if s == "false" => Some(false),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True if this value or anything nested in it is a placeholder.
    pub fn contains_unresolved(&self) -> bool {
        match self {
            Value::Unresolved(_) => true,
            Value::List(items) => items.iter().any(Value::contains_unresolved),
            Value::Map(map) => map.values().any(Value::contains_unresolved),
            _ => false,
        }
    }

    /// Short type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Unresolved(_) => "unresolved",
            Value::Map(_) => "map",
        }
    }

    /// Visit every string nested anywhere inside this value.
    pub fn for_each_str<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Value::String(s) => f(s),
            Value::List(items) => items.iter().for_each(|v| v.for_each_str(f)),
            Value::Map(map) => map.values().for_each(|v| v.for_each_str(f)),
            _ => {}
        }
    }

    /// Text used when a value is interpolated into a string template.
    pub fn to_template_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::String(s) => s.clone(),
            Value::Unresolved(u) => format!("${{{}}}", u.expression),
            Value::List(_) | Value::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_template_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

fn one() -> usize {
    1
}

/// Metadata Store entry for one node.
///
/// The adjacency map only knows identifiers; everything a pass needs to
/// read or write about a node lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub resource_type: String,
    pub name: String,
    /// Dotted module path (`module.a.module.b`), empty for the root module.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    #[serde(default)]
    pub provider: String,
    /// Resolved attributes.
    #[serde(default)]
    pub attributes: AttrBag,
    /// Attributes as written, before interpolation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw: AttrBag,
    /// Per-instance resolved attributes of a multi-instance resource,
    /// handed to the siblings by the expander.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<AttrBag>,
    /// `for_each` keys in enumeration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_keys: Vec<String>,
    /// Present in the graph but not drawn.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "one")]
    pub cardinality: usize,
    /// Created by the pipeline rather than declared in configuration.
    #[serde(default)]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Child id to edge text.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub edge_labels: BTreeMap<String, String>,
}

impl Default for NodeMeta {
    fn default() -> Self {
        Self {
            resource_type: String::new(),
            name: String::new(),
            module: String::new(),
            provider: String::new(),
            attributes: AttrBag::new(),
            raw: AttrBag::new(),
            instances: Vec::new(),
            instance_keys: Vec::new(),
            hidden: false,
            cardinality: 1,
            synthetic: false,
            variant: None,
            label: None,
            edge_labels: BTreeMap::new(),
        }
    }
}

impl NodeMeta {
    /// Empty-default metadata for an identifier, with type, name and
    /// module path derived from the identifier itself.
    pub fn for_id(node_id: &str) -> Self {
        let parts = id::NodeId::parse(node_id);
        Self {
            resource_type: parts.resource_type.to_string(),
            name: parts.name.to_string(),
            module: parts.module.to_string(),
            provider: id::provider_prefix(parts.resource_type).to_string(),
            ..Self::default()
        }
    }

    /// Metadata for a node the pipeline invents (containers, placeholders).
    pub fn synthetic(node_id: &str) -> Self {
        Self {
            synthetic: true,
            ..Self::for_id(node_id)
        }
    }
}

/// What went wrong, without stopping the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// An expression could not be reduced to a literal.
    Unresolved,
    /// Expressions reference each other in a loop.
    ReferenceCycle,
    /// Expression text failed to parse.
    Syntax,
    /// No provider or handler knows this resource type.
    UnknownResourceType,
    /// A best-effort pairing or placement was applied.
    Approximation,
    /// An operation had nothing to act on or referenced a missing node.
    Skipped,
    /// An annotation left a child inside two unrelated containers.
    SharedChild,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Unresolved => write!(f, "unresolved"),
            DiagnosticKind::ReferenceCycle => write!(f, "reference_cycle"),
            DiagnosticKind::Syntax => write!(f, "syntax"),
            DiagnosticKind::UnknownResourceType => write!(f, "unknown_resource_type"),
            DiagnosticKind::Approximation => write!(f, "approximation"),
            DiagnosticKind::Skipped => write!(f, "skipped"),
            DiagnosticKind::SharedChild => write!(f, "shared_child"),
        }
    }
}

/// A non-fatal finding attached to the run output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new<M: Into<String>>(kind: DiagnosticKind, node: Option<&str>, message: M) -> Self {
        Self {
            kind,
            node: node.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "[{}] {}: {}", self.kind, node, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}
