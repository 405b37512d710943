//! Resource patterns shared by handler tables and annotation files.
//!
//! A pattern is one of:
//! - a glob (`aws_instance.*`, `aws_*`, `*bucket*`), tested against the full
//!   identifier, the identifier without its module path, both of those
//!   without the instance suffix, and the resource type;
//! - a plain identifier (`aws_lb.web`), matching that node and every
//!   expanded instance of it (`aws_lb.web~1`, `aws_lb.web~2`, …), with or
//!   without a module path;
//! - a plain resource type (`aws_subnet`), matching nodes of exactly that
//!   type.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ArchGraphError, Result};
use crate::graph::id;
use crate::graph::NodeMeta;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePattern {
    raw: String,
    glob: Option<glob::Pattern>,
}

impl ResourcePattern {
    pub fn new(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ArchGraphError::invalid_pattern(raw, "empty pattern"));
        }
        let glob = if raw.contains(&['*', '?', '['][..]) {
            Some(glob::Pattern::new(raw).map_err(|e| ArchGraphError::invalid_pattern(raw, e))?)
        } else {
            None
        };
        Ok(Self {
            raw: raw.to_string(),
            glob,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.glob.is_some()
    }

    /// A plain pattern naming one node rather than a type.
    pub fn is_identifier(&self) -> bool {
        self.glob.is_none() && self.raw.contains('.')
    }

    pub fn matches_node(&self, node: &str, meta: Option<&NodeMeta>) -> bool {
        let resource_type = match meta {
            Some(m) if !m.resource_type.is_empty() => m.resource_type.as_str(),
            _ => id::resource_type(node),
        };
        let unsuffixed = id::base(node);
        let bare = id::split_module(node).1;
        let bare_unsuffixed = id::split_module(unsuffixed).1;

        match &self.glob {
            Some(glob) => [node, bare, unsuffixed, bare_unsuffixed, resource_type]
                .iter()
                .any(|candidate| glob.matches(candidate)),
            None if self.raw.contains('.') => [node, bare, unsuffixed, bare_unsuffixed]
                .iter()
                .any(|candidate| *candidate == self.raw),
            None => resource_type == self.raw,
        }
    }

    /// Match a bare resource type (no identifier available).
    pub fn matches_type(&self, resource_type: &str) -> bool {
        match &self.glob {
            Some(glob) => glob.matches(resource_type),
            None => !self.raw.contains('.') && resource_type == self.raw,
        }
    }
}

impl TryFrom<String> for ResourcePattern {
    type Error = ArchGraphError;

    fn try_from(value: String) -> Result<Self> {
        ResourcePattern::new(&value)
    }
}

impl From<ResourcePattern> for String {
    fn from(pattern: ResourcePattern) -> Self {
        pattern.raw
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
