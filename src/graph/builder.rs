//! Graph builder - turns resolved resources into the initial graph.
//!
//! Every resolved resource becomes a node seeded with its attributes.
//! Edges come from four places, in this order per resource: the planning
//! tool's own dependency edges, `depends_on`, references named in the
//! resource's expressions, and identifiers found by scanning resolved
//! attribute values (plus provider implied-connection keywords). Scanning
//! is read-only and runs on the rayon pool; edges are applied afterwards
//! in plan order, so the result does not depend on scheduling.

use rayon::prelude::*;
use std::collections::HashSet;
use tracing::{debug, info, info_span};

use super::engine::GraphModel;
use super::id;
use super::types::{AttrBag, Diagnostic, DiagnosticKind, NodeMeta};
use crate::interpreter::{Resolution, ResolvedResource};
use crate::provider::ProviderSet;

/// Characters that may appear inside an identifier segment.
fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

/// Identifiers mentioned in `text`.
///
/// A mention must start at a word boundary. A match that also ends on a
/// segment boundary (end of word, `.` or `~N`) wins over one that only
/// prefixes a longer word; among several, the longest wins.
pub(crate) fn mentions<'a>(text: &str, known: &HashSet<&'a str>) -> Vec<&'a str> {
    let mut found = Vec::new();
    for word in text.split(|c: char| !is_ident_char(c)) {
        if word.is_empty() {
            continue;
        }
        let mut exact: Option<&'a str> = None;
        let mut partial: Option<&'a str> = None;
        for (pos, c) in word.char_indices().skip(1) {
            let candidate = &word[..pos];
            if let Some(hit) = known.get(candidate) {
                if c == '.' {
                    exact = Some(*hit);
                } else {
                    partial = Some(*hit);
                }
            }
        }
        if let Some(hit) = known.get(word) {
            exact = Some(*hit);
        }
        if let Some(hit) = exact.or(partial) {
            found.push(hit);
        }
    }
    found
}

/// Whether `name` appears in `text` as a whole word, not as part of a
/// longer name.
fn names_segment(text: &str, name: &str) -> bool {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
    text.match_indices(name).any(|(pos, _)| {
        let before = text[..pos].chars().next_back();
        let after = text[pos + name.len()..].chars().next();
        !before.is_some_and(word) && !after.is_some_and(word)
    })
}

fn for_each_string(bag: &AttrBag, f: &mut impl FnMut(&str, &str)) {
    for (key, value) in bag {
        value.for_each_str(&mut |s| f(key, s));
    }
}

/// Builds a [`GraphModel`] from a [`Resolution`] under a provider set.
pub struct GraphBuilder<'a> {
    providers: &'a ProviderSet,
    title: Option<String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(providers: &'a ProviderSet) -> Self {
        Self {
            providers,
            title: None,
        }
    }

    pub fn with_title<T: Into<String>>(mut self, title: T) -> Self {
        self.title = Some(title.into());
        self
    }

    fn node_meta(&self, resource: &ResolvedResource) -> NodeMeta {
        NodeMeta {
            resource_type: resource.resource_type.clone(),
            name: resource.name.clone(),
            module: resource.module.clone(),
            provider: id::provider_prefix(&resource.resource_type).to_string(),
            attributes: resource.attributes.clone(),
            raw: resource.raw.clone(),
            instances: resource.instances.clone(),
            instance_keys: resource.instance_keys.clone(),
            hidden: self.providers.is_hidden(&resource.resource_type),
            cardinality: resource.cardinality.max(1),
            variant: self
                .providers
                .variant(&resource.resource_type, &resource.attributes),
            ..NodeMeta::default()
        }
    }

    /// Referenced ids for one resource, in discovery order, deduplicated.
    fn referenced(
        &self,
        resource: &ResolvedResource,
        resolution: &Resolution,
        known: &HashSet<&str>,
        by_type: &[(String, Vec<(String, String)>)],
    ) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |target: &str| {
            if target != resource.id && known.contains(target) && !out.iter().any(|t| t == target) {
                out.push(target.to_string());
            }
        };

        for dep in resolution.dependencies.iter().filter(|d| d.from == resource.id) {
            push(dep.to.as_str());
        }
        resource.depends_on.iter().for_each(|t| push(t.as_str()));
        resource.references.iter().for_each(|t| push(t.as_str()));

        let bags = std::iter::once(&resource.attributes).chain(resource.instances.iter());
        for bag in bags {
            for_each_string(bag, &mut |_, text| {
                for hit in mentions(text, known) {
                    push(hit);
                }
            });
        }

        for (regex, target_type) in self.providers.implied_connections() {
            if *target_type == resource.resource_type {
                continue;
            }
            let Some((_, targets)) = by_type.iter().find(|(t, _)| t == target_type) else {
                continue;
            };
            let mut matched_text: Vec<String> = Vec::new();
            for_each_string(&resource.attributes, &mut |key, text| {
                if regex.is_match(key) || regex.is_match(text) {
                    matched_text.push(text.to_string());
                }
            });
            if matched_text.is_empty() {
                continue;
            }
            // Narrow to targets named in the matching text when possible,
            // whole names first.
            let mut named: Vec<&(String, String)> = targets
                .iter()
                .filter(|(_, name)| matched_text.iter().any(|t| names_segment(t, name)))
                .collect();
            if named.is_empty() {
                named = targets
                    .iter()
                    .filter(|(_, name)| matched_text.iter().any(|t| t.contains(name.as_str())))
                    .collect();
            }
            if named.is_empty() {
                targets.iter().for_each(|(target, _)| push(target.as_str()));
            } else {
                named.into_iter().for_each(|(target, _)| push(target.as_str()));
            }
        }
        out
    }

    pub fn build(&self, resolution: &Resolution) -> (GraphModel, Vec<Diagnostic>) {
        let _span = info_span!("build", resources = resolution.resources.len()).entered();
        let mut graph = GraphModel::new(self.providers.primary());
        if let Some(title) = &self.title {
            graph.set_title(title.clone());
        }

        for resource in &resolution.resources {
            graph.insert_node(resource.id.as_str(), self.node_meta(resource));
        }

        let known: HashSet<&str> = resolution.resources.iter().map(|r| r.id.as_str()).collect();
        let mut by_type: Vec<(String, Vec<(String, String)>)> = Vec::new();
        for resource in &resolution.resources {
            let entry = (resource.id.clone(), resource.name.clone());
            match by_type.iter_mut().find(|(t, _)| *t == resource.resource_type) {
                Some((_, list)) => list.push(entry),
                None => by_type.push((resource.resource_type.clone(), vec![entry])),
            }
        }

        let discovered: Vec<Vec<String>> = resolution
            .resources
            .par_iter()
            .map(|resource| self.referenced(resource, resolution, &known, &by_type))
            .collect();

        let mut diagnostics = Vec::new();
        for (resource, targets) in resolution.resources.iter().zip(discovered) {
            for target in targets {
                let (from, to) = if self.providers.is_reverse_arrow(graph.resource_type_of(&target)) {
                    (target.clone(), resource.id.clone())
                } else {
                    (resource.id.clone(), target.clone())
                };
                if graph.has_edge(&to, &from) {
                    debug!(from = %from, to = %to, "skipping edge that would close a two-node loop");
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::Skipped,
                        Some(from.as_str()),
                        format!("dropped edge to '{}', the reverse edge already exists", to),
                    ));
                    continue;
                }
                graph.add_edge(&from, &to);
            }
        }

        info!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            "built initial graph"
        );
        (graph, diagnostics)
    }
}

/// Build the initial graph for a resolution.
pub fn build_graph(resolution: &Resolution, providers: &ProviderSet) -> (GraphModel, Vec<Diagnostic>) {
    GraphBuilder::new(providers).build(resolution)
}
