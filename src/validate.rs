//! Validator - the last gate before rendering.
//!
//! Rejects a graph in which two group nodes that are not nested inside one
//! another contain the same child. That shape means expansion went wrong
//! upstream and cannot be drawn. Also tidies the graph: edge-less resources
//! are dropped and empty containers get an invisible placeholder so they
//! still render as boxes.

use std::collections::HashSet;
use tracing::{debug, info, info_span};

use crate::error::{ArchGraphError, Result};
use crate::graph::{id, GraphModel, NodeMeta, Stage};
use crate::provider::{GroupLookup, ProviderSet};

/// Type used for empty-container placeholders.
pub const PLACEHOLDER_TYPE: &str = "tv_placeholder";

#[derive(Debug, Clone, Default)]
pub struct Validator {
    /// Keep resources with neither parents nor children.
    keep_standalone: bool,
}

/// What the tidy-up steps changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub removed: Vec<String>,
    pub placeholders: Vec<String>,
}

impl Validator {
    pub fn new(keep_standalone: bool) -> Self {
        Self { keep_standalone }
    }

    pub fn validate(&self, graph: &mut GraphModel, providers: &ProviderSet) -> Result<ValidationReport> {
        let _span = info_span!("validate", nodes = graph.len()).entered();
        check_shared_children(graph, providers)?;

        let mut report = ValidationReport::default();
        let mut groups = providers.group_lookup();

        if !self.keep_standalone {
            let parents = graph.parent_index();
            for node in graph.sorted_ids() {
                let standalone = graph.children(&node).is_empty()
                    && parents.get(&node).map_or(true, Vec::is_empty);
                if standalone && !groups.is_group(graph.resource_type_of(&node)) {
                    graph.remove_node(&node);
                    debug!(node = %node, "removed standalone node");
                    report.removed.push(node);
                }
            }
        }

        for node in graph.sorted_ids() {
            if graph.children(&node).is_empty() && groups.is_group(graph.resource_type_of(&node)) {
                let placeholder = format!("{}.{}", PLACEHOLDER_TYPE, id::sanitize(&node));
                let mut meta = NodeMeta::synthetic(&placeholder);
                meta.hidden = true;
                meta.provider = graph.provider().to_string();
                graph.insert_node(placeholder.as_str(), meta);
                graph.add_edge(&node, &placeholder);
                report.placeholders.push(placeholder);
            }
        }

        graph.check_integrity(Stage::Validate.as_str())?;
        info!(
            removed = report.removed.len(),
            placeholders = report.placeholders.len(),
            "graph validated"
        );
        Ok(report)
    }
}

/// Fail on the first child held by two unrelated group nodes.
pub fn check_shared_children(graph: &GraphModel, providers: &ProviderSet) -> Result<()> {
    let mut groups = providers.group_lookup();
    let parents = graph.parent_index();
    let mut children: Vec<&String> = parents.keys().collect();
    children.sort();

    for child in children {
        if let Some((first, second)) = unrelated_containers(graph, &mut groups, &parents[child]) {
            return Err(ArchGraphError::SharedChild {
                phase: Stage::Validate.to_string(),
                first,
                second,
                child: child.clone(),
            });
        }
    }
    Ok(())
}

/// The first pair of group nodes among `parents` where neither contains
/// the other, in sorted order.
pub fn unrelated_containers(
    graph: &GraphModel,
    groups: &mut GroupLookup<'_>,
    parents: &[String],
) -> Option<(String, String)> {
    let mut containers: Vec<&String> = parents
        .iter()
        .filter(|p| groups.is_group(graph.resource_type_of(p)))
        .collect();
    if containers.len() < 2 {
        return None;
    }
    containers.sort();
    let ancestry: Vec<HashSet<String>> = containers.iter().map(|c| graph.ancestors(c)).collect();
    for i in 0..containers.len() {
        for j in i + 1..containers.len() {
            let nested = ancestry[i].contains(containers[j]) || ancestry[j].contains(containers[i]);
            if !nested {
                return Some((containers[i].clone(), containers[j].clone()));
            }
        }
    }
    None
}
