//! The graph model shared by every pipeline stage.
//!
//! Structure (an ordered adjacency map) and data (a metadata store keyed by
//! the same identifiers) are kept side by side but mutated independently, so
//! a pass can rewrite attributes without touching the graph shape.

use indexmap::IndexMap;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

use super::id;
use super::types::NodeMeta;
use crate::error::{ArchGraphError, Result};
use crate::pattern::ResourcePattern;

/// Adjacency map plus metadata store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphModel {
    /// Node id -> ordered child ids.
    adjacency: IndexMap<String, Vec<String>>,
    /// Node id -> metadata.
    metadata: BTreeMap<String, NodeMeta>,
    /// Primary provider tag for this run.
    provider: String,
    title: Option<String>,
}

impl GraphModel {
    /// Create a new empty graph for a provider.
    pub fn new<P: Into<String>>(provider: P) -> Self {
        Self {
            adjacency: IndexMap::new(),
            metadata: BTreeMap::new(),
            provider: provider.into(),
            title: None,
        }
    }

    pub(crate) fn from_parts(
        provider: String,
        title: Option<String>,
        adjacency: IndexMap<String, Vec<String>>,
        metadata: BTreeMap<String, NodeMeta>,
    ) -> Self {
        Self {
            adjacency,
            metadata,
            provider,
            title,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn set_title<T: Into<String>>(&mut self, title: T) {
        self.title = Some(title.into());
    }

    pub fn adjacency(&self) -> &IndexMap<String, Vec<String>> {
        &self.adjacency
    }

    pub fn metadata(&self) -> &BTreeMap<String, NodeMeta> {
        &self.metadata
    }

    // ─── Node Operations ────────────────────────────────────────

    pub fn contains(&self, node: &str) -> bool {
        self.adjacency.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// Insert a node with its metadata. An existing node keeps its edges
    /// and has its metadata replaced.
    pub fn insert_node<S: Into<String>>(&mut self, node: S, meta: NodeMeta) {
        let node = node.into();
        self.adjacency.entry(node.clone()).or_default();
        self.metadata.insert(node, meta);
    }

    /// Make sure a node exists, creating empty-default metadata if needed.
    /// Returns true if the node was created.
    pub fn ensure_node(&mut self, node: &str) -> bool {
        let created = !self.adjacency.contains_key(node);
        if created {
            self.adjacency.insert(node.to_string(), Vec::new());
        }
        if !self.metadata.contains_key(node) {
            self.metadata.insert(node.to_string(), NodeMeta::for_id(node));
        }
        created
    }

    pub fn meta(&self, node: &str) -> Option<&NodeMeta> {
        self.metadata.get(node)
    }

    /// Mutable metadata access. Lazily creates the entry for a known node.
    pub fn meta_mut(&mut self, node: &str) -> Option<&mut NodeMeta> {
        if !self.adjacency.contains_key(node) {
            return self.metadata.get_mut(node);
        }
        Some(
            self.metadata
                .entry(node.to_string())
                .or_insert_with(|| NodeMeta::for_id(node)),
        )
    }

    /// Remove a node, its metadata, and every edge that points at it.
    pub fn remove_node(&mut self, node: &str) -> bool {
        let existed = self.adjacency.shift_remove(node).is_some();
        self.metadata.remove(node);
        for children in self.adjacency.values_mut() {
            children.retain(|c| c != node);
        }
        for meta in self.metadata.values_mut() {
            meta.edge_labels.remove(node);
        }
        if existed {
            debug!(node = %node, "removed node");
        }
        existed
    }

    /// Rename a node everywhere it appears, keeping its position in the
    /// adjacency order. Fails silently (returns false) if `new` exists.
    pub fn rename_node(&mut self, old: &str, new: &str) -> bool {
        if old == new || !self.contains(old) || self.contains(new) {
            return false;
        }
        if let Some(index) = self.adjacency.get_index_of(old) {
            let children = self.adjacency[index].clone();
            self.adjacency.insert(new.to_string(), children);
            let last = self.adjacency.len() - 1;
            self.adjacency.move_index(last, index);
            self.adjacency.shift_remove(old);
        }
        if let Some(meta) = self.metadata.remove(old) {
            self.metadata.insert(new.to_string(), meta);
        }
        for children in self.adjacency.values_mut() {
            for child in children.iter_mut() {
                if child == old {
                    *child = new.to_string();
                }
            }
        }
        for meta in self.metadata.values_mut() {
            if let Some(label) = meta.edge_labels.remove(old) {
                meta.edge_labels.insert(new.to_string(), label);
            }
        }
        true
    }

    /// All node ids in adjacency order.
    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.adjacency.keys()
    }

    /// All node ids, sorted.
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adjacency.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sorted ids of every node matching a pattern.
    pub fn nodes_matching(&self, pattern: &ResourcePattern) -> Vec<String> {
        let mut ids: Vec<String> = self
            .adjacency
            .keys()
            .filter(|node| pattern.matches_node(node, self.metadata.get(*node)))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Sorted ids of nodes whose resource type is exactly `resource_type`.
    pub fn nodes_of_type(&self, resource_type: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .adjacency
            .keys()
            .filter(|node| self.resource_type_of(node) == resource_type)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn resource_type_of<'a>(&'a self, node: &'a str) -> &'a str {
        match self.metadata.get(node) {
            Some(meta) if !meta.resource_type.is_empty() => &meta.resource_type,
            _ => id::resource_type(node),
        }
    }

    // ─── Edge Operations ────────────────────────────────────────

    /// Add an edge, creating either endpoint if it does not exist yet.
    /// Self-loops and duplicates are ignored. Returns true if added.
    pub fn add_edge(&mut self, from: &str, to: &str) -> bool {
        if from == to {
            return false;
        }
        self.ensure_node(from);
        self.ensure_node(to);
        let children = self.adjacency.entry(from.to_string()).or_default();
        if children.iter().any(|c| c == to) {
            return false;
        }
        children.push(to.to_string());
        true
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) -> bool {
        let Some(children) = self.adjacency.get_mut(from) else {
            return false;
        };
        let before = children.len();
        children.retain(|c| c != to);
        let removed = children.len() != before;
        if removed {
            if let Some(meta) = self.metadata.get_mut(from) {
                meta.edge_labels.remove(to);
            }
        }
        removed
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.children(from).iter().any(|c| c == to)
    }

    /// Swap `old` for `new` in `parent`'s child list, keeping the position.
    pub fn replace_child(&mut self, parent: &str, old: &str, new: &str) -> bool {
        if parent == new {
            return self.remove_edge(parent, old);
        }
        self.ensure_node(new);
        let Some(children) = self.adjacency.get_mut(parent) else {
            return false;
        };
        let Some(pos) = children.iter().position(|c| c == old) else {
            return false;
        };
        if children.iter().any(|c| c == new) {
            children.remove(pos);
        } else {
            children[pos] = new.to_string();
        }
        true
    }

    pub fn children(&self, node: &str) -> &[String] {
        self.adjacency.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes with an edge to `node`, in adjacency order.
    pub fn parents(&self, node: &str) -> Vec<String> {
        self.adjacency
            .iter()
            .filter(|(_, children)| children.iter().any(|c| c == node))
            .map(|(parent, _)| parent.clone())
            .collect()
    }

    /// Every (from, to) pair in adjacency order.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.adjacency
            .iter()
            .flat_map(|(from, children)| children.iter().map(move |to| (from.clone(), to.clone())))
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum()
    }

    /// Reverse index: child -> parents, for passes that need many lookups.
    pub fn parent_index(&self) -> HashMap<String, Vec<String>> {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for (parent, children) in &self.adjacency {
            for child in children {
                index.entry(child.clone()).or_default().push(parent.clone());
            }
        }
        index
    }

    /// Every node reachable upward from `node` (excluding itself).
    pub fn ancestors(&self, node: &str) -> HashSet<String> {
        let index = self.parent_index();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(node);
        while let Some(current) = queue.pop_front() {
            if let Some(parents) = index.get(current) {
                for parent in parents {
                    if parent != node && seen.insert(parent.clone()) {
                        queue.push_back(parent);
                    }
                }
            }
        }
        seen
    }

    /// Copy the structure into a petgraph graph for algorithmic queries.
    pub(crate) fn to_petgraph(&self) -> (DiGraph<String, ()>, HashMap<String, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in self.adjacency.keys() {
            index.insert(node.clone(), graph.add_node(node.clone()));
        }
        for (from, children) in &self.adjacency {
            for to in children {
                if let (Some(&a), Some(&b)) = (index.get(from), index.get(to)) {
                    graph.add_edge(a, b, ());
                }
            }
        }
        (graph, index)
    }

    // ─── Integrity ──────────────────────────────────────────────

    /// Verify the adjacency/metadata lockstep invariant and that no child
    /// reference dangles.
    pub fn check_integrity(&self, phase: &str) -> Result<()> {
        for (parent, children) in &self.adjacency {
            if !self.metadata.contains_key(parent) {
                return Err(ArchGraphError::MetadataMismatch {
                    phase: phase.to_string(),
                    node: parent.clone(),
                });
            }
            for child in children {
                if !self.adjacency.contains_key(child) {
                    return Err(ArchGraphError::DanglingReference {
                        phase: phase.to_string(),
                        parent: parent.clone(),
                        child: child.clone(),
                    });
                }
            }
        }
        if let Some(orphan) = self
            .metadata
            .keys()
            .find(|node| !self.adjacency.contains_key(*node))
        {
            return Err(ArchGraphError::MetadataMismatch {
                phase: phase.to_string(),
                node: orphan.clone(),
            });
        }
        Ok(())
    }

    /// Get graph statistics.
    pub fn stats(&self) -> GraphStats {
        let resource_types: BTreeSet<&str> = self
            .adjacency
            .keys()
            .map(|node| self.resource_type_of(node))
            .collect();
        let (structure, _) = self.to_petgraph();
        GraphStats {
            total_nodes: self.adjacency.len(),
            total_edges: self.edge_count(),
            hidden_nodes: self.metadata.values().filter(|m| m.hidden).count(),
            synthetic_nodes: self.metadata.values().filter(|m| m.synthetic).count(),
            resource_types: resource_types.len(),
            cyclic: is_cyclic_directed(&structure),
        }
    }
}

/// Graph statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub hidden_nodes: usize,
    pub synthetic_nodes: usize,
    pub resource_types: usize,
    /// Some chain of edges leads back to its start.
    pub cyclic: bool,
}

impl std::fmt::Display for GraphStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} nodes ({} hidden, {} synthetic), {} edges, {} resource types{}",
            self.total_nodes,
            self.hidden_nodes,
            self.synthetic_nodes,
            self.total_edges,
            self.resource_types,
            if self.cyclic { ", cyclic" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GraphModel {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_vpc.main", "aws_subnet.a");
        graph.add_edge("aws_subnet.a", "aws_instance.web");
        graph.add_edge("aws_subnet.a", "aws_instance.db");
        graph
    }

    #[test]
    fn test_add_edge_creates_metadata_lazily() {
        let graph = sample();
        assert_eq!(graph.len(), 4);
        let meta = graph.meta("aws_instance.web").unwrap();
        assert_eq!(meta.resource_type, "aws_instance");
        assert_eq!(meta.name, "web");
        assert!(graph.check_integrity("test").is_ok());
    }

    #[test]
    fn test_duplicate_and_self_edges_ignored() {
        let mut graph = sample();
        assert!(!graph.add_edge("aws_vpc.main", "aws_subnet.a"));
        assert!(!graph.add_edge("aws_vpc.main", "aws_vpc.main"));
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_parents_and_children() {
        let graph = sample();
        assert_eq!(graph.children("aws_subnet.a"), ["aws_instance.web", "aws_instance.db"]);
        assert_eq!(graph.parents("aws_instance.db"), vec!["aws_subnet.a".to_string()]);
        assert!(graph.parents("aws_vpc.main").is_empty());
        assert!(graph.children("missing").is_empty());
    }

    #[test]
    fn test_remove_node_clears_references() {
        let mut graph = sample();
        assert!(graph.remove_node("aws_subnet.a"));
        assert!(graph.children("aws_vpc.main").is_empty());
        assert!(graph.meta("aws_subnet.a").is_none());
        // Children survive as standalone nodes.
        assert!(graph.contains("aws_instance.web"));
        assert!(graph.check_integrity("test").is_ok());
    }

    #[test]
    fn test_remove_nonexistent_node() {
        let mut graph = GraphModel::new("aws");
        assert!(!graph.remove_node("does_not_exist.x"));
        assert_eq!(graph.stats().total_nodes, 0);
    }

    #[test]
    fn test_rename_keeps_position_and_edges() {
        let mut graph = sample();
        assert!(graph.rename_node("aws_subnet.a", "aws_subnet.a~1"));
        let order: Vec<&String> = graph.node_ids().collect();
        assert_eq!(order[1], "aws_subnet.a~1");
        assert_eq!(graph.children("aws_vpc.main"), ["aws_subnet.a~1"]);
        assert_eq!(graph.children("aws_subnet.a~1").len(), 2);
        assert!(graph.meta("aws_subnet.a~1").is_some());
        assert!(!graph.contains("aws_subnet.a"));
    }

    #[test]
    fn test_replace_child_preserves_order() {
        let mut graph = sample();
        graph.replace_child("aws_subnet.a", "aws_instance.web", "aws_security_group.sg");
        assert_eq!(
            graph.children("aws_subnet.a"),
            ["aws_security_group.sg", "aws_instance.db"]
        );
    }

    #[test]
    fn test_replace_child_with_existing_child_dedupes() {
        let mut graph = sample();
        graph.replace_child("aws_subnet.a", "aws_instance.web", "aws_instance.db");
        assert_eq!(graph.children("aws_subnet.a"), ["aws_instance.db"]);
    }

    #[test]
    fn test_ancestors_handles_cycles() {
        let mut graph = sample();
        graph.add_edge("aws_instance.web", "aws_vpc.main");
        let ancestors = graph.ancestors("aws_instance.db");
        assert!(ancestors.contains("aws_subnet.a"));
        assert!(ancestors.contains("aws_vpc.main"));
        assert!(ancestors.contains("aws_instance.web"));
        assert!(!ancestors.contains("aws_instance.db"));
    }

    #[test]
    fn test_integrity_detects_dangling_child() {
        let mut adjacency = IndexMap::new();
        adjacency.insert("a.b".to_string(), vec!["c.d".to_string()]);
        let mut metadata = BTreeMap::new();
        metadata.insert("a.b".to_string(), NodeMeta::for_id("a.b"));
        let graph = GraphModel::from_parts("aws".into(), None, adjacency, metadata);
        let err = graph.check_integrity("replay").unwrap_err();
        assert!(matches!(err, ArchGraphError::DanglingReference { .. }));
    }

    #[test]
    fn test_stats() {
        let mut graph = sample();
        graph.meta_mut("aws_instance.db").unwrap().hidden = true;
        let stats = graph.stats();
        assert_eq!(stats.total_nodes, 4);
        assert_eq!(stats.total_edges, 3);
        assert_eq!(stats.hidden_nodes, 1);
        assert_eq!(stats.resource_types, 3);
        assert!(!stats.cyclic);
    }

    #[test]
    fn test_stats_report_cycle() {
        let mut graph = sample();
        graph.add_edge("aws_instance.db", "aws_vpc.main");
        let stats = graph.stats();
        assert!(stats.cyclic);
        assert!(stats.to_string().ends_with(", cyclic"));
    }

    #[test]
    fn test_petgraph_view_matches() {
        let graph = sample();
        let (pg, index) = graph.to_petgraph();
        assert_eq!(pg.node_count(), 4);
        assert_eq!(pg.edge_count(), 3);
        assert!(pg
            .find_edge(index["aws_vpc.main"], index["aws_subnet.a"])
            .is_some());
    }
}
