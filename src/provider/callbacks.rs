//! Custom handler callbacks for provider logic the operation library
//! cannot express.
//!
//! A callback receives the graph and the nodes its handler pattern matched.
//! New behavior is added by registering another function here (or on a
//! registry handed to the pipeline), never by editing the engine.

use std::collections::HashMap;
use tracing::debug;

use crate::error::Result;
use crate::graph::{id, Diagnostic, DiagnosticKind, GraphModel, NodeMeta, Value};
use crate::pattern::ResourcePattern;

/// Per-invocation context handed to a callback.
pub struct HandlerCtx<'a> {
    pub pattern: &'a ResourcePattern,
    /// Sorted ids the handler pattern matched when the callback started.
    pub matched: Vec<String>,
    pub diagnostics: &'a mut Vec<Diagnostic>,
}

pub type Callback = fn(&mut GraphModel, &mut HandlerCtx<'_>) -> Result<()>;

/// Name → callback table, consulted once when a provider context compiles.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Callback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every callback shipped with the crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("aws_eks_node_groups", aws_eks_node_groups);
        registry.register("aws_lb_listeners", aws_lb_listeners);
        registry
    }

    pub fn register(&mut self, name: &str, callback: Callback) {
        self.callbacks.insert(name.to_string(), callback);
    }

    pub fn get(&self, name: &str) -> Option<Callback> {
        self.callbacks.get(name).copied()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.names())
            .finish()
    }
}

/// Nodes adjacent to `node` in either direction whose type is in `types`.
fn neighbours_of_type(graph: &GraphModel, node: &str, types: &[&str]) -> Vec<String> {
    let mut found: Vec<String> = graph
        .children(node)
        .iter()
        .cloned()
        .chain(graph.parents(node))
        .filter(|n| types.contains(&graph.resource_type_of(n)))
        .collect();
    found.sort();
    found.dedup();
    found
}

// ─── aws_eks_node_groups ────────────────────────────────────────

/// Desired size from `scaling_config`, written either as a block list or
/// as a single map.
fn desired_size(meta: &NodeMeta) -> Option<usize> {
    let config = meta.attributes.get("scaling_config")?;
    let block = match config {
        Value::List(items) => items.first()?,
        other => other,
    };
    block
        .as_map()?
        .get("desired_size")?
        .as_i64()
        .and_then(|n| usize::try_from(n).ok())
}

/// Place each node group under its cluster and hang a synthetic node for
/// the worker capacity the plan never sees under the group.
fn aws_eks_node_groups(graph: &mut GraphModel, ctx: &mut HandlerCtx<'_>) -> Result<()> {
    for group in ctx.matched.clone() {
        let Some(meta) = graph.meta(&group).cloned() else {
            continue;
        };
        let clusters = neighbours_of_type(graph, &group, &["aws_eks_cluster"]);
        if clusters.is_empty() {
            ctx.diagnostics.push(Diagnostic::new(
                DiagnosticKind::Skipped,
                Some(group.as_str()),
                "node group has no cluster to attach to",
            ));
        }
        for cluster in &clusters {
            graph.remove_edge(&group, cluster);
            graph.add_edge(cluster, &group);
        }

        let worker_name = match id::suffix(&group) {
            Some(n) => format!("{}_{}", meta.name, n),
            None => meta.name.clone(),
        };
        let workers = id::qualified(&meta.module, "tv_aws_eks_workers", &id::sanitize(&worker_name));
        let mut worker_meta = NodeMeta::synthetic(&workers);
        worker_meta.provider = "aws".to_string();
        worker_meta.label = Some("worker nodes".to_string());
        if let Some(size) = desired_size(&meta) {
            worker_meta.cardinality = size.max(1);
            worker_meta
                .attributes
                .insert("desired_size".to_string(), Value::Int(size as i64));
        }
        graph.insert_node(workers.as_str(), worker_meta);
        graph.add_edge(&group, &workers);
        debug!(node = %group, workers = %workers, "attached eks worker capacity");
    }
    Ok(())
}

// ─── aws_lb_listeners ───────────────────────────────────────────

const LOAD_BALANCER_TYPES: &[&str] = &["aws_lb", "aws_alb"];
const TARGET_GROUP_TYPES: &[&str] = &["aws_lb_target_group", "aws_alb_target_group"];

/// Link each load balancer directly to its listeners' target groups and
/// drop the listener nodes.
fn aws_lb_listeners(graph: &mut GraphModel, ctx: &mut HandlerCtx<'_>) -> Result<()> {
    for listener in ctx.matched.clone() {
        if !graph.contains(&listener) {
            continue;
        }
        let balancers = neighbours_of_type(graph, &listener, LOAD_BALANCER_TYPES);
        let targets = neighbours_of_type(graph, &listener, TARGET_GROUP_TYPES);
        if balancers.is_empty() {
            ctx.diagnostics.push(Diagnostic::new(
                DiagnosticKind::Skipped,
                Some(listener.as_str()),
                "listener is not attached to a load balancer",
            ));
            continue;
        }
        for balancer in &balancers {
            for target in &targets {
                graph.add_edge(balancer, target);
            }
        }
        graph.remove_node(&listener);
        debug!(node = %listener, balancers = balancers.len(), "collapsed listener");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(cb: Callback, graph: &mut GraphModel, pattern: &str) -> Vec<Diagnostic> {
        let pattern = ResourcePattern::new(pattern).unwrap();
        let mut diagnostics = Vec::new();
        let mut ctx = HandlerCtx {
            pattern: &pattern,
            matched: graph.nodes_matching(&pattern),
            diagnostics: &mut diagnostics,
        };
        cb(graph, &mut ctx).unwrap();
        diagnostics
    }

    #[test]
    fn test_registry_lookup() {
        let registry = CallbackRegistry::builtin();
        assert!(registry.get("aws_lb_listeners").is_some());
        assert!(registry.get("nope").is_none());
        assert_eq!(registry.names(), vec!["aws_eks_node_groups", "aws_lb_listeners"]);
    }

    #[test]
    fn test_listener_collapsed_into_direct_link() {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_lb_listener.http", "aws_lb.web");
        graph.add_edge("aws_lb_listener.http", "aws_lb_target_group.app");
        let diagnostics = run(aws_lb_listeners, &mut graph, "aws_lb_listener");
        assert!(diagnostics.is_empty());
        assert!(!graph.contains("aws_lb_listener.http"));
        assert!(graph.has_edge("aws_lb.web", "aws_lb_target_group.app"));
        assert!(graph.check_integrity("test").is_ok());
    }

    #[test]
    fn test_node_group_moves_under_cluster_with_workers() {
        let mut graph = GraphModel::new("aws");
        let mut meta = NodeMeta::for_id("aws_eks_node_group.main");
        let mut scaling = std::collections::BTreeMap::new();
        scaling.insert("desired_size".to_string(), Value::Int(3));
        meta.attributes
            .insert("scaling_config".into(), Value::List(vec![Value::Map(scaling)]));
        graph.insert_node("aws_eks_node_group.main", meta);
        graph.add_edge("aws_eks_node_group.main", "aws_eks_cluster.prod");

        run(aws_eks_node_groups, &mut graph, "aws_eks_node_group");
        assert!(graph.has_edge("aws_eks_cluster.prod", "aws_eks_node_group.main"));
        assert!(!graph.has_edge("aws_eks_node_group.main", "aws_eks_cluster.prod"));
        let workers = "tv_aws_eks_workers.main";
        assert!(graph.has_edge("aws_eks_node_group.main", workers));
        let worker_meta = graph.meta(workers).unwrap();
        assert!(worker_meta.synthetic);
        assert_eq!(worker_meta.cardinality, 3);
    }

    #[test]
    fn test_orphan_node_group_reports_skip() {
        let mut graph = GraphModel::new("aws");
        graph.ensure_node("aws_eks_node_group.lonely");
        let diagnostics = run(aws_eks_node_groups, &mut graph, "aws_eks_node_group");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::Skipped);
    }
}
