//! User annotations, applied after every automatic pass so explicit intent
//! wins over heuristics.
//!
//! ```yaml
//! title: Production
//! add:
//!   aws_sqs_queue.jobs: { visibility_timeout: 30 }
//! connect:
//!   aws_lambda_function.*:
//!     - aws_sqs_queue.jobs: consumes
//!     - aws_s3_bucket.data
//! disconnect:
//!   aws_instance.*: [aws_iam_role.app]
//! remove: [aws_cloudwatch_log_group.*]
//! update:
//!   aws_lb.web:
//!     label: Public ALB
//!     edge_labels:
//!       - aws_instance.web~1: HTTPS
//! ```
//!
//! Sections apply in the order title, add, connect, disconnect, remove,
//! update.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, info_span};

use crate::error::{ArchGraphError, Result};
use crate::graph::{AttrBag, Diagnostic, DiagnosticKind, GraphModel, NodeMeta};
use crate::pattern::ResourcePattern;
use crate::provider::ProviderSet;
use crate::validate::unrelated_containers;

// ─── File format ────────────────────────────────────────────────

/// A list entry that is either a bare target or `target: label`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkTarget {
    Plain(String),
    Labelled(BTreeMap<String, String>),
}

impl LinkTarget {
    fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            LinkTarget::Plain(target) => vec![(target.clone(), None)],
            LinkTarget::Labelled(map) => map
                .iter()
                .map(|(target, label)| (target.clone(), Some(label.clone())))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub attributes: AttrBag,
    #[serde(default)]
    pub edge_labels: Vec<LinkTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationFile {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub add: IndexMap<String, Option<AttrBag>>,
    #[serde(default)]
    pub connect: IndexMap<String, Vec<LinkTarget>>,
    #[serde(default)]
    pub disconnect: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub update: IndexMap<String, NodeUpdate>,
}

// ─── Compiled directives ────────────────────────────────────────

type Links = Vec<(ResourcePattern, Option<String>)>;

fn compile_links(targets: &[LinkTarget]) -> Result<Links> {
    targets
        .iter()
        .flat_map(LinkTarget::entries)
        .map(|(target, label)| Ok((ResourcePattern::new(&target)?, label)))
        .collect()
}

/// Annotation directives with every pattern parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    title: Option<String>,
    add: Vec<(String, AttrBag)>,
    connect: Vec<(ResourcePattern, Links)>,
    disconnect: Vec<(ResourcePattern, Vec<ResourcePattern>)>,
    remove: Vec<ResourcePattern>,
    update: Vec<(ResourcePattern, Option<String>, AttrBag, Links)>,
}

impl Annotations {
    pub fn compile(file: AnnotationFile) -> Result<Self> {
        let mut add = Vec::new();
        for (node, attributes) in file.add {
            let pattern = ResourcePattern::new(&node)?;
            if !pattern.is_identifier() {
                return Err(ArchGraphError::invalid_pattern(
                    node,
                    "add needs a full resource identifier",
                ));
            }
            add.push((pattern.as_str().to_string(), attributes.unwrap_or_default()));
        }

        let connect = file
            .connect
            .iter()
            .map(|(source, targets)| Ok((ResourcePattern::new(source)?, compile_links(targets)?)))
            .collect::<Result<Vec<_>>>()?;

        let disconnect = file
            .disconnect
            .iter()
            .map(|(source, targets)| {
                let targets = targets
                    .iter()
                    .map(|t| ResourcePattern::new(t))
                    .collect::<Result<Vec<_>>>()?;
                Ok((ResourcePattern::new(source)?, targets))
            })
            .collect::<Result<Vec<_>>>()?;

        let remove = file
            .remove
            .iter()
            .map(|p| ResourcePattern::new(p))
            .collect::<Result<Vec<_>>>()?;

        let update = file
            .update
            .into_iter()
            .map(|(pattern, update)| {
                Ok((
                    ResourcePattern::new(&pattern)?,
                    update.label,
                    update.attributes,
                    compile_links(&update.edge_labels)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            title: file.title,
            add,
            connect,
            disconnect,
            remove,
            update,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: AnnotationFile = serde_yaml::from_str(text)?;
        Self::compile(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let annotations = Self::from_yaml(&fs::read_to_string(path)?)?;
        info!(path = %path.display(), "loaded annotations");
        Ok(annotations)
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply every directive in section order.
    ///
    /// Annotations run after validation, so a `connect` that leaves a child
    /// in two unrelated containers is reported rather than rejected.
    pub fn apply(&self, graph: &mut GraphModel, providers: &ProviderSet) -> Vec<Diagnostic> {
        let _span = info_span!("annotate").entered();
        let mut groups = providers.group_lookup();
        let mut contained = BTreeSet::new();
        let mut diagnostics = Vec::new();
        let mut unmatched = |pattern: &ResourcePattern, section: &str| {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::Skipped,
                None,
                format!("{} pattern '{}' matched nothing", section, pattern),
            ));
        };

        if let Some(title) = &self.title {
            graph.set_title(title.clone());
        }

        for (node, attributes) in &self.add {
            if !graph.contains(node) {
                let meta = annotated_meta(graph, node);
                graph.insert_node(node.as_str(), meta);
            }
            if let Some(meta) = graph.meta_mut(node) {
                meta.attributes
                    .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            debug!(node = %node, "annotation added node");
        }

        for (source, links) in &self.connect {
            let mut sources = graph.nodes_matching(source);
            if sources.is_empty() && source.is_identifier() {
                let node = source.as_str().to_string();
                let meta = annotated_meta(graph, &node);
                graph.insert_node(node.as_str(), meta);
                sources.push(node);
            }
            if sources.is_empty() {
                unmatched(source, "connect");
                continue;
            }
            for (target, label) in links {
                let mut targets = graph.nodes_matching(target);
                if targets.is_empty() && target.is_identifier() {
                    let node = target.as_str().to_string();
                    let meta = annotated_meta(graph, &node);
                    graph.insert_node(node.as_str(), meta);
                    targets.push(node);
                }
                for from in &sources {
                    for to in targets.iter().filter(|t| *t != from) {
                        graph.add_edge(from, to);
                        if let (Some(label), Some(meta)) = (label, graph.meta_mut(from)) {
                            meta.edge_labels.insert(to.clone(), label.clone());
                        }
                        if groups.is_group(graph.resource_type_of(from)) {
                            contained.insert(to.clone());
                        }
                    }
                }
            }
        }

        for (source, targets) in &self.disconnect {
            let sources = graph.nodes_matching(source);
            if sources.is_empty() {
                unmatched(source, "disconnect");
            }
            for from in sources {
                let children: Vec<String> = graph
                    .children(&from)
                    .iter()
                    .filter(|c| targets.iter().any(|t| t.matches_node(c, graph.meta(c))))
                    .cloned()
                    .collect();
                for child in children {
                    graph.remove_edge(&from, &child);
                    debug!(from = %from, to = %child, "annotation removed edge");
                }
            }
        }

        for pattern in &self.remove {
            let nodes = graph.nodes_matching(pattern);
            if nodes.is_empty() {
                unmatched(pattern, "remove");
            }
            for node in nodes {
                graph.remove_node(&node);
            }
        }

        for (pattern, label, attributes, edge_labels) in &self.update {
            let nodes = graph.nodes_matching(pattern);
            if nodes.is_empty() {
                unmatched(pattern, "update");
            }
            for node in nodes {
                let children: Vec<String> = graph.children(&node).to_vec();
                let Some(meta) = graph.meta_mut(&node) else {
                    continue;
                };
                if let Some(label) = label {
                    meta.label = Some(label.clone());
                }
                meta.attributes
                    .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
                for (target, text) in edge_labels {
                    let Some(text) = text else { continue };
                    for child in children.iter().filter(|c| target.matches_node(c, None)) {
                        meta.edge_labels.insert(child.clone(), text.clone());
                    }
                }
            }
        }

        for child in contained.iter().filter(|c| graph.contains(c.as_str())) {
            if let Some((first, second)) = unrelated_containers(graph, &mut groups, &graph.parents(child)) {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::SharedChild,
                    Some(child.as_str()),
                    format!("connected into both {} and {}", first, second),
                ));
            }
        }

        info!(diagnostics = diagnostics.len(), "annotations applied");
        diagnostics
    }
}

/// Metadata for a node that exists only because an annotation named it.
fn annotated_meta(graph: &GraphModel, node: &str) -> NodeMeta {
    let mut meta = NodeMeta::synthetic(node);
    if meta.provider.is_empty() {
        meta.provider = graph.provider().to_string();
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Value;
    use crate::provider::CallbackRegistry;
    use pretty_assertions::assert_eq;

    fn aws() -> ProviderSet {
        ProviderSet::detect(["aws_vpc"], &[], &CallbackRegistry::builtin())
            .unwrap()
            .0
    }

    fn graph() -> GraphModel {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_subnet.a", "aws_instance.web~1");
        graph.add_edge("aws_subnet.a", "aws_instance.web~2");
        graph.add_edge("aws_instance.web~1", "aws_iam_role.app");
        graph.add_edge("aws_instance.web~2", "aws_iam_role.app");
        graph.add_edge("aws_lb.web", "aws_instance.web~1");
        graph
    }

    #[test]
    fn test_parse_all_sections() {
        let annotations = Annotations::from_yaml(
            r#"
title: Production
add:
  aws_sqs_queue.jobs: { visibility_timeout: 30 }
connect:
  aws_lambda_function.*:
    - aws_sqs_queue.jobs: consumes
    - aws_s3_bucket.data
disconnect:
  aws_instance.*: [aws_iam_role.app]
remove: [aws_cloudwatch_log_group.*]
update:
  aws_lb.web:
    label: Public ALB
    attributes: { scheme: internet-facing }
    edge_labels:
      - aws_instance.web~1: HTTPS
"#,
        )
        .unwrap();
        assert_eq!(annotations.title.as_deref(), Some("Production"));
        assert_eq!(annotations.connect[0].1.len(), 2);
        assert_eq!(annotations.connect[0].1[0].1.as_deref(), Some("consumes"));
        assert_eq!(annotations.add[0].1["visibility_timeout"], Value::Int(30));
    }

    #[test]
    fn test_add_requires_identifier() {
        let err = Annotations::from_yaml("add:\n  aws_sqs_queue.*: {}\n").unwrap_err();
        assert!(matches!(err, ArchGraphError::InvalidPattern { .. }));
    }

    #[test]
    fn test_disconnect_wildcard_sources() {
        let mut graph = graph();
        let annotations = Annotations::from_yaml("disconnect:\n  aws_instance.*: [aws_iam_role.app]\n").unwrap();
        annotations.apply(&mut graph, &aws());
        assert!(!graph.has_edge("aws_instance.web~1", "aws_iam_role.app"));
        assert!(!graph.has_edge("aws_instance.web~2", "aws_iam_role.app"));
        assert!(graph.has_edge("aws_subnet.a", "aws_instance.web~1"));
    }

    #[test]
    fn test_connect_creates_missing_target_with_label() {
        let mut graph = graph();
        let annotations = Annotations::from_yaml(
            "connect:\n  aws_lb.web:\n    - aws_s3_bucket.logs: access logs\n",
        )
        .unwrap();
        annotations.apply(&mut graph, &aws());
        assert!(graph.has_edge("aws_lb.web", "aws_s3_bucket.logs"));
        assert!(graph.meta("aws_s3_bucket.logs").unwrap().synthetic);
        assert_eq!(
            graph.meta("aws_lb.web").unwrap().edge_labels["aws_s3_bucket.logs"],
            "access logs"
        );
        assert!(graph.check_integrity("test").is_ok());
    }

    #[test]
    fn test_remove_and_update() {
        let mut graph = graph();
        let annotations = Annotations::from_yaml(
            r#"
remove: [aws_iam_role.*]
update:
  aws_lb.web:
    label: Public ALB
    edge_labels:
      - aws_instance.web~1: HTTPS
"#,
        )
        .unwrap();
        let diagnostics = annotations.apply(&mut graph, &aws());
        assert!(diagnostics.is_empty());
        assert!(!graph.contains("aws_iam_role.app"));
        let meta = graph.meta("aws_lb.web").unwrap();
        assert_eq!(meta.label.as_deref(), Some("Public ALB"));
        assert_eq!(meta.edge_labels["aws_instance.web~1"], "HTTPS");
    }

    #[test]
    fn test_unmatched_pattern_reported() {
        let mut graph = graph();
        let annotations = Annotations::from_yaml("remove: [aws_dynamodb_table.*]\n").unwrap();
        let diagnostics = annotations.apply(&mut graph, &aws());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::Skipped);
    }

    #[test]
    fn test_connect_into_unrelated_container_reported() {
        let mut graph = graph();
        graph.add_edge("aws_vpc.main", "aws_subnet.a");
        graph.add_edge("aws_vpc.other", "aws_subnet.b");
        let annotations =
            Annotations::from_yaml("connect:\n  aws_subnet.b: [aws_instance.web~1]\n").unwrap();
        let diagnostics = annotations.apply(&mut graph, &aws());
        assert!(graph.has_edge("aws_subnet.b", "aws_instance.web~1"));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::SharedChild);
        assert_eq!(diagnostics[0].node.as_deref(), Some("aws_instance.web~1"));
        assert!(diagnostics[0].message.contains("aws_subnet.a"));
        assert!(diagnostics[0].message.contains("aws_subnet.b"));
    }

    #[test]
    fn test_connect_into_nested_container_is_quiet() {
        let mut graph = graph();
        graph.add_edge("aws_vpc.main", "aws_subnet.a");
        let annotations =
            Annotations::from_yaml("connect:\n  aws_vpc.main: [aws_instance.web~1]\n").unwrap();
        assert!(annotations.apply(&mut graph, &aws()).is_empty());

        let undone = Annotations::from_yaml(
            "connect:\n  aws_subnet.b: [aws_instance.web~2]\ndisconnect:\n  aws_subnet.a: [aws_instance.web~2]\n",
        )
        .unwrap();
        assert!(undone.apply(&mut graph, &aws()).is_empty());
    }
}
