//! Multi-instance expander.
//!
//! Splits every resource whose cardinality exceeds one into siblings
//! `id~1 … id~N`, each with a deep copy of the original metadata (and its
//! own per-instance attributes when the interpreter produced them), then
//! deletes the original. Edges are redistributed per family of other ends
//! (same resource type):
//!
//! 1. siblings whose own attributes name the other end get the edge, as
//!    does the one sibling the other end's attributes name by suffix;
//! 2. a lone other end is shared by every sibling;
//! 3. suffixed other ends pair by identical suffix;
//! 4. anything else pairs by position over sorted identifiers.
//!
//! Families whose size differs from N are paired best-effort and reported
//! as approximations.
//!
//! A second pass splits any remaining node contained by two or more
//! unrelated group nodes, one sibling per container, so the no-shared-child
//! invariant holds before the handlers run.

use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info_span, warn};

use crate::graph::{id, AttrBag, Diagnostic, DiagnosticKind, GraphModel, NodeMeta, Value};
use crate::provider::ProviderSet;

/// Whether `text` names `target` as a whole identifier.
fn names_id(text: &str, target: &str) -> bool {
    let ident = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.';
    let suffixed = id::suffix(target).is_some();
    text.match_indices(target).any(|(pos, _)| {
        let before_ok = text[..pos].chars().next_back().map_or(true, |c| !ident(c));
        let after = text[pos + target.len()..].chars().next();
        let after_ok = match after {
            None => true,
            Some(c) if suffixed => c == '.' || !ident(c),
            Some(c) => !(c.is_ascii_alphanumeric() || c == '_' || c == '-'),
        };
        before_ok && after_ok
    })
}

fn bag_names(bag: &AttrBag, target: &str) -> bool {
    let mut hit = false;
    for value in bag.values() {
        value.for_each_str(&mut |s| hit = hit || names_id(s, target));
    }
    hit
}

/// One pending expansion.
struct Split {
    node: String,
    count: usize,
    /// Attribute bag per sibling, empty when unknown.
    instances: Vec<AttrBag>,
    /// Parents to pair one-to-one with siblings, in order.
    containers: Vec<String>,
}

pub struct Expander<'a> {
    providers: &'a ProviderSet,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Expander<'a> {
    pub fn new(providers: &'a ProviderSet) -> Self {
        Self {
            providers,
            diagnostics: Vec::new(),
        }
    }

    fn approximation(&mut self, node: &str, message: String) {
        warn!(node = %node, "{}", message);
        self.diagnostics.push(Diagnostic::new(
            DiagnosticKind::Approximation,
            Some(node),
            message,
        ));
    }

    /// Count and per-sibling attributes for a node, if it needs splitting.
    fn planned_split(&self, node: &str, meta: &NodeMeta) -> Option<Split> {
        if id::suffix(node).is_some() {
            return None;
        }
        if meta.cardinality > 1 {
            let instances = if meta.instances.len() == meta.cardinality {
                meta.instances.clone()
            } else {
                Vec::new()
            };
            return Some(Split {
                node: node.to_string(),
                count: meta.cardinality,
                instances,
                containers: Vec::new(),
            });
        }
        let (attribute, items) = self
            .providers
            .contexts()
            .iter()
            .flat_map(|c| c.table().cardinality_rules.iter())
            .filter(|r| r.resource_type == meta.resource_type)
            .find_map(|r| {
                let items = meta.attributes.get(&r.attribute)?.as_list()?;
                Some((r.attribute.clone(), items.to_vec()))
            })?;
        let count = items.len();
        if count < 2 {
            return None;
        }
        // Sibling i sees only the i-th entry of the list that sized it.
        let instances = items
            .into_iter()
            .map(|item| {
                let mut bag = meta.attributes.clone();
                bag.insert(attribute.clone(), Value::List(vec![item]));
                bag
            })
            .collect();
        Some(Split {
            node: node.to_string(),
            count,
            instances,
            containers: Vec::new(),
        })
    }

    /// Siblings (by index) each other end of one family is linked to.
    fn pair(
        &mut self,
        graph: &GraphModel,
        node: &str,
        split: &Split,
        family: &[String],
    ) -> Vec<(usize, String)> {
        let n = split.count;
        let mut links = Vec::new();
        let mut rest: Vec<String> = Vec::new();

        for other in family {
            let mut naming: Vec<usize> = split
                .instances
                .iter()
                .enumerate()
                .filter(|(_, bag)| bag_names(bag, other))
                .map(|(i, _)| i)
                .collect();
            if naming.is_empty() {
                if let Some(other_meta) = graph.meta(other) {
                    naming = (0..n)
                        .filter(|i| bag_names(&other_meta.attributes, &id::with_suffix(node, i + 1)))
                        .collect();
                }
            }
            if naming.is_empty() {
                rest.push(other.clone());
            } else {
                links.extend(naming.into_iter().map(|i| (i, other.clone())));
            }
        }

        match rest.len() {
            0 => {}
            1 => links.extend((0..n).map(|i| (i, rest[0].clone()))),
            len => {
                let suffixes: Vec<Option<usize>> = rest.iter().map(|o| id::suffix(o)).collect();
                let distinct: HashSet<usize> = suffixes.iter().flatten().copied().collect();
                if suffixes.iter().all(Option::is_some) && distinct.len() == len {
                    for (other, s) in rest.iter().zip(suffixes.into_iter().flatten()) {
                        if s > n {
                            self.approximation(
                                node,
                                format!("no sibling with suffix {} for '{}', wrapped around", s, other),
                            );
                        }
                        links.push(((s - 1) % n, other.clone()));
                    }
                } else {
                    if len != n {
                        self.approximation(
                            node,
                            format!(
                                "{} instances paired positionally with {} related nodes",
                                n, len
                            ),
                        );
                    }
                    for (j, other) in rest.iter().enumerate() {
                        links.push((j % n, other.clone()));
                    }
                }
            }
        }
        links
    }

    /// Group other ends by resource type, each family sorted.
    fn families(graph: &GraphModel, ends: &[String]) -> Vec<Vec<String>> {
        let mut by_type: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for end in ends {
            by_type
                .entry(graph.resource_type_of(end))
                .or_default()
                .push(end.clone());
        }
        by_type
            .into_values()
            .map(|mut family| {
                family.sort();
                family
            })
            .collect()
    }

    fn apply(&mut self, graph: &mut GraphModel, split: Split) {
        let node = split.node.clone();
        let Some(meta) = graph.meta(&node).cloned() else {
            return;
        };
        let siblings: Vec<String> = (1..=split.count).map(|i| id::with_suffix(&node, i)).collect();
        if let Some(taken) = siblings.iter().find(|s| graph.contains(s)) {
            let message = format!("cannot expand, '{}' already exists", taken);
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::Skipped,
                Some(node.as_str()),
                message,
            ));
            return;
        }

        let children = graph.children(&node).to_vec();
        let parents: Vec<String> = graph
            .parents(&node)
            .into_iter()
            .filter(|p| !split.containers.contains(p))
            .collect();

        for (i, sibling) in siblings.iter().enumerate() {
            let mut copy = meta.clone();
            copy.cardinality = 1;
            copy.instances.clear();
            copy.edge_labels.clear();
            copy.instance_keys = meta.instance_keys.get(i).cloned().into_iter().collect();
            if let Some(bag) = split.instances.get(i) {
                copy.attributes = bag.clone();
            }
            graph.insert_node(sibling.as_str(), copy);
        }

        let outgoing: Vec<(usize, String)> = Self::families(graph, &children)
            .iter()
            .flat_map(|family| self.pair(graph, &node, &split, family))
            .collect();
        for (i, child) in outgoing {
            graph.add_edge(&siblings[i], &child);
            if let Some(label) = meta.edge_labels.get(&child) {
                if let Some(m) = graph.meta_mut(&siblings[i]) {
                    m.edge_labels.insert(child.clone(), label.clone());
                }
            }
        }

        let mut incoming: Vec<(usize, String)> = split
            .containers
            .iter()
            .enumerate()
            .map(|(i, c)| (i % split.count, c.clone()))
            .collect();
        let paired: Vec<(usize, String)> = Self::families(graph, &parents)
            .iter()
            .flat_map(|family| self.pair(graph, &node, &split, family))
            .collect();
        incoming.extend(paired);
        for (i, parent) in incoming {
            graph.add_edge(&parent, &siblings[i]);
            let label = graph
                .meta(&parent)
                .and_then(|m| m.edge_labels.get(&node))
                .cloned();
            if let (Some(label), Some(m)) = (label, graph.meta_mut(&parent)) {
                m.edge_labels.insert(siblings[i].clone(), label);
            }
        }

        graph.remove_node(&node);
        debug!(node = %node, count = split.count, "expanded multi-instance resource");
    }

    /// Group parents of `node` that are not ancestors of another group parent.
    fn innermost_groups(&self, graph: &GraphModel, node: &str) -> Vec<String> {
        let groups: Vec<String> = graph
            .parents(node)
            .into_iter()
            .filter(|p| self.providers.is_group(graph.resource_type_of(p)))
            .collect();
        let mut innermost: Vec<String> = groups
            .iter()
            .filter(|g| {
                !groups
                    .iter()
                    .any(|h| h != *g && graph.ancestors(h).contains(*g))
            })
            .cloned()
            .collect();
        innermost.sort();
        innermost
    }

    pub fn run(mut self, graph: &mut GraphModel) -> Vec<Diagnostic> {
        let _span = info_span!("expand").entered();

        let splits: Vec<Split> = graph
            .sorted_ids()
            .into_iter()
            .filter_map(|node| {
                let meta = graph.meta(&node)?;
                self.planned_split(&node, meta)
            })
            .collect();
        for split in splits {
            self.apply(graph, split);
        }

        // Nodes still shared by unrelated containers.
        for node in graph.sorted_ids() {
            if !graph.contains(&node) || self.providers.is_group(graph.resource_type_of(&node)) {
                continue;
            }
            let containers = self.innermost_groups(graph, &node);
            if containers.len() < 2 {
                continue;
            }
            if id::suffix(&node).is_some() {
                let own = id::suffix(&node);
                let keep = containers
                    .iter()
                    .find(|c| id::suffix(c) == own)
                    .unwrap_or(&containers[0])
                    .clone();
                for container in containers.iter().filter(|c| **c != keep) {
                    graph.remove_edge(container, &node);
                }
                self.approximation(
                    &node,
                    format!("already numbered, kept only in '{}'", keep),
                );
                continue;
            }
            let split = Split {
                node: node.clone(),
                count: containers.len(),
                instances: Vec::new(),
                containers,
            };
            self.apply(graph, split);
        }
        self.diagnostics
    }
}

/// Expand every multi-instance resource in the graph.
pub fn expand(graph: &mut GraphModel, providers: &ProviderSet) -> Vec<Diagnostic> {
    Expander::new(providers).run(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CallbackRegistry;
    use pretty_assertions::assert_eq;

    fn aws() -> ProviderSet {
        ProviderSet::detect(["aws_vpc"], &[], &CallbackRegistry::builtin())
            .unwrap()
            .0
    }

    fn with_meta(graph: &mut GraphModel, node: &str, f: impl FnOnce(&mut NodeMeta)) {
        graph.ensure_node(node);
        f(graph.meta_mut(node).unwrap());
    }

    #[test]
    fn test_names_id_boundaries() {
        assert!(names_id("aws_subnet.a", "aws_subnet.a"));
        assert!(names_id("[aws_subnet.a~2]", "aws_subnet.a~2"));
        assert!(!names_id("aws_subnet.a~12", "aws_subnet.a~1"));
        assert!(!names_id("aws_subnet.ab", "aws_subnet.a"));
        assert!(!names_id("module.x.aws_subnet.a", "aws_subnet.a"));
    }

    #[test]
    fn test_explicit_count_replaces_original() {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_subnet.a", "aws_instance.web");
        with_meta(&mut graph, "aws_instance.web", |m| m.cardinality = 3);

        let diagnostics = expand(&mut graph, &aws());
        assert!(diagnostics.is_empty());
        assert!(!graph.contains("aws_instance.web"));
        assert_eq!(
            graph.children("aws_subnet.a"),
            ["aws_instance.web~1", "aws_instance.web~2", "aws_instance.web~3"]
        );
        assert_eq!(graph.meta("aws_instance.web~2").unwrap().cardinality, 1);
        assert!(graph.check_integrity("expand").is_ok());
    }

    #[test]
    fn test_other_end_naming_one_sibling() {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_subnet.private", "aws_nat_gateway.nat");
        with_meta(&mut graph, "aws_subnet.private", |m| m.cardinality = 2);
        with_meta(&mut graph, "aws_nat_gateway.nat", |m| {
            m.attributes
                .insert("subnet_id".into(), Value::string("aws_subnet.private~2"));
        });

        expand(&mut graph, &aws());
        assert!(graph.children("aws_subnet.private~1").is_empty());
        assert_eq!(graph.children("aws_subnet.private~2"), ["aws_nat_gateway.nat"]);
    }

    #[test]
    fn test_load_balancer_split_across_subnets() {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_vpc.main", "aws_subnet.a");
        graph.add_edge("aws_vpc.main", "aws_subnet.b");
        graph.add_edge("aws_subnet.a", "aws_lb.web");
        graph.add_edge("aws_subnet.b", "aws_lb.web");
        graph.add_edge("aws_lb.web", "aws_security_group.lb");
        with_meta(&mut graph, "aws_lb.web", |m| {
            m.attributes.insert(
                "subnets".into(),
                Value::List(vec![Value::string("aws_subnet.a"), Value::string("aws_subnet.b")]),
            );
        });

        expand(&mut graph, &aws());
        assert_eq!(graph.children("aws_subnet.a"), ["aws_lb.web~1"]);
        assert_eq!(graph.children("aws_subnet.b"), ["aws_lb.web~2"]);
        assert!(graph.has_edge("aws_lb.web~1", "aws_security_group.lb"));
        assert!(graph.has_edge("aws_lb.web~2", "aws_security_group.lb"));
    }

    #[test]
    fn test_suffix_pairing_between_families() {
        let mut graph = GraphModel::new("aws");
        for n in 1..=2 {
            graph.add_edge(&format!("aws_subnet.a~{}", n), "aws_instance.web");
        }
        with_meta(&mut graph, "aws_instance.web", |m| m.cardinality = 2);
        expand(&mut graph, &aws());
        assert_eq!(graph.children("aws_subnet.a~1"), ["aws_instance.web~1"]);
        assert_eq!(graph.children("aws_subnet.a~2"), ["aws_instance.web~2"]);
    }

    #[test]
    fn test_per_instance_attributes_drive_pairing() {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_instance.web", "aws_security_group.a");
        graph.add_edge("aws_instance.web", "aws_security_group.b");
        with_meta(&mut graph, "aws_instance.web", |m| {
            m.cardinality = 2;
            let bag = |sgs: &[&str]| {
                let mut bag = AttrBag::new();
                bag.insert(
                    "vpc_security_group_ids".into(),
                    Value::List(sgs.iter().map(|s| Value::string(*s)).collect()),
                );
                bag
            };
            m.instances = vec![
                bag(&["aws_security_group.a", "aws_security_group.b"]),
                bag(&["aws_security_group.a", "aws_security_group.b"]),
            ];
        });
        expand(&mut graph, &aws());
        for n in 1..=2 {
            let sibling = format!("aws_instance.web~{}", n);
            assert!(graph.has_edge(&sibling, "aws_security_group.a"));
            assert!(graph.has_edge(&sibling, "aws_security_group.b"));
        }
    }

    #[test]
    fn test_unequal_families_flagged() {
        let mut graph = GraphModel::new("aws");
        for role in ["aws_iam_role.a", "aws_iam_role.b", "aws_iam_role.c"] {
            graph.add_edge("aws_instance.web", role);
        }
        with_meta(&mut graph, "aws_instance.web", |m| m.cardinality = 2);
        let diagnostics = expand(&mut graph, &aws());
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Approximation));
        assert_eq!(
            graph.children("aws_instance.web~1"),
            ["aws_iam_role.a", "aws_iam_role.c"]
        );
        assert_eq!(graph.children("aws_instance.web~2"), ["aws_iam_role.b"]);
    }

    #[test]
    fn test_shared_child_split_per_container() {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_vpc.main", "aws_subnet.a");
        graph.add_edge("aws_vpc.main", "aws_subnet.b");
        graph.add_edge("aws_subnet.a", "aws_db_subnet_group.db");
        graph.add_edge("aws_subnet.b", "aws_db_subnet_group.db");
        // The vpc is an ancestor of both subnets, so it does not count.
        graph.add_edge("aws_vpc.main", "aws_db_subnet_group.db");

        expand(&mut graph, &aws());
        assert_eq!(graph.children("aws_subnet.a"), ["aws_db_subnet_group.db~1"]);
        assert_eq!(graph.children("aws_subnet.b"), ["aws_db_subnet_group.db~2"]);
        assert!(!graph.contains("aws_db_subnet_group.db"));
    }

    #[test]
    fn test_existing_sibling_blocks_expansion() {
        let mut graph = GraphModel::new("aws");
        graph.ensure_node("aws_instance.web~1");
        with_meta(&mut graph, "aws_instance.web", |m| m.cardinality = 2);
        let diagnostics = expand(&mut graph, &aws());
        assert_eq!(diagnostics[0].kind, DiagnosticKind::Skipped);
        assert!(graph.contains("aws_instance.web"));
    }
}
