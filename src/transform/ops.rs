//! Declarative operation library.
//!
//! Each [`Operation`] is a tagged parameter bag (`op: reverse_relation`,
//! …) read from handler tables. Operations that act on "the resource"
//! default to the nodes matched by the handler's own pattern.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::debug;

use crate::graph::{id, Diagnostic, DiagnosticKind, GraphModel, NodeMeta, Value};
use crate::pattern::ResourcePattern;
use crate::provider::ProviderSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    InsertIntermediate {
        parent: ResourcePattern,
        child: ResourcePattern,
        generator: NameGenerator,
    },
    ReverseRelation {
        #[serde(default)]
        resource: Option<ResourcePattern>,
    },
    Consolidate {
        resource_type: ResourcePattern,
        target: String,
    },
    PropagateMetadata {
        key: String,
        direction: Direction,
        #[serde(default)]
        aggregation: Aggregation,
        #[serde(default)]
        transitive: bool,
        #[serde(default)]
        resource: Option<ResourcePattern>,
    },
    MatchBySuffix {
        first: ResourcePattern,
        second: ResourcePattern,
    },
    Move {
        #[serde(default)]
        resource: Option<ResourcePattern>,
        to: ResourcePattern,
    },
    Relink {
        from: ResourcePattern,
        to: ResourcePattern,
        action: LinkAction,
    },
    Delete {
        #[serde(default)]
        resource: Option<ResourcePattern>,
        /// Splice the node out, connecting its parents to its children.
        #[serde(default)]
        keep_edges: bool,
    },
    Group {
        container: String,
        members: Vec<ResourcePattern>,
    },
}

/// Derives an intermediate node id from a child's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameGenerator {
    pub resource_type: String,
    /// Child attribute whose value names the intermediate node.
    pub attribute: String,
    #[serde(default)]
    pub prefix: String,
    /// Used when the attribute is missing or unresolved.
    #[serde(default)]
    pub fallback: Option<String>,
    /// Append the child's instance suffix.
    #[serde(default)]
    pub include_suffix: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Copy a node's value onto its parents.
    Up,
    /// Copy a node's value onto its children.
    Down,
    /// Aggregate the children's values onto the node.
    FromChildren,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Max,
    Min,
    Sum,
    Replace,
    KeepExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkAction {
    Add,
    Remove,
}

/// What an operation may consult besides the graph.
pub struct OpContext<'a> {
    pub providers: &'a ProviderSet,
    /// Pattern of the handler running the operation.
    pub subject: &'a ResourcePattern,
    pub diagnostics: &'a mut Vec<Diagnostic>,
}

impl OpContext<'_> {
    fn skipped(&mut self, node: Option<&str>, message: String) {
        debug!(node = ?node, "{}", message);
        self.diagnostics
            .push(Diagnostic::new(DiagnosticKind::Skipped, node, message));
    }

    fn is_group(&self, graph: &GraphModel, node: &str) -> bool {
        self.providers.is_group(graph.resource_type_of(node))
    }
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::InsertIntermediate { .. } => "insert_intermediate",
            Operation::ReverseRelation { .. } => "reverse_relation",
            Operation::Consolidate { .. } => "consolidate",
            Operation::PropagateMetadata { .. } => "propagate_metadata",
            Operation::MatchBySuffix { .. } => "match_by_suffix",
            Operation::Move { .. } => "move",
            Operation::Relink { .. } => "relink",
            Operation::Delete { .. } => "delete",
            Operation::Group { .. } => "group",
        }
    }

    pub fn apply(&self, graph: &mut GraphModel, ctx: &mut OpContext<'_>) {
        match self {
            Operation::InsertIntermediate {
                parent,
                child,
                generator,
            } => insert_intermediate(graph, ctx, parent, child, generator),
            Operation::ReverseRelation { resource } => {
                let pattern = resource.as_ref().unwrap_or(ctx.subject).clone();
                reverse_relation(graph, ctx, &pattern)
            }
            Operation::Consolidate {
                resource_type,
                target,
            } => consolidate(graph, resource_type, target),
            Operation::PropagateMetadata {
                key,
                direction,
                aggregation,
                transitive,
                resource,
            } => {
                let pattern = resource.as_ref().unwrap_or(ctx.subject);
                propagate_metadata(graph, pattern, key, *direction, *aggregation, *transitive)
            }
            Operation::MatchBySuffix { first, second } => match_by_suffix(graph, first, second),
            Operation::Move { resource, to } => {
                let pattern = resource.as_ref().unwrap_or(ctx.subject).clone();
                move_nodes(graph, ctx, &pattern, to)
            }
            Operation::Relink { from, to, action } => relink(graph, ctx, from, to, *action),
            Operation::Delete {
                resource,
                keep_edges,
            } => {
                let pattern = resource.as_ref().unwrap_or(ctx.subject);
                delete(graph, pattern, *keep_edges)
            }
            Operation::Group { container, members } => group(graph, ctx, container, members),
        }
    }
}

// ─── insert_intermediate ────────────────────────────────────────

impl NameGenerator {
    /// Text naming the intermediate node for a child.
    pub fn value(&self, meta: Option<&NodeMeta>) -> Option<String> {
        meta.and_then(|m| m.attributes.get(&self.attribute))
            .and_then(|v| match v {
                Value::List(items) => items.iter().find_map(|i| i.as_str().map(str::to_string)),
                Value::Unresolved(_) | Value::Null | Value::Map(_) => None,
                other => Some(other.to_template_string()),
            })
            .filter(|v| !v.is_empty())
            .or_else(|| self.fallback.clone())
    }

    /// Intermediate id for a child, or `None` when nothing names it.
    pub fn node_id(&self, child: &str, meta: Option<&NodeMeta>) -> Option<String> {
        let value = self.value(meta)?;
        let module = meta.map(|m| m.module.as_str()).unwrap_or_default();
        let name = id::sanitize(&format!("{}{}", self.prefix, value));
        if name.is_empty() {
            return None;
        }
        let base = id::qualified(module, &self.resource_type, &name);
        Some(match (self.include_suffix, id::suffix(child)) {
            (true, Some(n)) => id::with_suffix(&base, n),
            _ => base,
        })
    }
}

fn insert_intermediate(
    graph: &mut GraphModel,
    ctx: &mut OpContext<'_>,
    parent: &ResourcePattern,
    child: &ResourcePattern,
    generator: &NameGenerator,
) {
    for p in graph.nodes_matching(parent) {
        let children: Vec<String> = graph
            .children(&p)
            .iter()
            .filter(|c| child.matches_node(c, graph.meta(c)))
            .cloned()
            .collect();
        for c in children {
            let Some(intermediate) = generator.node_id(&c, graph.meta(&c)) else {
                ctx.skipped(
                    Some(c.as_str()),
                    format!("no '{}' value to name an intermediate node", generator.attribute),
                );
                continue;
            };
            if intermediate == p || intermediate == c {
                continue;
            }
            if !graph.contains(&intermediate) {
                // Child metadata is copied only when the node is first made.
                let mut meta = graph
                    .meta(&c)
                    .cloned()
                    .unwrap_or_else(|| NodeMeta::for_id(&c));
                let fresh = NodeMeta::synthetic(&intermediate);
                meta.resource_type = fresh.resource_type;
                meta.name = fresh.name;
                meta.module = fresh.module;
                meta.synthetic = true;
                meta.hidden = false;
                meta.cardinality = 1;
                meta.instances.clear();
                meta.instance_keys.clear();
                meta.variant = None;
                meta.edge_labels.clear();
                meta.label = generator.value(graph.meta(&c));
                graph.insert_node(intermediate.as_str(), meta);
                debug!(node = %intermediate, parent = %p, "created intermediate node");
            }
            graph.replace_child(&p, &c, &intermediate);
            graph.add_edge(&intermediate, &c);
        }
    }
}

// ─── reverse_relation ───────────────────────────────────────────

fn group_parents(graph: &GraphModel, ctx: &OpContext<'_>, node: &str) -> Vec<String> {
    graph
        .parents(node)
        .into_iter()
        .filter(|p| ctx.is_group(graph, p))
        .collect()
}

/// Pick a suffix per referencing parent: suffixed parents keep theirs,
/// the rest take the lowest free numbers.
fn clone_suffixes(parents: &[String]) -> Vec<usize> {
    let mut taken: BTreeSet<usize> = BTreeSet::new();
    let mut assigned: Vec<Option<usize>> = parents
        .iter()
        .map(|p| id::suffix(p).filter(|n| taken.insert(*n)))
        .collect();
    let mut next = 1;
    for slot in assigned.iter_mut().filter(|s| s.is_none()) {
        while taken.contains(&next) {
            next += 1;
        }
        taken.insert(next);
        *slot = Some(next);
    }
    assigned.into_iter().map(|s| s.unwrap_or(next)).collect()
}

fn reverse_relation(graph: &mut GraphModel, ctx: &mut OpContext<'_>, pattern: &ResourcePattern) {
    for r in graph.nodes_matching(pattern) {
        if !graph.contains(&r) {
            continue;
        }
        let referencing: Vec<String> = graph
            .parents(&r)
            .into_iter()
            .filter(|p| {
                !ctx.is_group(graph, p) && !graph.meta(p).is_some_and(|m| m.hidden)
            })
            .collect();
        let own_groups = group_parents(graph, ctx, &r);

        match referencing.len() {
            0 => {}
            1 => {
                let p = &referencing[0];
                graph.remove_edge(p, &r);
                let outer: Vec<String> = group_parents(graph, ctx, p)
                    .into_iter()
                    .filter(|g| *g != r)
                    .collect();
                if !outer.is_empty() {
                    for g in &own_groups {
                        graph.remove_edge(g, &r);
                    }
                    for g in &outer {
                        graph.replace_child(g, p, &r);
                    }
                }
                graph.add_edge(&r, p);

                if let (Some(n), None) = (id::suffix(p), id::suffix(&r)) {
                    let renamed = id::with_suffix(&r, n);
                    if graph.rename_node(&r, &renamed) {
                        debug!(node = %renamed, "propagated parent suffix");
                    }
                }
            }
            _ => {
                let mut sorted = referencing.clone();
                sorted.sort();
                let suffixes = clone_suffixes(&sorted);
                let base = id::base(&r).to_string();
                let template = graph.meta(&r).cloned().unwrap_or_else(|| NodeMeta::for_id(&r));
                let own_children: Vec<String> = graph.children(&r).to_vec();
                // Gone before any clone is named, so no clone can take its id.
                graph.remove_node(&r);

                for (index, (p, n)) in sorted.iter().zip(suffixes).enumerate() {
                    let mut n = n;
                    let mut clone = id::with_suffix(&base, n);
                    while graph.contains(&clone) {
                        n += 1;
                        clone = id::with_suffix(&base, n);
                    }
                    let mut meta = template.clone();
                    meta.cardinality = 1;
                    meta.instances.clear();
                    graph.insert_node(clone.as_str(), meta);

                    // Only one clone may keep the original's own children.
                    if index == 0 {
                        for child in &own_children {
                            graph.add_edge(&clone, child);
                        }
                    }
                    graph.add_edge(&clone, p);

                    let outer: Vec<String> = group_parents(graph, ctx, p)
                        .into_iter()
                        .filter(|g| *g != r && id::base(g) != base)
                        .collect();
                    if outer.is_empty() {
                        for g in &own_groups {
                            graph.add_edge(g, &clone);
                        }
                    } else {
                        for g in &outer {
                            graph.replace_child(g, p, &clone);
                        }
                    }
                }
                debug!(node = %r, clones = sorted.len(), "cloned protective resource per parent");
            }
        }
    }
}

// ─── consolidate ────────────────────────────────────────────────

fn consolidate(graph: &mut GraphModel, resource_type: &ResourcePattern, target: &str) {
    let members: Vec<String> = graph
        .nodes_matching(resource_type)
        .into_iter()
        .filter(|m| m != target)
        .collect();
    let Some(first) = members.first() else {
        return;
    };
    if !graph.contains(target) {
        let fresh = NodeMeta::for_id(target);
        let mut meta = graph.meta(first).cloned().unwrap_or_default();
        meta.resource_type = fresh.resource_type;
        meta.name = fresh.name;
        meta.module = fresh.module;
        meta.cardinality = 1;
        meta.instances.clear();
        meta.instance_keys.clear();
        meta.edge_labels.clear();
        graph.insert_node(target, meta);
    }
    for member in &members {
        for child in graph.children(member).to_vec() {
            graph.add_edge(target, &child);
        }
        for parent in graph.parents(member) {
            if parent != target {
                graph.replace_child(&parent, member, target);
            }
        }
        graph.remove_node(member);
    }
    debug!(target = %target, merged = members.len(), "consolidated nodes");
}

// ─── propagate_metadata ─────────────────────────────────────────

fn read_key(graph: &GraphModel, node: &str, key: &str) -> Option<Value> {
    let meta = graph.meta(node)?;
    if key == "cardinality" {
        return Some(Value::Int(meta.cardinality as i64));
    }
    meta.attributes.get(key).filter(|v| !v.is_null()).cloned()
}

fn write_key(graph: &mut GraphModel, node: &str, key: &str, value: Value) {
    let Some(meta) = graph.meta_mut(node) else {
        return;
    };
    if key == "cardinality" {
        if let Some(n) = value.as_i64().and_then(|n| usize::try_from(n).ok()) {
            meta.cardinality = n.max(1);
        }
        return;
    }
    meta.attributes.insert(key.to_string(), value);
}

fn numeric(a: &Value, b: &Value, int: fn(i64, i64) -> i64, float: fn(f64, f64) -> f64) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(int(*x, *y))),
        _ => Some(Value::Float(float(a.as_f64()?, b.as_f64()?))),
    }
}

/// Combine an incoming value with what the target already holds.
fn combine(existing: Option<Value>, incoming: Value, aggregation: Aggregation) -> Option<Value> {
    let Some(existing) = existing else {
        return Some(incoming);
    };
    match aggregation {
        Aggregation::Replace => Some(incoming),
        Aggregation::KeepExisting => None,
        Aggregation::Max => numeric(&existing, &incoming, i64::max, f64::max),
        Aggregation::Min => numeric(&existing, &incoming, i64::min, f64::min),
        Aggregation::Sum => numeric(&existing, &incoming, i64::saturating_add, |a, b| a + b),
    }
}

/// Nodes one step (or, transitively, any number of steps) away.
fn reach(graph: &GraphModel, start: &str, up: bool, transitive: bool) -> Vec<String> {
    let step = |n: &str| -> Vec<String> {
        if up {
            graph.parents(n)
        } else {
            graph.children(n).to_vec()
        }
    };
    if !transitive {
        return step(start);
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<String> = step(start).into();
    while let Some(node) = queue.pop_front() {
        if node == start || !seen.insert(node.clone()) {
            continue;
        }
        queue.extend(step(&node));
        order.push(node);
    }
    order
}

fn propagate_metadata(
    graph: &mut GraphModel,
    pattern: &ResourcePattern,
    key: &str,
    direction: Direction,
    aggregation: Aggregation,
    transitive: bool,
) {
    for node in graph.nodes_matching(pattern) {
        match direction {
            Direction::Up | Direction::Down => {
                let Some(value) = read_key(graph, &node, key) else {
                    continue;
                };
                for target in reach(graph, &node, direction == Direction::Up, transitive) {
                    let existing = read_key(graph, &target, key);
                    if let Some(merged) = combine(existing, value.clone(), aggregation) {
                        write_key(graph, &target, key, merged);
                    }
                }
            }
            Direction::FromChildren => {
                let mut aggregate: Option<Value> = None;
                for child in reach(graph, &node, false, transitive) {
                    if let Some(value) = read_key(graph, &child, key) {
                        let folded = combine(aggregate.clone(), value, aggregation);
                        if folded.is_some() {
                            aggregate = folded;
                        }
                    }
                }
                let Some(aggregate) = aggregate else {
                    continue;
                };
                let existing = read_key(graph, &node, key);
                let value = match (aggregation, existing) {
                    (Aggregation::KeepExisting, Some(_)) => continue,
                    _ => aggregate,
                };
                write_key(graph, &node, key, value);
            }
        }
    }
}

// ─── match_by_suffix ────────────────────────────────────────────

fn match_by_suffix(graph: &mut GraphModel, first: &ResourcePattern, second: &ResourcePattern) {
    let mut removed = 0;
    for a in graph.nodes_matching(first) {
        let Some(sa) = id::suffix(&a) else {
            continue;
        };
        let cross = |graph: &GraphModel, b: &String| {
            second.matches_node(b, graph.meta(b)) && id::suffix(b).is_some_and(|sb| sb != sa)
        };
        let children: Vec<String> = graph
            .children(&a)
            .iter()
            .filter(|b| cross(graph, *b))
            .cloned()
            .collect();
        for b in children {
            removed += usize::from(graph.remove_edge(&a, &b));
        }
        let parents: Vec<String> = graph.parents(&a).into_iter().filter(|b| cross(graph, b)).collect();
        for b in parents {
            removed += usize::from(graph.remove_edge(&b, &a));
        }
    }
    debug!(first = %first, second = %second, removed, "matched families by suffix");
}

// ─── move / relink / delete / group ─────────────────────────────

/// Closest node matching `to`, searching neighbours in both directions
/// up to two steps. Same-suffix candidates win ties.
fn nearest(graph: &GraphModel, node: &str, to: &ResourcePattern) -> Option<String> {
    let neighbours = |n: &str| -> Vec<String> {
        let mut all: Vec<String> = graph.children(n).to_vec();
        all.extend(graph.parents(n));
        all
    };
    let mut frontier = vec![node.to_string()];
    let mut seen: HashSet<String> = frontier.iter().cloned().collect();
    for _ in 0..2 {
        let mut next = Vec::new();
        for n in &frontier {
            for m in neighbours(n) {
                if seen.insert(m.clone()) {
                    next.push(m);
                }
            }
        }
        let mut hits: Vec<&String> = next.iter().filter(|m| to.matches_node(m, graph.meta(m))).collect();
        hits.sort();
        let own = id::suffix(node);
        if let Some(hit) = hits.iter().find(|h| own.is_some() && id::suffix(h) == own).or(hits.first()) {
            return Some((*hit).clone());
        }
        frontier = next;
    }
    None
}

fn move_nodes(
    graph: &mut GraphModel,
    ctx: &mut OpContext<'_>,
    pattern: &ResourcePattern,
    to: &ResourcePattern,
) {
    for node in graph.nodes_matching(pattern) {
        let Some(target) = nearest(graph, &node, to) else {
            ctx.skipped(Some(node.as_str()), format!("no '{}' nearby to move into", to));
            continue;
        };
        for p in graph.parents(&node) {
            if p != target && ctx.is_group(graph, &p) {
                graph.remove_edge(&p, &node);
            }
        }
        graph.remove_edge(&node, &target);
        graph.add_edge(&target, &node);
    }
}

fn relink(
    graph: &mut GraphModel,
    ctx: &mut OpContext<'_>,
    from: &ResourcePattern,
    to: &ResourcePattern,
    action: LinkAction,
) {
    let sources = graph.nodes_matching(from);
    let targets = graph.nodes_matching(to);
    if targets.is_empty() || sources.is_empty() {
        ctx.skipped(None, format!("relink {} -> {} matched nothing", from, to));
        return;
    }
    for s in &sources {
        for t in &targets {
            match action {
                LinkAction::Add => {
                    graph.add_edge(s, t);
                }
                LinkAction::Remove => {
                    graph.remove_edge(s, t);
                }
            }
        }
    }
}

fn delete(graph: &mut GraphModel, pattern: &ResourcePattern, keep_edges: bool) {
    for node in graph.nodes_matching(pattern) {
        if keep_edges {
            let children = graph.children(&node).to_vec();
            for parent in graph.parents(&node) {
                for child in &children {
                    graph.add_edge(&parent, child);
                }
            }
        }
        graph.remove_node(&node);
    }
}

fn group(graph: &mut GraphModel, ctx: &mut OpContext<'_>, container: &str, members: &[ResourcePattern]) {
    let found: BTreeSet<String> = members
        .iter()
        .flat_map(|pattern| graph.nodes_matching(pattern))
        .filter(|m| m != container)
        .collect();
    if found.is_empty() {
        return;
    }
    if !graph.contains(container) {
        let mut meta = NodeMeta::synthetic(container);
        meta.provider = graph.provider().to_string();
        graph.insert_node(container, meta);
    }
    for member in &found {
        for p in graph.parents(member) {
            if p != container && ctx.is_group(graph, &p) {
                graph.remove_edge(&p, member);
            }
        }
        graph.add_edge(container, member);
    }
    debug!(container = %container, members = found.len(), "grouped nodes");
}
