//! Fixed-point resolution of a record set.
//!
//! Every value that can be referenced is a slot: module variables, locals,
//! module outputs, a resource's cardinality, and each attribute of each
//! resource instance. Passes evaluate pending slots until a pass makes no
//! progress or the iteration budget runs out. Slots left over are split
//! into reference cycles and plain unresolved values by running Tarjan's
//! SCC algorithm over the slot reference graph; both end up as
//! `{"$unresolved": …}` placeholders.

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, info_span, warn};

use super::eval::{self, EvalError, EvalResult, Evaluator, Lookup, Scope, Step};
use super::expr::{parse_expression, parse_template, Expr, Reference};
use crate::graph::{id, AttrBag, Diagnostic, DiagnosticKind, Value};
use crate::plan::{child_module_path, DependencyEdge, PlanInput, ResourceRecord};

pub const DEFAULT_MAX_ITERATIONS: usize = 64;

/// Root names that never refer to a resource.
const RESERVED_ROOTS: &[&str] = &[
    "var", "local", "module", "data", "count", "each", "path", "terraform", "self",
];

/// A resource with every attribute reduced as far as possible.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    pub id: String,
    pub resource_type: String,
    pub name: String,
    pub module: String,
    pub raw: AttrBag,
    /// Attributes of the first (or only) instance.
    pub attributes: AttrBag,
    /// One bag per instance when there is more than one.
    pub instances: Vec<AttrBag>,
    /// `for_each` keys in enumeration order.
    pub instance_keys: Vec<String>,
    pub cardinality: usize,
    /// Resources named directly in attribute, `count` or `for_each`
    /// expressions.
    pub references: BTreeSet<String>,
    /// Resolved `depends_on` targets.
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub resources: Vec<ResolvedResource>,
    /// Coarse edges from the planning tool between managed resources.
    pub dependencies: Vec<DependencyEdge>,
    pub diagnostics: Vec<Diagnostic>,
    /// Passes the fixed-point loop ran.
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub struct Interpreter {
    max_iterations: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

impl Interpreter {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn resolve(&self, plan: &PlanInput) -> Resolution {
        let span = info_span!("interpret", resources = plan.resources.len());
        let _enter = span.enter();

        let mut state = State::new(plan);
        let iterations = state.run(self.max_iterations);
        let mut resolution = state.finish(plan);
        resolution.iterations = iterations;

        info!(
            resources = resolution.resources.len(),
            diagnostics = resolution.diagnostics.len(),
            iterations,
            "interpretation complete"
        );
        resolution
    }
}

// ─── Slots ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum SlotKey {
    Variable { module: String, name: String },
    Local { module: String, name: String },
    Output { module: String, name: String },
    Cardinality { resource: String },
    Attribute { resource: String, instance: usize, key: String },
}

impl SlotKey {
    fn resource(&self) -> Option<&str> {
        match self {
            SlotKey::Cardinality { resource } | SlotKey::Attribute { resource, .. } => {
                Some(resource)
            }
            _ => None,
        }
    }
}

fn scoped(module: &str, text: &str) -> String {
    if module.is_empty() {
        text.to_string()
    } else {
        format!("{}.{}", module, text)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Variable { module, name } => write!(f, "{}", scoped(module, &format!("var.{}", name))),
            SlotKey::Local { module, name } => write!(f, "{}", scoped(module, &format!("local.{}", name))),
            SlotKey::Output { module, name } => write!(f, "{}.output.{}", module, name),
            SlotKey::Cardinality { resource } => write!(f, "{}.count", resource),
            SlotKey::Attribute {
                resource,
                instance,
                key,
            } => write!(f, "{}[{}].{}", resource, instance, key),
        }
    }
}

/// An attribute value with its templates parsed.
#[derive(Debug, Clone)]
enum Compiled {
    Literal(Value),
    /// Parsed expression plus the text used for its placeholder.
    Expr(Expr, String),
    List(Vec<Compiled>),
    Map(BTreeMap<String, Compiled>),
}

impl Compiled {
    fn eval(&self, ev: &mut Evaluator<'_>) -> EvalResult {
        match self {
            Compiled::Literal(v) => Ok(v.clone()),
            Compiled::Expr(e, _) => ev.eval(e),
            Compiled::List(items) => items
                .iter()
                .map(|c| c.eval(ev))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Compiled::Map(map) => {
                let mut out = BTreeMap::new();
                for (k, c) in map {
                    out.insert(k.clone(), c.eval(ev)?);
                }
                Ok(Value::Map(out))
            }
        }
    }

    /// Evaluate, leaving a placeholder wherever an expression fails.
    fn eval_lenient(&self, ev: &mut Evaluator<'_>) -> Value {
        match self {
            Compiled::Literal(v) => v.clone(),
            Compiled::Expr(e, text) => ev.eval(e).unwrap_or_else(|_| Value::unresolved(text.clone())),
            Compiled::List(items) => Value::List(items.iter().map(|c| c.eval_lenient(ev)).collect()),
            Compiled::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, c)| (k.clone(), c.eval_lenient(ev)))
                    .collect(),
            ),
        }
    }

    fn references(&self, out: &mut Vec<Reference>) {
        match self {
            Compiled::Literal(_) => {}
            Compiled::Expr(e, _) => out.extend(e.references()),
            Compiled::List(items) => items.iter().for_each(|c| c.references(out)),
            Compiled::Map(map) => map.values().for_each(|c| c.references(out)),
        }
    }
}

/// Parse every `${…}` template inside a raw value.
fn compile(value: &Value, node: Option<&str>, diagnostics: &mut Vec<Diagnostic>) -> Compiled {
    match value {
        Value::String(s) if s.contains("${") => match parse_template(s) {
            Ok(expr) => Compiled::Expr(expr, placeholder_text(s)),
            Err(e) => {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::Syntax,
                    node,
                    format!("cannot parse '{}': {}", s, e),
                ));
                Compiled::Literal(value.clone())
            }
        },
        Value::List(items) => {
            Compiled::List(items.iter().map(|v| compile(v, node, diagnostics)).collect())
        }
        Value::Map(map) => Compiled::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), compile(v, node, diagnostics)))
                .collect(),
        ),
        other => Compiled::Literal(other.clone()),
    }
}

/// `${expr}` becomes `expr`; any other template is quoted whole.
fn placeholder_text(template: &str) -> String {
    let trimmed = template.trim();
    if let Some(inner) = trimmed.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        if !inner.contains("${") && !inner.contains('}') {
            return inner.trim().to_string();
        }
    }
    format!("{:?}", template)
}

#[derive(Debug, Clone)]
enum Binding {
    Count(usize),
    Each { key: String, value: Value },
}

impl Binding {
    fn apply<'s>(&self, ev: Evaluator<'s>) -> Evaluator<'s> {
        let mut map = BTreeMap::new();
        match self {
            Binding::Count(i) => {
                map.insert("index".to_string(), Value::Int(*i as i64));
                ev.bind("count", Value::Map(map))
            }
            Binding::Each { key, value } => {
                map.insert("key".to_string(), Value::String(key.clone()));
                map.insert("value".to_string(), value.clone());
                ev.bind("each", Value::Map(map))
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    module: String,
    source: Compiled,
    binding: Option<Binding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repeat {
    Single,
    Count,
    ForEach,
}

struct ResourceEntry<'p> {
    record: &'p ResourceRecord,
    repeat: Repeat,
    attributes: BTreeMap<String, Compiled>,
    /// `None` until the cardinality slot resolves.
    instances: Option<Vec<Option<Binding>>>,
    keys: Vec<String>,
}

impl ResourceEntry<'_> {
    fn instance_id(&self, id: &str, instance: usize) -> String {
        match &self.instances {
            Some(list) if list.len() > 1 => id::with_suffix(id, instance + 1),
            _ => id.to_string(),
        }
    }
}

// ─── State ──────────────────────────────────────────────────────

struct State<'p> {
    modules: BTreeSet<String>,
    resources: BTreeMap<String, ResourceEntry<'p>>,
    data: BTreeMap<String, &'p ResourceRecord>,
    slots: BTreeMap<SlotKey, Slot>,
    values: HashMap<SlotKey, Value>,
    pending: BTreeSet<SlotKey>,
    diagnostics: Vec<Diagnostic>,
}

impl<'p> State<'p> {
    fn new(plan: &'p PlanInput) -> Self {
        let mut state = State {
            modules: plan.modules.iter().map(|m| m.path()).collect(),
            resources: BTreeMap::new(),
            data: BTreeMap::new(),
            slots: BTreeMap::new(),
            values: HashMap::new(),
            pending: BTreeSet::new(),
            diagnostics: Vec::new(),
        };

        // Variables: explicit value, then module argument, then default.
        let mut arguments: BTreeMap<(String, String), (String, &Value)> = BTreeMap::new();
        for call in &plan.modules {
            for (name, value) in &call.arguments {
                arguments.insert((call.path(), name.clone()), (call.module.clone(), value));
            }
        }
        for var in &plan.variables {
            let key = (var.module.clone(), var.name.clone());
            let slot = match (&var.value, arguments.remove(&key), &var.default) {
                (Some(v), _, _) => Some(Slot {
                    module: var.module.clone(),
                    source: Compiled::Literal(v.clone()),
                    binding: None,
                }),
                (None, Some((caller, arg)), _) => Some(Slot {
                    source: compile(arg, None, &mut state.diagnostics),
                    module: caller,
                    binding: None,
                }),
                (None, None, Some(d)) => Some(Slot {
                    module: var.module.clone(),
                    source: Compiled::Literal(d.clone()),
                    binding: None,
                }),
                (None, None, None) => None,
            };
            if let Some(slot) = slot {
                state.add_slot(
                    SlotKey::Variable {
                        module: key.0,
                        name: key.1,
                    },
                    slot,
                );
            }
        }
        // Arguments for undeclared variables are still visible as `var.*`.
        for ((module, name), (caller, arg)) in arguments {
            let source = compile(arg, None, &mut state.diagnostics);
            state.add_slot(
                SlotKey::Variable { module, name },
                Slot {
                    module: caller,
                    source,
                    binding: None,
                },
            );
        }

        for local in &plan.locals {
            let source = match parse_expression(&local.expression) {
                Ok(expr) => Compiled::Expr(expr, local.expression.trim().to_string()),
                Err(e) => {
                    state.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::Syntax,
                        None,
                        format!("local.{}: {}", local.name, e),
                    ));
                    Compiled::Literal(Value::string(local.expression.clone()))
                }
            };
            state.add_slot(
                SlotKey::Local {
                    module: local.module.clone(),
                    name: local.name.clone(),
                },
                Slot {
                    module: local.module.clone(),
                    source,
                    binding: None,
                },
            );
        }

        for call in &plan.modules {
            let path = call.path();
            for (name, value) in &call.outputs {
                let source = compile(value, None, &mut state.diagnostics);
                state.add_slot(
                    SlotKey::Output {
                        module: path.clone(),
                        name: name.clone(),
                    },
                    Slot {
                        module: path.clone(),
                        source,
                        binding: None,
                    },
                );
            }
        }

        for record in &plan.resources {
            let rid = record.id();
            if record.is_data() {
                state.data.insert(rid, record);
                continue;
            }
            if state.resources.contains_key(&rid) {
                warn!(node = %rid, "duplicate resource record ignored");
                continue;
            }
            state.add_resource(rid, record);
        }
        state
    }

    fn add_slot(&mut self, key: SlotKey, slot: Slot) {
        self.pending.insert(key.clone());
        self.slots.insert(key, slot);
    }

    fn add_resource(&mut self, rid: String, record: &'p ResourceRecord) {
        let attributes: BTreeMap<String, Compiled> = record
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), compile(v, Some(rid.as_str()), &mut self.diagnostics)))
            .collect();

        let (repeat, source) = match (&record.count, &record.for_each) {
            (Some(count), for_each) => {
                if for_each.is_some() {
                    self.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::Approximation,
                        Some(rid.as_str()),
                        "both count and for_each set; using count",
                    ));
                }
                (Repeat::Count, Some(count))
            }
            (None, Some(for_each)) => (Repeat::ForEach, Some(for_each)),
            (None, None) => (Repeat::Single, None),
        };

        self.resources.insert(
            rid.clone(),
            ResourceEntry {
                record,
                repeat,
                attributes,
                instances: None,
                keys: Vec::new(),
            },
        );

        match source {
            Some(value) => {
                let source = compile(value, Some(rid.as_str()), &mut self.diagnostics);
                self.add_slot(
                    SlotKey::Cardinality {
                        resource: rid.clone(),
                    },
                    Slot {
                        module: record.module.clone(),
                        source,
                        binding: None,
                    },
                );
            }
            None => self.set_instances(&rid, vec![None], Vec::new()),
        }
    }

    /// Fix a resource's instance list and create its attribute slots.
    fn set_instances(&mut self, rid: &str, instances: Vec<Option<Binding>>, keys: Vec<String>) {
        let Some(entry) = self.resources.get_mut(rid) else {
            return;
        };
        let module = entry.record.module.clone();
        let attributes = entry.attributes.clone();
        entry.instances = Some(instances.clone());
        entry.keys = keys;
        debug!(node = %rid, cardinality = instances.len(), "cardinality fixed");

        for (i, binding) in instances.into_iter().enumerate() {
            for (key, source) in &attributes {
                self.add_slot(
                    SlotKey::Attribute {
                        resource: rid.to_string(),
                        instance: i,
                        key: key.clone(),
                    },
                    Slot {
                        module: module.clone(),
                        source: source.clone(),
                        binding: binding.clone(),
                    },
                );
            }
        }
    }

    fn instances_from(
        repeat: Repeat,
        value: &Value,
    ) -> Result<(Vec<Option<Binding>>, Vec<String>), String> {
        if value.contains_unresolved() {
            return Err("depends on an unresolved value".to_string());
        }
        match repeat {
            Repeat::Count => match value.as_i64() {
                Some(n) if n >= 0 => Ok((
                    (0..n as usize).map(|i| Some(Binding::Count(i))).collect(),
                    Vec::new(),
                )),
                _ => Err(format!("count must be a non-negative whole number, got {}", value)),
            },
            Repeat::ForEach => {
                let pairs: Vec<(String, Value)> = match value {
                    Value::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    Value::List(items) => eval::to_set(items)
                        .into_iter()
                        .map(|v| (v.to_template_string(), v))
                        .collect(),
                    other => return Err(format!("for_each needs a map or set, got {}", other.type_name())),
                };
                let keys = pairs.iter().map(|(k, _)| k.clone()).collect();
                let bindings = pairs
                    .into_iter()
                    .map(|(key, value)| Some(Binding::Each { key, value }))
                    .collect();
                Ok((bindings, keys))
            }
            Repeat::Single => Ok((vec![None], Vec::new())),
        }
    }

    // ─── Passes ─────────────────────────────────────────────────

    fn evaluate(&self, key: &SlotKey, lenient: bool) -> EvalResult {
        let slot = &self.slots[key];
        let scope = StateScope {
            state: self,
            module: &slot.module,
        };
        let mut ev = Evaluator::new(&scope);
        if let Some(binding) = &slot.binding {
            ev = binding.apply(ev);
        }
        if lenient {
            Ok(slot.source.eval_lenient(&mut ev))
        } else {
            slot.source.eval(&mut ev)
        }
    }

    /// Run passes until nothing changes. Returns the number of passes.
    fn run(&mut self, max_iterations: usize) -> usize {
        let mut iterations = self.passes(max_iterations);
        if self.pending.is_empty() {
            return iterations;
        }

        // Slots on a reference cycle get placeholders first, then whatever
        // only waited on them gets another chance.
        let cycles: Vec<(SlotKey, Value)> = self
            .cycle_members()
            .into_iter()
            .map(|key| {
                let value = self.placeholder_value(&key);
                (key, value)
            })
            .collect();
        for (key, value) in &cycles {
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::ReferenceCycle,
                key.resource(),
                format!("{} is part of a reference cycle", key),
            ));
            warn!(slot = %key, "reference cycle");
            self.settle(key, value.clone());
        }
        if !cycles.is_empty() {
            iterations += self.passes(max_iterations);
        }

        for key in self.pending.clone() {
            let value = self.placeholder_value(&key);
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::Unresolved,
                key.resource(),
                format!("{} could not be resolved within {} passes", key, max_iterations),
            ));
            warn!(slot = %key, "unresolved after iteration budget");
            self.settle(&key, value);
        }
        iterations
    }

    fn passes(&mut self, max_iterations: usize) -> usize {
        let mut iterations = 0;
        while !self.pending.is_empty() && iterations < max_iterations {
            iterations += 1;
            let mut progress = false;
            for key in self.pending.clone() {
                match self.evaluate(&key, false) {
                    Ok(value) => {
                        self.settle(&key, value);
                        progress = true;
                    }
                    Err(EvalError::Pending) => {}
                    Err(EvalError::Unresolvable(message)) => {
                        self.fail(&key, message);
                        progress = true;
                    }
                }
            }
            debug!(pass = iterations, pending = self.pending.len(), "resolution pass");
            if progress {
                continue;
            }
            // A cardinality that cannot settle falls back to one instance so
            // the resource's attributes can still be resolved.
            let stuck: Vec<SlotKey> = self
                .pending
                .iter()
                .filter(|k| matches!(k, SlotKey::Cardinality { .. }))
                .cloned()
                .collect();
            if stuck.is_empty() {
                break;
            }
            for key in stuck {
                self.fail(&key, "cardinality depends on unresolved values".to_string());
            }
        }
        iterations
    }

    fn placeholder_value(&self, key: &SlotKey) -> Value {
        self.evaluate(key, true)
            .unwrap_or_else(|_| Value::unresolved(key.to_string()))
    }

    /// Record a slot's final value.
    fn settle(&mut self, key: &SlotKey, value: Value) {
        self.pending.remove(key);
        if let SlotKey::Cardinality { resource } = key {
            let repeat = self.resources[resource].repeat;
            match Self::instances_from(repeat, &value) {
                Ok((instances, keys)) => self.set_instances(resource, instances, keys),
                Err(message) => return self.fail(key, message),
            }
        }
        self.values.insert(key.clone(), value);
    }

    fn fail(&mut self, key: &SlotKey, message: String) {
        self.pending.remove(key);
        if let SlotKey::Cardinality { resource } = key {
            let resource = resource.clone();
            let fallback = match self.resources[&resource].repeat {
                Repeat::ForEach => Binding::Each {
                    key: String::new(),
                    value: Value::Null,
                },
                _ => Binding::Count(0),
            };
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::Unresolved,
                Some(resource.as_str()),
                format!("{}; assuming a single instance", message),
            ));
            warn!(node = %resource, reason = %message, "cardinality unresolved");
            self.set_instances(&resource, vec![Some(fallback)], Vec::new());
            self.values.insert(key.clone(), Value::Int(1));
            return;
        }
        let value = self.placeholder_value(key);
        debug!(slot = %key, reason = %message, "slot unresolvable");
        self.diagnostics.push(Diagnostic::new(
            DiagnosticKind::Unresolved,
            key.resource(),
            format!("{}: {}", key, message),
        ));
        self.values.insert(key.clone(), value);
    }

    /// Pending slots that sit on a cycle of the slot reference graph.
    fn cycle_members(&self) -> Vec<SlotKey> {
        let mut graph = DiGraph::<SlotKey, ()>::new();
        let mut index = HashMap::new();
        for key in &self.pending {
            index.insert(key.clone(), graph.add_node(key.clone()));
        }
        let mut self_loops = BTreeSet::new();
        for key in &self.pending {
            let slot = &self.slots[key];
            let mut refs = Vec::new();
            slot.source.references(&mut refs);
            for r in refs {
                for dep in self.reference_slots(&slot.module, &r) {
                    if let Some(&b) = index.get(&dep) {
                        if &dep == key {
                            self_loops.insert(key.clone());
                        }
                        graph.add_edge(index[key], b, ());
                    }
                }
            }
        }
        let mut members = BTreeSet::new();
        for component in tarjan_scc(&graph) {
            if component.len() > 1 {
                members.extend(component.into_iter().map(|n| graph[n].clone()));
            } else if let Some(n) = component.first() {
                if self_loops.contains(&graph[*n]) {
                    members.insert(graph[*n].clone());
                }
            }
        }
        members.into_iter().collect()
    }

    /// Slots a static reference may read.
    fn reference_slots(&self, module: &str, r: &Reference) -> Vec<SlotKey> {
        let first = r.attrs.first().cloned().unwrap_or_default();
        match r.root.as_str() {
            "var" => vec![SlotKey::Variable {
                module: module.to_string(),
                name: first,
            }],
            "local" => vec![SlotKey::Local {
                module: module.to_string(),
                name: first,
            }],
            "module" => {
                let child = child_module_path(module, &first);
                match r.attrs.get(1) {
                    Some(name) => vec![SlotKey::Output {
                        module: child,
                        name: name.clone(),
                    }],
                    None => self
                        .slots
                        .keys()
                        .filter(|k| matches!(k, SlotKey::Output { module, .. } if *module == child))
                        .cloned()
                        .collect(),
                }
            }
            root if RESERVED_ROOTS.contains(&root) => Vec::new(),
            resource_type => {
                let rid = id::qualified(module, resource_type, &first);
                let attr = r.attrs.get(1);
                let mut out = vec![SlotKey::Cardinality {
                    resource: rid.clone(),
                }];
                out.extend(
                    self.slots
                        .keys()
                        .filter(|k| match k {
                            SlotKey::Attribute { resource, key, .. } => {
                                *resource == rid && attr.map_or(true, |a| a == key)
                            }
                            _ => false,
                        })
                        .cloned(),
                );
                out
            }
        }
    }

    // ─── Output ─────────────────────────────────────────────────

    fn finish(mut self, plan: &PlanInput) -> Resolution {
        let mut resources = Vec::new();
        for record in plan.managed_resources() {
            let rid = record.id();
            let Some(entry) = self.resources.get(&rid) else {
                continue;
            };
            if !std::ptr::eq(entry.record, record) {
                continue;
            }
            let instances = entry.instances.as_ref().map_or(1, Vec::len);
            if instances == 0 {
                debug!(node = %rid, "resource has no instances, dropped");
                continue;
            }

            let bags: Vec<AttrBag> = (0..instances)
                .map(|i| {
                    entry
                        .attributes
                        .keys()
                        .map(|key| {
                            let slot = SlotKey::Attribute {
                                resource: rid.clone(),
                                instance: i,
                                key: key.clone(),
                            };
                            let value = self
                                .values
                                .get(&slot)
                                .cloned()
                                .unwrap_or_else(|| Value::unresolved(slot.to_string()));
                            (key.clone(), value)
                        })
                        .collect()
                })
                .collect();

            let mut refs = Vec::new();
            for compiled in entry.attributes.values() {
                compiled.references(&mut refs);
            }
            if let Some(slot) = self.slots.get(&SlotKey::Cardinality {
                resource: rid.clone(),
            }) {
                slot.source.references(&mut refs);
            }
            let references: BTreeSet<String> = refs
                .iter()
                .filter(|r| !RESERVED_ROOTS.contains(&r.root.as_str()))
                .filter_map(|r| r.attrs.first().map(|name| id::qualified(&record.module, &r.root, name)))
                .filter(|target| *target != rid && self.resources.contains_key(target))
                .collect();

            let depends_on = self.depends_on(record);
            let attributes = bags.first().cloned().unwrap_or_default();
            resources.push(ResolvedResource {
                id: rid.clone(),
                resource_type: record.resource_type.clone(),
                name: record.name.clone(),
                module: record.module.clone(),
                raw: record.attributes.clone(),
                attributes,
                instances: if instances > 1 { bags } else { Vec::new() },
                instance_keys: entry.keys.clone(),
                cardinality: instances,
                references,
                depends_on,
            });
        }

        let dependencies = plan
            .dependencies
            .iter()
            .filter(|d| self.resources.contains_key(&d.from) && self.resources.contains_key(&d.to))
            .cloned()
            .collect();

        Resolution {
            resources,
            dependencies,
            diagnostics: std::mem::take(&mut self.diagnostics),
            iterations: 0,
        }
    }

    /// `depends_on` entries as resource ids; a module entry stands for
    /// every resource inside it.
    fn depends_on(&self, record: &ResourceRecord) -> Vec<String> {
        let mut out = Vec::new();
        for target in &record.depends_on {
            let target = target.trim();
            if let Some(name) = target.strip_prefix("module.") {
                let prefix = format!("{}.", child_module_path(&record.module, name));
                out.extend(
                    self.resources
                        .keys()
                        .filter(|rid| rid.starts_with(&prefix))
                        .cloned(),
                );
            } else {
                let rid = scoped(&record.module, target);
                if self.resources.contains_key(&rid) {
                    out.push(rid);
                }
            }
        }
        out
    }
}

// ─── Scope ──────────────────────────────────────────────────────

struct StateScope<'a, 'p> {
    state: &'a State<'p>,
    module: &'a str,
}

impl StateScope<'_, '_> {
    fn slot(&self, key: SlotKey, consumed: usize) -> Lookup {
        match self.state.values.get(&key) {
            Some(value) => Lookup::Found {
                value: value.clone(),
                consumed,
            },
            None if self.state.slots.contains_key(&key) => Lookup::Pending,
            None => Lookup::Missing(format!("{} is not defined", key)),
        }
    }

    fn attribute(&self, rid: &str, entry: &ResourceEntry<'_>, instance: usize, key: &str) -> Option<Value> {
        let slot = SlotKey::Attribute {
            resource: rid.to_string(),
            instance,
            key: key.to_string(),
        };
        match self.state.values.get(&slot) {
            Some(value) => Some(value.clone()),
            None if self.state.slots.contains_key(&slot) => None,
            // Not set in configuration: only known after apply, so the
            // instance identifier stands in for it.
            None => Some(Value::String(entry.instance_id(rid, instance))),
        }
    }

    fn object(&self, rid: &str, entry: &ResourceEntry<'_>, instance: usize) -> Option<Value> {
        let mut map = BTreeMap::new();
        for key in entry.attributes.keys() {
            map.insert(key.clone(), self.attribute(rid, entry, instance, key)?);
        }
        map.entry("id".to_string())
            .or_insert_with(|| Value::String(entry.instance_id(rid, instance)));
        Some(Value::Map(map))
    }

    /// Per-instance values, either one attribute or whole objects.
    fn all_instances(&self, rid: &str, entry: &ResourceEntry<'_>, n: usize, attr: Option<&str>) -> Option<Vec<Value>> {
        (0..n)
            .map(|i| match attr {
                Some(a) => self.attribute(rid, entry, i, a),
                None => self.object(rid, entry, i),
            })
            .collect()
    }

    fn resource(&self, resource_type: &str, steps: &[Step]) -> Lookup {
        let Some(Step::Attr(name)) = steps.first() else {
            return Lookup::Missing(format!("unknown reference '{}'", resource_type));
        };
        let rid = id::qualified(self.module, resource_type, name);
        let Some(entry) = self.state.resources.get(&rid) else {
            return Lookup::Missing(format!("unknown resource '{}'", rid));
        };
        let Some(instances) = &entry.instances else {
            return Lookup::Pending;
        };
        let n = instances.len();
        let found = |value: Option<Value>, consumed: usize| match value {
            Some(value) => Lookup::Found { value, consumed },
            None => Lookup::Pending,
        };
        let list = |values: Option<Vec<Value>>, consumed: usize| found(values.map(Value::List), consumed);

        match (steps.get(1), steps.get(2)) {
            (Some(Step::Index(key)), next) => {
                let instance = match entry.repeat {
                    Repeat::ForEach => key.as_str().and_then(|k| entry.keys.iter().position(|x| x == k)),
                    _ => key.as_i64().filter(|i| *i >= 0 && (*i as usize) < n).map(|i| i as usize),
                };
                let Some(i) = instance else {
                    return Lookup::Missing(format!("{} has no instance {}", rid, key));
                };
                match next {
                    Some(Step::Attr(a)) => found(self.attribute(&rid, entry, i, a), 3),
                    _ => found(self.object(&rid, entry, i), 2),
                }
            }
            (Some(Step::Splat), Some(Step::Attr(a))) => list(self.all_instances(&rid, entry, n, Some(a)), 3),
            (Some(Step::Splat), _) => list(self.all_instances(&rid, entry, n, None), 2),
            (Some(Step::Attr(a)), _) if entry.repeat == Repeat::Single => {
                found(self.attribute(&rid, entry, 0, a), 2)
            }
            // A multi-instance resource read without an index behaves like
            // a splat over its instances.
            (Some(Step::Attr(a)), _) => list(self.all_instances(&rid, entry, n, Some(a)), 2),
            (None, _) => match entry.repeat {
                Repeat::Single => found(self.object(&rid, entry, 0), 1),
                Repeat::Count => list(self.all_instances(&rid, entry, n, None), 1),
                Repeat::ForEach => {
                    let objects = self.all_instances(&rid, entry, n, None);
                    found(
                        objects.map(|objects| {
                            Value::Map(entry.keys.iter().cloned().zip(objects).collect())
                        }),
                        1,
                    )
                }
            },
        }
    }

    fn data(&self, steps: &[Step]) -> Lookup {
        let (Some(Step::Attr(resource_type)), Some(Step::Attr(name))) = (steps.first(), steps.get(1)) else {
            return Lookup::Missing("incomplete data source reference".to_string());
        };
        let rid = id::qualified(self.module, "data", &format!("{}.{}", resource_type, name));
        let record = self.state.data.get(&rid);
        match steps.get(2) {
            Some(Step::Attr(attr)) => {
                let value = record
                    .and_then(|r| r.attributes.get(attr))
                    .filter(|v| !matches!(v, Value::String(s) if s.contains("${")))
                    .cloned()
                    .unwrap_or_else(|| Value::String(rid.clone()));
                Lookup::Found { value, consumed: 3 }
            }
            _ => {
                let mut map: BTreeMap<String, Value> =
                    record.map(|r| r.attributes.clone()).unwrap_or_default();
                map.entry("id".to_string())
                    .or_insert_with(|| Value::String(rid.clone()));
                Lookup::Found {
                    value: Value::Map(map),
                    consumed: 2,
                }
            }
        }
    }
}

impl Scope for StateScope<'_, '_> {
    fn lookup(&self, root: &str, steps: &[Step]) -> Lookup {
        let first = match steps.first() {
            Some(Step::Attr(name)) => Some(name.as_str()),
            _ => None,
        };
        match root {
            "var" | "local" => {
                let Some(name) = first else {
                    return Lookup::Missing(format!("'{}' needs an attribute", root));
                };
                let key = if root == "var" {
                    SlotKey::Variable {
                        module: self.module.to_string(),
                        name: name.to_string(),
                    }
                } else {
                    SlotKey::Local {
                        module: self.module.to_string(),
                        name: name.to_string(),
                    }
                };
                self.slot(key, 1)
            }
            "module" => {
                let Some(name) = first else {
                    return Lookup::Missing("'module' needs a module name".to_string());
                };
                let child = child_module_path(self.module, name);
                if !self.state.modules.contains(&child) {
                    return Lookup::Missing(format!("unknown module '{}'", child));
                }
                match steps.get(1) {
                    Some(Step::Attr(output)) => self.slot(
                        SlotKey::Output {
                            module: child,
                            name: output.clone(),
                        },
                        2,
                    ),
                    _ => {
                        let mut map = BTreeMap::new();
                        for key in self.state.slots.keys() {
                            if let SlotKey::Output { module, name } = key {
                                if *module == child {
                                    match self.state.values.get(key) {
                                        Some(v) => map.insert(name.clone(), v.clone()),
                                        None => return Lookup::Pending,
                                    };
                                }
                            }
                        }
                        Lookup::Found {
                            value: Value::Map(map),
                            consumed: 1,
                        }
                    }
                }
            }
            "path" => {
                let mut map = BTreeMap::new();
                for key in ["module", "root", "cwd"] {
                    map.insert(key.to_string(), Value::string("."));
                }
                Lookup::Found {
                    value: Value::Map(map),
                    consumed: 0,
                }
            }
            "terraform" => {
                let mut map = BTreeMap::new();
                map.insert("workspace".to_string(), Value::string("default"));
                Lookup::Found {
                    value: Value::Map(map),
                    consumed: 0,
                }
            }
            "data" => self.data(steps),
            "count" | "each" | "self" => {
                Lookup::Missing(format!("'{}' is not available here", root))
            }
            resource_type => self.resource(resource_type, steps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolve(json: &str) -> Resolution {
        let plan = PlanInput::from_json(json).unwrap();
        Interpreter::default().resolve(&plan)
    }

    fn resource<'a>(resolution: &'a Resolution, rid: &str) -> &'a ResolvedResource {
        resolution
            .resources
            .iter()
            .find(|r| r.id == rid)
            .unwrap_or_else(|| panic!("missing {}", rid))
    }

    #[test]
    fn test_variables_locals_and_templates() {
        let r = resolve(
            r#"{
            "variables": [{"name": "env", "default": "dev", "value": "prod"}, {"name": "size", "default": 2}],
            "locals": [{"name": "prefix", "expression": "\"${var.env}-app\""}],
            "resources": [{"type": "aws_instance", "name": "web",
                "attributes": {"name": "${local.prefix}-web", "count_plus": "${var.size + 1}"}}]
        }"#,
        );
        let web = resource(&r, "aws_instance.web");
        assert_eq!(web.attributes["name"], Value::string("prod-app-web"));
        assert_eq!(web.attributes["count_plus"], Value::Int(3));
        assert_eq!(web.cardinality, 1);
        assert!(r.diagnostics.is_empty());
    }

    #[test]
    fn test_unset_attribute_resolves_to_identifier() {
        let r = resolve(
            r#"{"resources": [
            {"type": "aws_vpc", "name": "main", "attributes": {"cidr_block": "10.0.0.0/16"}},
            {"type": "aws_subnet", "name": "a", "attributes": {"vpc_id": "${aws_vpc.main.id}",
                "cidr": "${aws_vpc.main.cidr_block}"}}
        ]}"#,
        );
        let subnet = resource(&r, "aws_subnet.a");
        assert_eq!(subnet.attributes["vpc_id"], Value::string("aws_vpc.main"));
        assert_eq!(subnet.attributes["cidr"], Value::string("10.0.0.0/16"));
        assert!(subnet.references.contains("aws_vpc.main"));
    }

    #[test]
    fn test_count_instances_and_indexing() {
        let r = resolve(
            r#"{
            "variables": [{"name": "azs", "default": ["us-east-1a", "us-east-1b"]}],
            "resources": [
                {"type": "aws_subnet", "name": "private", "count": "${length(var.azs)}",
                 "attributes": {"availability_zone": "${var.azs[count.index]}"}},
                {"type": "aws_instance", "name": "app",
                 "attributes": {"subnet_id": "${aws_subnet.private[1].id}",
                                "all": "${aws_subnet.private[*].id}"}}
            ]}"#,
        );
        let subnet = resource(&r, "aws_subnet.private");
        assert_eq!(subnet.cardinality, 2);
        assert_eq!(subnet.instances.len(), 2);
        assert_eq!(subnet.instances[1]["availability_zone"], Value::string("us-east-1b"));
        let app = resource(&r, "aws_instance.app");
        assert_eq!(app.attributes["subnet_id"], Value::string("aws_subnet.private~2"));
        assert_eq!(
            app.attributes["all"],
            Value::List(vec![
                Value::string("aws_subnet.private~1"),
                Value::string("aws_subnet.private~2")
            ])
        );
    }

    #[test]
    fn test_count_zero_removes_resource() {
        let r = resolve(
            r#"{
            "variables": [{"name": "enabled", "default": false}],
            "resources": [{"type": "aws_nat_gateway", "name": "nat", "count": "${var.enabled ? 1 : 0}"}]
        }"#,
        );
        assert!(r.resources.is_empty());
        assert!(r.diagnostics.is_empty());
    }

    #[test]
    fn test_for_each_is_sorted_and_deterministic() {
        let json = r#"{"resources": [{"type": "aws_s3_bucket", "name": "b",
            "for_each": {"zeta": "z", "alpha": "a", "mid": "m"},
            "attributes": {"bucket": "${each.key}-${each.value}"}}]}"#;
        let first = resolve(json);
        let second = resolve(json);
        let b = resource(&first, "aws_s3_bucket.b");
        assert_eq!(b.instance_keys, vec!["alpha", "mid", "zeta"]);
        assert_eq!(b.instances[0]["bucket"], Value::string("alpha-a"));
        assert_eq!(b.instances[2]["bucket"], Value::string("zeta-z"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_for_each_set_dedupes() {
        let r = resolve(
            r#"{"resources": [{"type": "aws_iam_user", "name": "u",
            "for_each": "${toset([\"bob\", \"amy\", \"bob\"])}", "attributes": {"name": "${each.value}"}}]}"#,
        );
        let u = resource(&r, "aws_iam_user.u");
        assert_eq!(u.cardinality, 2);
        assert_eq!(u.instance_keys, vec!["amy", "bob"]);
    }

    #[test]
    fn test_module_arguments_and_outputs() {
        let r = resolve(
            r#"{
            "variables": [{"module": "module.net", "name": "cidr"}],
            "modules": [{"name": "net", "source": "./net",
                "arguments": {"cidr": "10.1.0.0/16"},
                "outputs": {"vpc_id": "${aws_vpc.this.id}"}}],
            "resources": [
                {"type": "aws_vpc", "name": "this", "module": "module.net",
                 "attributes": {"cidr_block": "${var.cidr}"}},
                {"type": "aws_instance", "name": "web", "attributes": {"vpc": "${module.net.vpc_id}"}}
            ]}"#,
        );
        let vpc = resource(&r, "module.net.aws_vpc.this");
        assert_eq!(vpc.attributes["cidr_block"], Value::string("10.1.0.0/16"));
        let web = resource(&r, "aws_instance.web");
        assert_eq!(web.attributes["vpc"], Value::string("module.net.aws_vpc.this"));
    }

    #[test]
    fn test_same_name_in_different_modules_does_not_collide() {
        let r = resolve(
            r#"{
            "modules": [{"name": "a"}, {"name": "b"}],
            "resources": [
                {"type": "aws_vpc", "name": "main", "module": "module.a"},
                {"type": "aws_vpc", "name": "main", "module": "module.b"}
            ]}"#,
        );
        assert_eq!(r.resources.len(), 2);
        assert_eq!(r.resources[0].id, "module.a.aws_vpc.main");
        assert_eq!(r.resources[1].id, "module.b.aws_vpc.main");
    }

    #[test]
    fn test_reference_cycle_leaves_placeholders() {
        let r = resolve(
            r#"{"resources": [
            {"type": "aws_instance", "name": "a", "attributes": {"peer": "${aws_instance.b.peer}"}},
            {"type": "aws_instance", "name": "b", "attributes": {"peer": "${aws_instance.a.peer}"}},
            {"type": "aws_instance", "name": "c", "attributes": {"size": "small"}}
        ]}"#,
        );
        assert_eq!(r.resources.len(), 3);
        assert_eq!(
            resource(&r, "aws_instance.a").attributes["peer"],
            Value::unresolved("aws_instance.b.peer")
        );
        let cycles: Vec<_> = r
            .diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::ReferenceCycle)
            .collect();
        assert_eq!(cycles.len(), 2);
        assert_eq!(resource(&r, "aws_instance.c").attributes["size"], Value::string("small"));
    }

    #[test]
    fn test_local_cycle_feeds_dependent_attribute() {
        let r = resolve(
            r#"{
            "locals": [{"name": "x", "expression": "local.y"}, {"name": "y", "expression": "local.x"}],
            "resources": [{"type": "aws_instance", "name": "web", "attributes": {"name": "${local.x}"}}]
        }"#,
        );
        let web = resource(&r, "aws_instance.web");
        assert!(web.attributes["name"].contains_unresolved());
        assert!(r
            .diagnostics
            .iter()
            .all(|d| d.kind != DiagnosticKind::Unresolved || d.node.is_none()));
    }

    #[test]
    fn test_unknown_reference_is_unresolved_not_fatal() {
        let r = resolve(
            r#"{"resources": [{"type": "aws_instance", "name": "web",
            "attributes": {"ami": "${var.nope}", "tag": "x-${var.nope}"}}]}"#,
        );
        let web = resource(&r, "aws_instance.web");
        assert_eq!(web.attributes["ami"], Value::unresolved("var.nope"));
        assert!(web.attributes["tag"].contains_unresolved());
        assert_eq!(
            r.diagnostics
                .iter()
                .filter(|d| d.kind == DiagnosticKind::Unresolved)
                .count(),
            2
        );
    }

    #[test]
    fn test_unresolvable_count_falls_back_to_one() {
        let r = resolve(
            r#"{"resources": [{"type": "aws_instance", "name": "web", "count": "${var.missing}",
            "attributes": {"idx": "${count.index}"}}]}"#,
        );
        let web = resource(&r, "aws_instance.web");
        assert_eq!(web.cardinality, 1);
        assert_eq!(web.attributes["idx"], Value::Int(0));
        assert!(r
            .diagnostics
            .iter()
            .any(|d| d.node.as_deref() == Some("aws_instance.web")));
    }

    #[test]
    fn test_syntax_error_is_diagnosed() {
        let r = resolve(
            r#"{"resources": [{"type": "aws_instance", "name": "web", "attributes": {"bad": "${1 +}"}}]}"#,
        );
        assert_eq!(r.diagnostics[0].kind, DiagnosticKind::Syntax);
        assert_eq!(resource(&r, "aws_instance.web").attributes["bad"], Value::string("${1 +}"));
    }

    #[test]
    fn test_depends_on_and_data_sources() {
        let r = resolve(
            r#"{
            "modules": [{"name": "db"}],
            "resources": [
                {"type": "aws_ami", "name": "ubuntu", "mode": "data", "attributes": {"image_id": "ami-123"}},
                {"type": "aws_db_instance", "name": "main", "module": "module.db"},
                {"type": "aws_instance", "name": "web", "depends_on": ["module.db", "aws_iam_role.r"],
                 "attributes": {"ami": "${data.aws_ami.ubuntu.image_id}"}},
                {"type": "aws_iam_role", "name": "r"}
            ]}"#,
        );
        let web = resource(&r, "aws_instance.web");
        assert_eq!(web.attributes["ami"], Value::string("ami-123"));
        assert_eq!(web.depends_on, vec!["module.db.aws_db_instance.main", "aws_iam_role.r"]);
        assert_eq!(r.resources.len(), 3);
    }

    #[test]
    fn test_long_chain_within_budget() {
        let locals: Vec<String> = (0..20)
            .map(|i| format!(r#"{{"name": "l{}", "expression": "local.l{} + 1"}}"#, i, i + 1))
            .chain(std::iter::once(r#"{"name": "l20", "expression": "0"}"#.to_string()))
            .collect();
        let json = format!(
            r#"{{"locals": [{}], "resources": [{{"type": "aws_instance", "name": "w", "attributes": {{"n": "${{local.l0}}"}}}}]}}"#,
            locals.join(",")
        );
        let r = resolve(&json);
        assert_eq!(resource(&r, "aws_instance.w").attributes["n"], Value::Int(20));
    }
}
