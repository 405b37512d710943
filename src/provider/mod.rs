//! Provider context: per-provider rule tables and handler configuration.
//!
//! A table is a YAML document (the built-in `aws` and `azurerm` tables are
//! compiled in) describing which resource types are diagram containers,
//! which references point "backwards", what is hidden, implied
//! connections, variants, cardinality heuristics, and the ordered phases
//! of handlers the pipeline runs. Tables are compiled once into a
//! [`ProviderContext`]: patterns parsed, regexes built, callback names
//! resolved against a [`CallbackRegistry`]. Nothing is looked up by name
//! while the pipeline runs.

pub mod callbacks;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub use callbacks::{Callback, CallbackRegistry, HandlerCtx};

use crate::error::{ArchGraphError, Result};
use crate::graph::{id, AttrBag, Diagnostic, DiagnosticKind, Value};
use crate::pattern::ResourcePattern;
use crate::transform::ops::Operation;

const AWS_TABLE: &str = include_str!("aws.yaml");
const AZURE_TABLE: &str = include_str!("azure.yaml");

/// Name used when no table matches a resource-type prefix.
pub const GENERIC_PROVIDER: &str = "generic";

// ─── Tables (serde) ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderTable {
    pub provider: String,
    /// Resource-type prefixes this table claims; defaults to `<provider>_`.
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub group_types: Vec<ResourcePattern>,
    /// Referenced types that become the parent of the referencing resource.
    #[serde(default)]
    pub reverse_arrow_types: Vec<ResourcePattern>,
    #[serde(default)]
    pub hidden_types: Vec<ResourcePattern>,
    #[serde(default)]
    pub implied_connections: Vec<ImpliedConnection>,
    #[serde(default)]
    pub variants: Vec<VariantRule>,
    #[serde(default)]
    pub cardinality_rules: Vec<CardinalityRule>,
    #[serde(default)]
    pub consolidation: Vec<ConsolidationRule>,
    #[serde(default)]
    pub protective_types: Vec<ResourcePattern>,
    #[serde(default)]
    pub shared_services: Option<SharedServices>,
    #[serde(default)]
    pub auto_links: Vec<AutoLink>,
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

/// A keyword (regex) in an attribute name or string value that implies
/// a connection to resources of `target` type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpliedConnection {
    pub keyword: String,
    pub target: String,
}

/// Subtype chosen by an attribute value, e.g. `aws_lb` + `load_balancer_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRule {
    pub resource_type: String,
    pub attribute: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Heuristic cardinality: the length of a list-valued attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardinalityRule {
    pub resource_type: String,
    pub attribute: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationRule {
    pub resource_type: ResourcePattern,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedServices {
    pub container: String,
    pub patterns: Vec<ResourcePattern>,
}

/// Synthetic node linked to every node matching `to`, when any exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoLink {
    pub from: String,
    pub to: ResourcePattern,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    /// Generate this phase's handlers from one of the table sections.
    #[serde(default)]
    pub builtin: Option<BuiltinPhase>,
    #[serde(default)]
    pub handlers: IndexMap<String, HandlerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinPhase {
    Consolidation,
    Protective,
    SharedServices,
}

/// When a handler's callback runs relative to its operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOrder {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub description: String,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default)]
    pub order: CallbackOrder,
}

impl ProviderTable {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut table: ProviderTable = serde_yaml::from_str(text)?;
        if table.prefixes.is_empty() {
            table.prefixes.push(format!("{}_", table.provider));
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    /// Built-in table for a provider tag, if one ships with the crate.
    pub fn builtin(provider: &str) -> Option<Result<Self>> {
        match provider {
            "aws" => Some(Self::from_yaml(AWS_TABLE)),
            "azurerm" => Some(Self::from_yaml(AZURE_TABLE)),
            _ => None,
        }
    }

    /// Merge another table for the same provider over this one: lists are
    /// appended, phases with the same name get their handlers merged, new
    /// phases are appended.
    pub fn merge(&mut self, other: ProviderTable) {
        self.prefixes.extend(other.prefixes);
        self.prefixes.dedup();
        self.group_types.extend(other.group_types);
        self.reverse_arrow_types.extend(other.reverse_arrow_types);
        self.hidden_types.extend(other.hidden_types);
        self.implied_connections.extend(other.implied_connections);
        self.variants.extend(other.variants);
        self.cardinality_rules.extend(other.cardinality_rules);
        self.consolidation.extend(other.consolidation);
        self.protective_types.extend(other.protective_types);
        if other.shared_services.is_some() {
            self.shared_services = other.shared_services;
        }
        self.auto_links.extend(other.auto_links);
        for phase in other.phases {
            match self.phases.iter_mut().find(|p| p.name == phase.name) {
                Some(existing) => {
                    existing.handlers.extend(phase.handlers);
                    if phase.builtin.is_some() {
                        existing.builtin = phase.builtin;
                    }
                }
                None => self.phases.push(phase),
            }
        }
    }
}

// ─── Compiled context ───────────────────────────────────────────

/// A handler with its pattern parsed and callback resolved.
#[derive(Clone)]
pub struct Handler {
    pub pattern: ResourcePattern,
    pub description: String,
    pub operations: Vec<Operation>,
    pub callback: Option<(String, Callback)>,
    pub order: CallbackOrder,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("pattern", &self.pattern)
            .field("description", &self.description)
            .field("operations", &self.operations.len())
            .field("callback", &self.callback.as_ref().map(|(name, _)| name))
            .field("order", &self.order)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub handlers: Vec<Handler>,
}

#[derive(Debug, Clone)]
pub struct ProviderContext {
    name: String,
    table: ProviderTable,
    implied: Vec<(Regex, String)>,
    phases: Vec<Phase>,
}

impl ProviderContext {
    pub fn compile(table: ProviderTable, registry: &CallbackRegistry) -> Result<Self> {
        let implied = table
            .implied_connections
            .iter()
            .map(|ic| {
                Regex::new(&ic.keyword)
                    .map(|re| (re, ic.target.clone()))
                    .map_err(|e| ArchGraphError::invalid_pattern(&ic.keyword, e))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut phases = Vec::new();
        for phase in &table.phases {
            let mut handlers = match phase.builtin {
                Some(kind) => builtin_handlers(&table, kind),
                None => Vec::new(),
            };
            for (pattern, config) in &phase.handlers {
                handlers.push(compile_handler(pattern, config, registry)?);
            }
            phases.push(Phase {
                name: phase.name.clone(),
                handlers,
            });
        }

        debug!(
            provider = %table.provider,
            phases = phases.len(),
            "provider context compiled"
        );
        Ok(Self {
            name: table.provider.clone(),
            table,
            implied,
            phases,
        })
    }

    /// Context with no rules, for resource types no table claims.
    pub fn generic() -> Self {
        Self {
            name: GENERIC_PROVIDER.to_string(),
            table: ProviderTable {
                provider: GENERIC_PROVIDER.to_string(),
                ..ProviderTable::default()
            },
            implied: Vec::new(),
            phases: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &ProviderTable {
        &self.table
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn claims(&self, resource_type: &str) -> bool {
        self.table
            .prefixes
            .iter()
            .any(|p| resource_type.starts_with(p.as_str()))
    }
}

fn compile_handler(
    pattern: &str,
    config: &HandlerConfig,
    registry: &CallbackRegistry,
) -> Result<Handler> {
    if config.description.trim().is_empty() {
        return Err(ArchGraphError::invalid_handler(pattern, "description is required"));
    }
    if config.operations.is_empty() && config.callback.is_none() {
        return Err(ArchGraphError::invalid_handler(
            pattern,
            "needs at least one operation or a callback",
        ));
    }
    let callback = match &config.callback {
        Some(name) => {
            let cb = registry
                .get(name)
                .ok_or_else(|| ArchGraphError::UnknownCallback(name.clone()))?;
            Some((name.clone(), cb))
        }
        None => None,
    };
    Ok(Handler {
        pattern: ResourcePattern::new(pattern)?,
        description: config.description.clone(),
        operations: config.operations.clone(),
        callback,
        order: config.order,
    })
}

fn builtin_handlers(table: &ProviderTable, kind: BuiltinPhase) -> Vec<Handler> {
    let handler = |pattern: ResourcePattern, description: String, operation: Operation| Handler {
        pattern,
        description,
        operations: vec![operation],
        callback: None,
        order: CallbackOrder::After,
    };
    match kind {
        BuiltinPhase::Consolidation => table
            .consolidation
            .iter()
            .map(|rule| {
                handler(
                    rule.resource_type.clone(),
                    format!("consolidate {} into {}", rule.resource_type, rule.target),
                    Operation::Consolidate {
                        resource_type: rule.resource_type.clone(),
                        target: rule.target.clone(),
                    },
                )
            })
            .collect(),
        BuiltinPhase::Protective => table
            .protective_types
            .iter()
            .map(|pattern| {
                handler(
                    pattern.clone(),
                    format!("wrap resources protected by {}", pattern),
                    Operation::ReverseRelation { resource: None },
                )
            })
            .collect(),
        BuiltinPhase::SharedServices => match &table.shared_services {
            Some(shared) => match ResourcePattern::new(&shared.container) {
                Ok(container_pattern) => vec![handler(
                    container_pattern,
                    format!("group shared services under {}", shared.container),
                    Operation::Group {
                        container: shared.container.clone(),
                        members: shared.patterns.clone(),
                    },
                )],
                Err(_) => Vec::new(),
            },
            None => Vec::new(),
        },
    }
}

// ─── Provider set ───────────────────────────────────────────────

/// Every provider context detected for one run, primary first.
#[derive(Debug, Clone)]
pub struct ProviderSet {
    contexts: Vec<ProviderContext>,
    generic: ProviderContext,
}

impl ProviderSet {
    pub fn new(contexts: Vec<ProviderContext>) -> Self {
        Self {
            contexts,
            generic: ProviderContext::generic(),
        }
    }

    /// Detect providers from the resource types in play, load their
    /// tables (built-in, merged with any `extra` table for the same
    /// provider) and compile them. Types no table claims get a diagnostic.
    pub fn detect<'a, I>(
        resource_types: I,
        extra: &[ProviderTable],
        registry: &CallbackRegistry,
    ) -> Result<(Self, Vec<Diagnostic>)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let types: BTreeSet<&str> = resource_types.into_iter().collect();
        let mut tables: Vec<ProviderTable> = Vec::new();
        let mut unknown = Vec::new();

        for resource_type in &types {
            let tag = id::provider_prefix(resource_type).to_string();
            *counts.entry(tag.clone()).or_default() += 1;
            if tables.iter().any(|t| t.provider == tag) {
                continue;
            }
            let claimed_by_extra = extra.iter().any(|t| {
                t.provider == tag || t.prefixes.iter().any(|p| resource_type.starts_with(p.as_str()))
            });
            match ProviderTable::builtin(&tag) {
                Some(table) => tables.push(table?),
                None if claimed_by_extra => {}
                None => unknown.push(resource_type.to_string()),
            }
        }
        for table in extra {
            match tables.iter_mut().find(|t| t.provider == table.provider) {
                Some(existing) => existing.merge(table.clone()),
                None => tables.push(table.clone()),
            }
        }

        // Primary provider: the one with the most resource types.
        tables.sort_by(|a, b| {
            let ca = counts.get(&a.provider).copied().unwrap_or_default();
            let cb = counts.get(&b.provider).copied().unwrap_or_default();
            cb.cmp(&ca).then_with(|| a.provider.cmp(&b.provider))
        });

        let contexts = tables
            .into_iter()
            .map(|t| ProviderContext::compile(t, registry))
            .collect::<Result<Vec<_>>>()?;

        let diagnostics = unknown
            .into_iter()
            .map(|t| {
                Diagnostic::new(
                    DiagnosticKind::UnknownResourceType,
                    None,
                    format!("no provider table for '{}', using generic treatment", t),
                )
            })
            .collect();

        let set = Self::new(contexts);
        info!(
            providers = ?set.contexts.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "providers detected"
        );
        Ok((set, diagnostics))
    }

    pub fn contexts(&self) -> &[ProviderContext] {
        &self.contexts
    }

    /// Primary provider tag, `generic` when nothing was detected.
    pub fn primary(&self) -> &str {
        self.contexts
            .first()
            .map(|c| c.name())
            .unwrap_or(GENERIC_PROVIDER)
    }

    pub fn context_for(&self, resource_type: &str) -> &ProviderContext {
        self.contexts
            .iter()
            .find(|c| c.claims(resource_type))
            .unwrap_or(&self.generic)
    }

    fn any_table(&self, f: impl Fn(&ProviderTable) -> bool) -> bool {
        self.contexts.iter().any(|c| f(&c.table))
    }

    pub fn is_group(&self, resource_type: &str) -> bool {
        self.any_table(|t| t.group_types.iter().any(|p| p.matches_type(resource_type)))
    }

    pub fn is_reverse_arrow(&self, resource_type: &str) -> bool {
        self.any_table(|t| {
            t.reverse_arrow_types
                .iter()
                .any(|p| p.matches_type(resource_type))
        })
    }

    pub fn is_hidden(&self, resource_type: &str) -> bool {
        self.any_table(|t| t.hidden_types.iter().any(|p| p.matches_type(resource_type)))
    }

    pub fn is_protective(&self, resource_type: &str) -> bool {
        self.any_table(|t| {
            t.protective_types
                .iter()
                .any(|p| p.matches_type(resource_type))
        })
    }

    /// Variant name for a resource, from the first matching rule.
    pub fn variant(&self, resource_type: &str, attributes: &AttrBag) -> Option<String> {
        let rule = self
            .contexts
            .iter()
            .flat_map(|c| c.table.variants.iter())
            .find(|r| r.resource_type == resource_type)?;
        attributes
            .get(&rule.attribute)
            .and_then(Value::as_str)
            .and_then(|v| rule.values.get(v).cloned())
            .or_else(|| rule.default.clone())
    }

    /// Heuristic instance count from a list-valued attribute.
    pub fn cardinality_hint(&self, resource_type: &str, attributes: &AttrBag) -> Option<usize> {
        self.contexts
            .iter()
            .flat_map(|c| c.table.cardinality_rules.iter())
            .filter(|r| r.resource_type == resource_type)
            .find_map(|r| attributes.get(&r.attribute).and_then(Value::as_list).map(<[Value]>::len))
    }

    /// Implied-connection rules as (regex, target type).
    pub fn implied_connections(&self) -> impl Iterator<Item = &(Regex, String)> {
        self.contexts.iter().flat_map(|c| c.implied.iter())
    }

    pub fn auto_links(&self) -> impl Iterator<Item = &AutoLink> {
        self.contexts.iter().flat_map(|c| c.table.auto_links.iter())
    }

    /// Group-type lookup table for passes that test many nodes.
    pub fn group_lookup(&self) -> GroupLookup<'_> {
        GroupLookup {
            providers: self,
            cache: HashMap::new(),
        }
    }
}

/// Memoized [`ProviderSet::is_group`].
pub struct GroupLookup<'a> {
    providers: &'a ProviderSet,
    cache: HashMap<String, bool>,
}

impl GroupLookup<'_> {
    pub fn is_group(&mut self, resource_type: &str) -> bool {
        if let Some(hit) = self.cache.get(resource_type) {
            return *hit;
        }
        let hit = self.providers.is_group(resource_type);
        self.cache.insert(resource_type.to_string(), hit);
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aws() -> ProviderSet {
        let (set, diagnostics) = ProviderSet::detect(
            ["aws_vpc", "aws_subnet", "random_id"],
            &[],
            &CallbackRegistry::builtin(),
        )
        .unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::UnknownResourceType);
        set
    }

    #[test]
    fn test_builtin_tables_compile() {
        let registry = CallbackRegistry::builtin();
        for provider in ["aws", "azurerm"] {
            let table = ProviderTable::builtin(provider).unwrap().unwrap();
            let context = ProviderContext::compile(table, &registry).unwrap();
            assert!(!context.phases().is_empty());
            for phase in context.phases() {
                for handler in &phase.handlers {
                    assert!(!handler.description.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_detection_and_lookups() {
        let set = aws();
        assert_eq!(set.primary(), "aws");
        assert!(set.is_group("aws_vpc"));
        assert!(set.is_group("aws_az"));
        assert!(!set.is_group("aws_instance"));
        assert!(set.is_reverse_arrow("aws_subnet"));
        assert!(set.is_protective("aws_security_group"));
        assert_eq!(set.context_for("random_id").name(), GENERIC_PROVIDER);
    }

    #[test]
    fn test_variant_and_cardinality_hint() {
        let set = aws();
        let mut attrs = AttrBag::new();
        attrs.insert("load_balancer_type".into(), Value::string("network"));
        attrs.insert(
            "subnets".into(),
            Value::List(vec![Value::string("a"), Value::string("b")]),
        );
        assert_eq!(set.variant("aws_lb", &attrs).as_deref(), Some("nlb"));
        assert_eq!(set.cardinality_hint("aws_lb", &attrs), Some(2));
        assert_eq!(set.variant("aws_lb", &AttrBag::new()).as_deref(), Some("alb"));
    }

    #[test]
    fn test_handler_requires_description() {
        let table = ProviderTable::from_yaml(
            r#"
provider: custom
phases:
  - name: one
    handlers:
      custom_thing:
        description: ""
        operations:
          - op: delete
"#,
        )
        .unwrap();
        let err = ProviderContext::compile(table, &CallbackRegistry::builtin()).unwrap_err();
        assert!(matches!(err, ArchGraphError::InvalidHandler { .. }));
    }

    #[test]
    fn test_unknown_callback_rejected_at_load() {
        let table = ProviderTable::from_yaml(
            r#"
provider: custom
phases:
  - name: one
    handlers:
      custom_thing:
        description: does things
        callback: no_such_callback
"#,
        )
        .unwrap();
        let err = ProviderContext::compile(table, &CallbackRegistry::builtin()).unwrap_err();
        assert!(matches!(err, ArchGraphError::UnknownCallback(name) if name == "no_such_callback"));
    }

    #[test]
    fn test_extra_table_merges_into_builtin() {
        let extra = ProviderTable::from_yaml(
            r#"
provider: aws
hidden_types: [aws_instance]
phases:
  - name: compute
    handlers:
      aws_instance:
        description: drop instances
        operations:
          - op: delete
"#,
        )
        .unwrap();
        let (set, _) =
            ProviderSet::detect(["aws_instance"], &[extra], &CallbackRegistry::builtin()).unwrap();
        assert!(set.is_hidden("aws_instance"));
        let compute = set.contexts()[0]
            .phases()
            .iter()
            .find(|p| p.name == "compute")
            .unwrap();
        assert!(compute
            .handlers
            .iter()
            .any(|h| h.description == "drop instances"));
    }

    #[test]
    fn test_custom_provider_from_extra_table() {
        let extra = ProviderTable::from_yaml("provider: google\ngroup_types: [google_compute_network]\n").unwrap();
        let (set, diagnostics) = ProviderSet::detect(
            ["google_compute_network"],
            &[extra],
            &CallbackRegistry::builtin(),
        )
        .unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(set.primary(), "google");
        assert!(set.is_group("google_compute_network"));
    }
}
