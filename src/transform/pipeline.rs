//! Phase dispatch.
//!
//! One run is a strict sequence: interpret, detect providers, build,
//! expand, the provider phases, then validate and annotate. Every stage
//! ends with a lockstep check on the graph so a defect is reported with
//! the stage that introduced it. Independent runs share nothing but the
//! immutable [`Pipeline`], so [`Pipeline::build_many`] fans them out on
//! rayon.

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

use crate::annotate::Annotations;
use crate::config::ArchConfig;
use crate::error::{ArchGraphError, Result};
use crate::graph::{Diagnostic, GraphBuilder, GraphModel, NodeMeta, Snapshot, Stage};
use crate::interpreter::Interpreter;
use crate::plan::PlanInput;
use crate::provider::{
    CallbackOrder, CallbackRegistry, Handler, HandlerCtx, ProviderSet, ProviderTable,
};
use crate::validate::{check_shared_children, Validator};

use super::expand::expand;
use super::ops::OpContext;

// ─── Cancellation ───────────────────────────────────────────────

/// Shared stop flag plus an optional deadline, polled at phase boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same flag, with a deadline `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    pub fn check(&self, phase: &str) -> Result<()> {
        if self.is_cancelled() {
            warn!(phase = %phase, "run cancelled");
            return Err(ArchGraphError::Cancelled {
                phase: phase.to_string(),
            });
        }
        Ok(())
    }
}

// ─── Pipeline ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub graph: GraphModel,
    pub diagnostics: Vec<Diagnostic>,
    /// Graph as it stood after the provider phases, when requested.
    pub snapshot: Option<Snapshot>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    interpreter: Interpreter,
    registry: CallbackRegistry,
    tables: Vec<ProviderTable>,
    validator: Validator,
    annotations: Option<Annotations>,
    title: Option<String>,
    timeout: Option<Duration>,
    cancel: CancelToken,
    capture_snapshot: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            interpreter: Interpreter::default(),
            registry: CallbackRegistry::builtin(),
            tables: Vec::new(),
            validator: Validator::default(),
            annotations: None,
            title: None,
            timeout: None,
            cancel: CancelToken::new(),
            capture_snapshot: false,
        }
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline configured from a run configuration; extra provider tables
    /// are loaded here so a bad file fails before any work starts.
    pub fn from_config(config: &ArchConfig) -> Result<Self> {
        let tables = config
            .pipeline
            .provider_files
            .iter()
            .map(|path| ProviderTable::load(path))
            .collect::<Result<Vec<_>>>()?;
        let timeout = match config.pipeline.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(Self {
            interpreter: Interpreter::new(config.interpreter.max_iterations),
            tables,
            validator: Validator::new(config.validator.keep_standalone),
            timeout,
            ..Self::default()
        })
    }

    pub fn with_registry(mut self, registry: CallbackRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_table(mut self, table: ProviderTable) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = Some(annotations);
        self
    }

    pub fn with_title<T: Into<String>>(mut self, title: T) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn capture_snapshot(mut self, capture: bool) -> Self {
        self.capture_snapshot = capture;
        self
    }

    fn token(&self) -> CancelToken {
        match self.timeout {
            Some(timeout) => self.cancel.with_timeout(timeout),
            None => self.cancel.clone(),
        }
    }

    /// Run every stage over one record set.
    pub fn run(&self, plan: &PlanInput) -> Result<PipelineOutput> {
        let token = self.token();
        let mut diagnostics = Vec::new();

        token.check(Stage::Interpret.as_str())?;
        let resolution = self.interpreter.resolve(plan);
        diagnostics.extend(resolution.diagnostics.iter().cloned());

        let (providers, detected) = ProviderSet::detect(
            resolution.resources.iter().map(|r| r.resource_type.as_str()),
            &self.tables,
            &self.registry,
        )?;
        report(&detected);
        diagnostics.extend(detected);

        token.check(Stage::Build.as_str())?;
        let mut builder = GraphBuilder::new(&providers);
        if let Some(title) = &self.title {
            builder = builder.with_title(title.clone());
        }
        let (mut graph, built) = builder.build(&resolution);
        diagnostics.extend(built);
        graph.check_integrity(Stage::Build.as_str())?;

        token.check(Stage::Expand.as_str())?;
        diagnostics.extend(expand(&mut graph, &providers));
        graph.check_integrity(Stage::Expand.as_str())?;

        self.transform(&mut graph, &providers, &token, &mut diagnostics)?;
        let snapshot = self
            .capture_snapshot
            .then(|| Snapshot::capture(&graph, Stage::Transform));

        let mut output = self.finish(graph, &providers, &token, diagnostics)?;
        output.snapshot = snapshot;
        Ok(output)
    }

    /// Resume from a snapshot: validate and annotate only.
    pub fn replay(&self, snapshot: Snapshot) -> Result<PipelineOutput> {
        let token = self.token();
        let _span = info_span!("replay", stage = %snapshot.stage, run_id = %snapshot.run_id).entered();
        let graph = snapshot.restore()?;
        let (providers, detected) = self.detect_restored(&graph)?;
        self.finish(graph, &providers, &token, detected)
    }

    /// Structural check of a snapshot under the same provider tables a
    /// replay would use. Nothing is tidied or annotated.
    pub fn check_snapshot(&self, snapshot: Snapshot) -> Result<GraphModel> {
        let _span = info_span!("check", stage = %snapshot.stage, run_id = %snapshot.run_id).entered();
        let graph = snapshot.restore()?;
        let (providers, _) = self.detect_restored(&graph)?;
        check_shared_children(&graph, &providers)?;
        Ok(graph)
    }

    /// Providers for a restored graph, from its non-synthetic types.
    fn detect_restored(&self, graph: &GraphModel) -> Result<(ProviderSet, Vec<Diagnostic>)> {
        let types: Vec<&str> = graph
            .metadata()
            .values()
            .filter(|m| !m.synthetic)
            .map(|m| m.resource_type.as_str())
            .collect();
        ProviderSet::detect(types, &self.tables, &self.registry)
    }

    /// Independent runs on the rayon pool, results in input order.
    pub fn build_many(&self, plans: &[PlanInput]) -> Vec<Result<PipelineOutput>> {
        plans.par_iter().map(|plan| self.run(plan)).collect()
    }

    fn finish(
        &self,
        mut graph: GraphModel,
        providers: &ProviderSet,
        token: &CancelToken,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<PipelineOutput> {
        token.check(Stage::Validate.as_str())?;
        self.validator.validate(&mut graph, providers)?;

        token.check(Stage::Annotate.as_str())?;
        if let Some(annotations) = &self.annotations {
            let applied = annotations.apply(&mut graph, providers);
            report(&applied);
            diagnostics.extend(applied);
            graph.check_integrity(Stage::Annotate.as_str())?;
        }

        info!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            diagnostics = diagnostics.len(),
            "pipeline complete"
        );
        Ok(PipelineOutput {
            graph,
            diagnostics,
            snapshot: None,
        })
    }

    // ─── Provider phases ────────────────────────────────────────

    fn transform(
        &self,
        graph: &mut GraphModel,
        providers: &ProviderSet,
        token: &CancelToken,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let _span = info_span!("transform").entered();
        for context in providers.contexts() {
            for phase in context.phases() {
                token.check(&phase.name)?;
                let _phase = info_span!("phase", provider = %context.name(), phase = %phase.name).entered();
                for handler in &phase.handlers {
                    token.check(&phase.name)?;
                    run_handler(graph, providers, handler, diagnostics)?;
                }
                graph.check_integrity(&phase.name)?;
            }
        }
        add_auto_links(graph, providers);
        prune_redundant_containment(graph, providers);
        graph.check_integrity(Stage::Transform.as_str())
    }
}

fn report(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        warn!("{}", diagnostic);
    }
}

fn run_callback(
    graph: &mut GraphModel,
    handler: &Handler,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<()> {
    if let Some((name, callback)) = &handler.callback {
        let matched = graph.nodes_matching(&handler.pattern);
        debug!(callback = %name, matched = matched.len(), "running callback");
        let mut ctx = HandlerCtx {
            pattern: &handler.pattern,
            matched,
            diagnostics,
        };
        callback(graph, &mut ctx)?;
    }
    Ok(())
}

fn run_operations(
    graph: &mut GraphModel,
    providers: &ProviderSet,
    handler: &Handler,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for op in &handler.operations {
        let mut ctx = OpContext {
            providers,
            subject: &handler.pattern,
            diagnostics: &mut *diagnostics,
        };
        op.apply(graph, &mut ctx);
    }
}

/// One handler entry; a pattern that matches nothing is a no-op.
fn run_handler(
    graph: &mut GraphModel,
    providers: &ProviderSet,
    handler: &Handler,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<()> {
    debug!(pattern = %handler.pattern.as_str(), description = %handler.description, "handler");
    match handler.order {
        CallbackOrder::Before => {
            run_callback(graph, handler, diagnostics)?;
            run_operations(graph, providers, handler, diagnostics);
            Ok(())
        }
        CallbackOrder::After => {
            run_operations(graph, providers, handler, diagnostics);
            run_callback(graph, handler, diagnostics)
        }
    }
}

/// Synthetic edges from provider tables, added only when a target exists.
fn add_auto_links(graph: &mut GraphModel, providers: &ProviderSet) {
    for link in providers.auto_links() {
        let targets = graph.nodes_matching(&link.to);
        if targets.is_empty() {
            continue;
        }
        if !graph.contains(&link.from) {
            let mut meta = NodeMeta::synthetic(&link.from);
            meta.provider = graph.provider().to_string();
            graph.insert_node(link.from.as_str(), meta);
        }
        for target in targets {
            graph.add_edge(&link.from, &target);
            if let (Some(label), Some(meta)) = (&link.label, graph.meta_mut(&link.from)) {
                meta.edge_labels.insert(target.clone(), label.clone());
            }
        }
        debug!(from = %link.from, "auto link added");
    }
}

/// Drop a group's edge to a child that one of its group descendants
/// already contains.
fn prune_redundant_containment(graph: &mut GraphModel, providers: &ProviderSet) {
    let mut groups = providers.group_lookup();
    let group_ids: Vec<String> = graph
        .sorted_ids()
        .into_iter()
        .filter(|n| groups.is_group(graph.resource_type_of(n)))
        .collect();
    for group in &group_ids {
        for child in graph.children(group).to_vec() {
            let inner = graph.parents(&child).into_iter().any(|p| {
                &p != group
                    && groups.is_group(graph.resource_type_of(&p))
                    && graph.ancestors(&p).contains(group)
            });
            if inner {
                graph.remove_edge(group, &child);
                debug!(group = %group, node = %child, "pruned redundant containment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::ResourcePattern;
    use crate::provider::ProviderContext;
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"{
        "resources": [
            {"type": "aws_vpc", "name": "main", "attributes": {"cidr_block": "10.0.0.0/16"}},
            {"type": "aws_subnet", "name": "a",
             "attributes": {"vpc_id": "${aws_vpc.main.id}", "availability_zone": "us-east-1a"}},
            {"type": "aws_instance", "name": "web",
             "attributes": {"subnet_id": "${aws_subnet.a.id}"}}
        ]
    }"#;

    fn plan() -> PlanInput {
        PlanInput::from_json(PLAN).unwrap()
    }

    #[test]
    fn test_run_builds_zone_hierarchy() {
        let output = Pipeline::new().run(&plan()).unwrap();
        let graph = &output.graph;
        assert!(graph.has_edge("aws_vpc.main", "aws_az.us_east_1a"));
        assert!(graph.has_edge("aws_az.us_east_1a", "aws_subnet.a"));
        assert!(graph.has_edge("aws_subnet.a", "aws_instance.web"));
        assert!(!graph.has_edge("aws_vpc.main", "aws_subnet.a"));
        assert!(graph.check_integrity("test").is_ok());
    }

    #[test]
    fn test_cancelled_run_returns_no_graph() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Pipeline::new().with_cancel(cancel).run(&plan()).unwrap_err();
        assert!(matches!(err, ArchGraphError::Cancelled { .. }));
    }

    #[test]
    fn test_expired_deadline_cancels() {
        let err = Pipeline::new()
            .with_timeout(Duration::ZERO)
            .run(&plan())
            .unwrap_err();
        assert!(matches!(err, ArchGraphError::Cancelled { .. }));
    }

    #[test]
    fn test_callback_order_relative_to_operations() {
        // Records how many nodes the callback saw on a marker node.
        fn count(graph: &mut GraphModel, ctx: &mut HandlerCtx<'_>) -> Result<()> {
            let mut meta = NodeMeta::synthetic("tv_marker.seen");
            meta.attributes
                .insert("matched".into(), crate::graph::Value::Int(ctx.matched.len() as i64));
            graph.insert_node("tv_marker.seen", meta);
            Ok(())
        }
        let handler = |order| Handler {
            pattern: ResourcePattern::new("aws_instance").unwrap(),
            description: "count then delete".into(),
            operations: vec![crate::transform::Operation::Delete {
                resource: None,
                keep_edges: false,
            }],
            callback: Some(("count".to_string(), count as crate::provider::Callback)),
            order,
        };
        let providers = ProviderSet::new(vec![ProviderContext::generic()]);
        let seen = |order| {
            let mut graph = GraphModel::new("aws");
            graph.ensure_node("aws_instance.web");
            graph.ensure_node("aws_instance.db");
            let mut diagnostics = Vec::new();
            run_handler(&mut graph, &providers, &handler(order), &mut diagnostics).unwrap();
            assert!(graph.nodes_of_type("aws_instance").is_empty());
            graph.meta("tv_marker.seen").unwrap().attributes["matched"].as_i64()
        };
        assert_eq!(seen(CallbackOrder::Before), Some(2));
        assert_eq!(seen(CallbackOrder::After), Some(0));
    }

    #[test]
    fn test_redundant_containment_pruned() {
        let providers = ProviderSet::detect(["aws_vpc"], &[], &CallbackRegistry::builtin())
            .unwrap()
            .0;
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_vpc.main", "aws_subnet.a");
        graph.add_edge("aws_subnet.a", "aws_instance.web");
        graph.add_edge("aws_vpc.main", "aws_instance.web");
        prune_redundant_containment(&mut graph, &providers);
        assert_eq!(graph.children("aws_vpc.main"), ["aws_subnet.a"]);
    }

    #[test]
    fn test_auto_link_only_when_target_present() {
        let providers = ProviderSet::detect(["aws_vpc"], &[], &CallbackRegistry::builtin())
            .unwrap()
            .0;
        let mut graph = GraphModel::new("aws");
        graph.ensure_node("aws_vpc.main");
        add_auto_links(&mut graph, &providers);
        assert!(!graph.contains("tv_aws_internet.internet"));

        graph.add_edge("aws_vpc.main", "aws_internet_gateway.gw");
        add_auto_links(&mut graph, &providers);
        assert!(graph.has_edge("tv_aws_internet.internet", "aws_internet_gateway.gw"));
        assert!(graph.meta("tv_aws_internet.internet").unwrap().synthetic);
    }

    #[test]
    fn test_build_many_isolated_runs() {
        let results = Pipeline::new().build_many(&[plan(), plan()]);
        assert_eq!(results.len(), 2);
        let a = results[0].as_ref().unwrap();
        let b = results[1].as_ref().unwrap();
        assert_eq!(a.graph, b.graph);
    }

    #[test]
    fn test_snapshot_replay_matches_run() {
        let pipeline = Pipeline::new().capture_snapshot(true);
        let output = pipeline.run(&plan()).unwrap();
        let snapshot = output.snapshot.clone().unwrap();
        assert_eq!(snapshot.stage, Stage::Transform);
        let replayed = pipeline.replay(snapshot).unwrap();
        assert_eq!(replayed.graph, output.graph);
    }

    #[test]
    fn test_check_snapshot_uses_configured_tables() {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_ecs_cluster.a", "aws_ecs_service.api");
        graph.add_edge("aws_ecs_cluster.b", "aws_ecs_service.api");
        let snapshot = Snapshot::capture(&graph, Stage::Transform);

        assert!(Pipeline::new().check_snapshot(snapshot.clone()).is_ok());

        let clusters = ProviderTable::from_yaml("provider: aws\ngroup_types: [aws_ecs_cluster]\n").unwrap();
        let pipeline = Pipeline::new().with_table(clusters);
        match pipeline.check_snapshot(snapshot.clone()) {
            Err(ArchGraphError::SharedChild { child, .. }) => assert_eq!(child, "aws_ecs_service.api"),
            other => panic!("unexpected {:?}", other.map(|g| g.len())),
        }
        assert!(pipeline.replay(snapshot).is_err());
    }
}
