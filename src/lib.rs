//! # archgraph
//!
//! Turns an infrastructure-as-code dependency graph into a hierarchical,
//! diagram-ready graph.
//!
//! ## Key Features
//!
//! - **Interpreted**: variables, locals, module outputs, `count` and
//!   `for_each` are resolved before any edge is drawn
//! - **Rule-driven**: provider tables map resource-type patterns to
//!   declarative operations and registered callbacks
//! - **Checked**: every stage preserves metadata/adjacency lockstep and the
//!   result never has a child shared by two unrelated containers
//! - **Replayable**: snapshots resume from the validator byte-identically
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archgraph::{OutputDocument, Pipeline, PlanInput};
//! use std::path::Path;
//!
//! let plan = PlanInput::load(Path::new("plan.json"))?;
//! let output = Pipeline::new().run(&plan)?;
//! println!("{}", OutputDocument::from_graph(&output.graph).to_json()?);
//! # Ok::<(), archgraph::ArchGraphError>(())
//! ```

pub mod annotate;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod interpreter;
pub mod pattern;
pub mod plan;
pub mod provider;
pub mod render;
pub mod transform;
pub mod validate;

// Re-exports for convenience
pub use error::{ArchGraphError, Result};

// Graph re-exports
pub use graph::{
    build_graph, Diagnostic, DiagnosticKind, GraphModel, GraphStats, NodeMeta, OutputDocument,
    Snapshot, Stage, Value,
};

pub use annotate::Annotations;
pub use config::ArchConfig;
pub use interpreter::{Interpreter, Resolution};
pub use pattern::ResourcePattern;
pub use plan::{PlanInput, PlanSource};
pub use provider::{CallbackRegistry, ProviderSet, ProviderTable};
pub use render::{render_graph, Renderer};
pub use transform::{CancelToken, Operation, Pipeline, PipelineOutput};
pub use validate::Validator;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn run(json: &str) -> PipelineOutput {
        Pipeline::new().run(&PlanInput::from_json(json).unwrap()).unwrap()
    }

    fn document(graph: &GraphModel) -> String {
        OutputDocument::from_graph(graph).to_json().unwrap()
    }

    fn assert_lockstep(graph: &GraphModel) {
        let nodes: BTreeSet<&String> = graph.adjacency().keys().collect();
        let metas: BTreeSet<&String> = graph.metadata().keys().collect();
        assert_eq!(nodes, metas);
        assert!(graph.check_integrity("test").is_ok());
    }

    #[test]
    fn test_load_balancer_split_per_subnet() {
        let output = run(
            r#"{"resources": [
            {"type": "aws_vpc", "name": "main"},
            {"type": "aws_subnet", "name": "a",
             "attributes": {"vpc_id": "${aws_vpc.main.id}", "availability_zone": "us-east-1a"}},
            {"type": "aws_subnet", "name": "b",
             "attributes": {"vpc_id": "${aws_vpc.main.id}", "availability_zone": "us-east-1b"}},
            {"type": "aws_lb", "name": "web",
             "attributes": {"load_balancer_type": "application",
                            "subnets": ["${aws_subnet.a.id}", "${aws_subnet.b.id}"]}}
        ]}"#,
        );
        let graph = &output.graph;
        assert!(!graph.contains("aws_lb.web"));
        assert_eq!(graph.children("aws_subnet.a"), ["aws_lb.web~1"]);
        assert_eq!(graph.children("aws_subnet.b"), ["aws_lb.web~2"]);
        assert_eq!(graph.parents("aws_lb.web~1"), vec!["aws_subnet.a"]);
        assert_eq!(graph.meta("aws_lb.web~2").unwrap().variant.as_deref(), Some("alb"));
        assert!(graph.has_edge("aws_az.us_east_1a", "aws_subnet.a"));
        assert!(graph.has_edge("aws_vpc.main", "aws_az.us_east_1b"));
        assert_lockstep(graph);
    }

    #[test]
    fn test_protective_resource_cloned_per_referencing_resource() {
        let output = run(
            r#"{"resources": [
            {"type": "aws_vpc", "name": "main"},
            {"type": "aws_security_group", "name": "web", "attributes": {"vpc_id": "${aws_vpc.main.id}"}},
            {"type": "aws_instance", "name": "a", "attributes": {"vpc_security_group_ids": ["${aws_security_group.web.id}"]}},
            {"type": "aws_instance", "name": "b", "attributes": {"vpc_security_group_ids": ["${aws_security_group.web.id}"]}},
            {"type": "aws_instance", "name": "c", "attributes": {"vpc_security_group_ids": ["${aws_security_group.web.id}"]}}
        ]}"#,
        );
        let graph = &output.graph;
        let clones = graph.nodes_of_type("aws_security_group");
        assert_eq!(
            clones,
            vec![
                "aws_security_group.web~1",
                "aws_security_group.web~2",
                "aws_security_group.web~3"
            ]
        );
        let guarded: Vec<&str> = clones
            .iter()
            .map(|c| {
                assert_eq!(graph.children(c).len(), 1);
                graph.children(c)[0].as_str()
            })
            .collect();
        assert_eq!(guarded, vec!["aws_instance.a", "aws_instance.b", "aws_instance.c"]);
        for instance in ["aws_instance.a", "aws_instance.b", "aws_instance.c"] {
            assert!(graph.children(instance).is_empty());
        }
        assert_lockstep(graph);
    }

    const ROLE_PLAN: &str = r#"{"resources": [
        {"type": "aws_iam_role", "name": "app"},
        {"type": "aws_instance", "name": "a", "attributes": {"role": "${aws_iam_role.app.arn}"}},
        {"type": "aws_instance", "name": "b", "attributes": {"role": "${aws_iam_role.app.arn}"}}
    ]}"#;

    #[test]
    fn test_disconnect_applied_after_handlers() {
        let plan = PlanInput::from_json(ROLE_PLAN).unwrap();
        let before = Pipeline::new().run(&plan).unwrap();
        assert!(before.graph.has_edge("aws_instance.a", "aws_iam_role.app"));
        assert!(before.graph.has_edge("aws_group.shared_services", "aws_iam_role.app"));

        let annotations =
            Annotations::from_yaml("disconnect:\n  aws_instance.*: [aws_iam_role.app]\n").unwrap();
        let after = Pipeline::new().with_annotations(annotations).run(&plan).unwrap();
        assert!(!after.graph.has_edge("aws_instance.a", "aws_iam_role.app"));
        assert!(!after.graph.has_edge("aws_instance.b", "aws_iam_role.app"));
        assert!(after.graph.has_edge("aws_group.shared_services", "aws_iam_role.app"));
        assert_lockstep(&after.graph);
    }

    #[test]
    fn test_reference_cycle_keeps_resource_with_placeholder() {
        let output = run(
            r#"{"resources": [
            {"type": "aws_subnet", "name": "s"},
            {"type": "aws_instance", "name": "a",
             "attributes": {"subnet_id": "${aws_subnet.s.id}", "peer": "${aws_instance.b.peer}"}},
            {"type": "aws_instance", "name": "b",
             "attributes": {"subnet_id": "${aws_subnet.s.id}", "peer": "${aws_instance.a.peer}"}}
        ]}"#,
        );
        let meta = output.graph.meta("aws_instance.a").unwrap();
        assert_eq!(meta.attributes["peer"], Value::unresolved("aws_instance.b.peer"));
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::ReferenceCycle));
        assert_lockstep(&output.graph);
    }

    #[test]
    fn test_replay_output_is_byte_identical() {
        let plan = PlanInput::from_json(ROLE_PLAN).unwrap();
        let annotations = Annotations::from_yaml("title: Roles\nremove: [aws_instance.b]\n").unwrap();
        let pipeline = Pipeline::new()
            .with_annotations(annotations)
            .capture_snapshot(true);
        let output = pipeline.run(&plan).unwrap();

        let text = output.snapshot.as_ref().unwrap().to_json().unwrap();
        let replayed = pipeline.replay(Snapshot::from_json(&text).unwrap()).unwrap();
        assert_eq!(document(&replayed.graph), document(&output.graph));
        assert_eq!(replayed.graph.title(), Some("Roles"));
    }

    #[test]
    fn test_for_each_siblings_are_deterministic() {
        let json = r#"{"resources": [
            {"type": "aws_kms_key", "name": "k"},
            {"type": "aws_s3_bucket", "name": "b",
             "for_each": {"zeta": "z", "alpha": "a", "mid": "m"},
             "attributes": {"bucket": "${each.key}", "kms_master_key_id": "${aws_kms_key.k.arn}"}}
        ]}"#;
        let first = run(json);
        let second = run(json);
        assert_eq!(document(&first.graph), document(&second.graph));

        let keys: Vec<String> = (1..=3)
            .map(|n| {
                let meta = first.graph.meta(&format!("aws_s3_bucket.b~{}", n)).unwrap();
                meta.instance_keys[0].clone()
            })
            .collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
        assert_eq!(
            first.graph.meta("aws_s3_bucket.b~1").unwrap().attributes["bucket"],
            Value::string("alpha")
        );
    }

    #[test]
    fn test_match_by_suffix_yields_one_edge_per_instance() {
        let output = run(
            r#"{"resources": [
            {"type": "aws_instance", "name": "app", "count": 3},
            {"type": "aws_lb", "name": "front", "count": 3,
             "attributes": {"targets": "${aws_instance.app[*].id}"}}
        ]}"#,
        );
        let graph = &output.graph;
        let edges: Vec<(String, String)> = graph
            .edges()
            .into_iter()
            .filter(|(from, to)| {
                graph.resource_type_of(from) == "aws_lb" && graph.resource_type_of(to) == "aws_instance"
            })
            .collect();
        assert_eq!(edges.len(), 3);
        for (from, to) in &edges {
            assert_eq!(graph::id::suffix(from), graph::id::suffix(to));
        }
        assert_lockstep(graph);
    }

    #[test]
    fn test_every_stage_keeps_lockstep() {
        let output = run(
            r#"{"resources": [
            {"type": "aws_vpc", "name": "main"},
            {"type": "aws_subnet", "name": "private", "count": 2,
             "attributes": {"vpc_id": "${aws_vpc.main.id}", "availability_zone": "zone-${count.index}"}},
            {"type": "aws_nat_gateway", "name": "nat", "attributes": {"subnet_id": "${aws_subnet.private[0].id}"}},
            {"type": "aws_internet_gateway", "name": "gw", "attributes": {"vpc_id": "${aws_vpc.main.id}"}},
            {"type": "aws_cloudwatch_log_group", "name": "one"},
            {"type": "aws_cloudwatch_log_group", "name": "two"},
            {"type": "random_id", "name": "suffix"}
        ]}"#,
        );
        let graph = &output.graph;
        assert_lockstep(graph);
        assert!(graph.has_edge("tv_aws_internet.internet", "aws_internet_gateway.gw"));
        assert!(graph.has_edge("aws_subnet.private~1", "aws_nat_gateway.nat"));
        assert!(graph.contains("aws_cloudwatch_log_group.logs"));
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::UnknownResourceType));
        assert!(validate::check_shared_children(
            graph,
            &ProviderSet::detect(["aws_vpc"], &[], &CallbackRegistry::builtin()).unwrap().0
        )
        .is_ok());
    }
}
