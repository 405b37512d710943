//! Graph module - the shared model every stage reads and mutates.
//!
//! Provides the node metadata types, identifier helpers, the adjacency
//! engine, the builder that seeds it from resolved resources, and
//! snapshot/output serialization.

pub mod builder;
pub mod engine;
pub mod id;
pub mod persistence;
pub mod types;

pub use builder::{build_graph, GraphBuilder};
pub use engine::{GraphModel, GraphStats};
pub use persistence::{OutputDocument, Snapshot, Stage, PIPELINE_MAJOR_VERSION};
pub use types::{AttrBag, Diagnostic, DiagnosticKind, NodeMeta, Unresolved, Value};
