//! Graph serialization: the JSON output document handed to renderers and
//! the debug/replay snapshot.
//!
//! Both carry the adjacency map (node → ordered children) and a parallel
//! metadata dictionary. The output document holds nothing run-specific, so
//! two runs over the same graph serialize byte-identically; the snapshot
//! adds a format version, the stage it was taken after, a run id and a
//! timestamp.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::engine::GraphModel;
use super::types::NodeMeta;
use crate::error::{ArchGraphError, Result};

/// Snapshots replay only within the same major version.
pub const PIPELINE_MAJOR_VERSION: u32 = 1;
const SNAPSHOT_MINOR_VERSION: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Interpret,
    Build,
    Expand,
    Transform,
    Validate,
    Annotate,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Interpret,
        Stage::Build,
        Stage::Expand,
        Stage::Transform,
        Stage::Validate,
        Stage::Annotate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Interpret => "interpret",
            Stage::Build => "build",
            Stage::Expand => "expand",
            Stage::Transform => "transform",
            Stage::Validate => "validate",
            Stage::Annotate => "annotate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ArchGraphError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| ArchGraphError::UnknownStage(s.to_string()))
    }
}

/// Finalized graph as consumed by renderers and other tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub provider: String,
    pub graph: IndexMap<String, Vec<String>>,
    pub metadata: BTreeMap<String, NodeMeta>,
}

impl OutputDocument {
    pub fn from_graph(graph: &GraphModel) -> Self {
        Self {
            title: graph.title().map(str::to_string),
            provider: graph.provider().to_string(),
            graph: graph.adjacency().clone(),
            metadata: graph.metadata().clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        info!(path = %path.display(), nodes = self.graph.len(), "wrote output document");
        Ok(())
    }
}

/// Graph captured mid-pipeline, sufficient to resume from the Validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: String,
    pub stage: Stage,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub provider: String,
    pub graph: IndexMap<String, Vec<String>>,
    pub metadata: BTreeMap<String, NodeMeta>,
}

impl Snapshot {
    pub fn capture(graph: &GraphModel, stage: Stage) -> Self {
        Self {
            format_version: format!("{}.{}", PIPELINE_MAJOR_VERSION, SNAPSHOT_MINOR_VERSION),
            stage,
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            title: graph.title().map(str::to_string),
            provider: graph.provider().to_string(),
            graph: graph.adjacency().clone(),
            metadata: graph.metadata().clone(),
        }
    }

    fn check_version(&self) -> Result<()> {
        let major = self
            .format_version
            .split('.')
            .next()
            .and_then(|m| m.parse::<u32>().ok());
        if major != Some(PIPELINE_MAJOR_VERSION) {
            return Err(ArchGraphError::SnapshotVersion {
                found: self.format_version.clone(),
                expected: PIPELINE_MAJOR_VERSION,
            });
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(text)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        info!(
            path = %path.display(),
            stage = %self.stage,
            run_id = %self.run_id,
            "wrote snapshot"
        );
        Ok(())
    }

    /// Rebuild the graph, checking version and the lockstep invariant.
    pub fn restore(self) -> Result<GraphModel> {
        self.check_version()?;
        let graph = GraphModel::from_parts(self.provider, self.title, self.graph, self.metadata);
        graph.check_integrity("replay")?;
        Ok(graph)
    }
}
