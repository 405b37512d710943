//! Run configuration, read from `archgraph.toml`.
//!
//! Every section and field is optional. A missing file means defaults; a
//! file that fails to parse is reported and also falls back to defaults so
//! a typo never blocks a diagram.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::interpreter::DEFAULT_MAX_ITERATIONS;

pub const DEFAULT_CONFIG_FILE: &str = "archgraph.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchConfig {
    pub interpreter: InterpreterConfig,
    pub pipeline: PipelineConfig,
    pub validator: ValidatorConfig,
    pub acquisition: AcquisitionConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Fixed-point pass budget.
    pub max_iterations: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Zero disables the deadline.
    pub timeout_secs: u64,
    /// Provider tables merged over the built-in ones.
    pub provider_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub keep_standalone: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Exporter command line, program first.
    pub command: Vec<String>,
    /// Retries after a transient failure; values above one are capped.
    pub retries: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            retries: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Renderer command line; it reads the output document on stdin.
    pub command: Vec<String>,
}

impl ArchConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from `path`, falling back to defaults when the file is missing
    /// or malformed.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Self::default();
        }
        let parsed = fs::read_to_string(path)
            .map_err(Into::into)
            .and_then(|text| Self::from_toml(&text));
        match parsed {
            Ok(config) => {
                info!(path = %path.display(), "loaded configuration");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid configuration, using defaults");
                Self::default()
            }
        }
    }
}
