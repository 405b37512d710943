//! Input record set and the graph-acquisition boundary.
//!
//! The planning tool is an external collaborator: it hands over resource
//! records with raw attribute expressions, variable and local definitions,
//! the module-call tree, and its own coarse dependency edges. A
//! [`PlanSource`] produces that record set from a file or a process.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::error::{ArchGraphError, Result};
use crate::graph::{id, AttrBag, Value};

/// Everything the interpreter needs for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanInput {
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
    #[serde(default)]
    pub variables: Vec<VariableRecord>,
    #[serde(default)]
    pub locals: Vec<LocalRecord>,
    #[serde(default)]
    pub modules: Vec<ModuleCall>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    #[default]
    Managed,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    /// `""` for the root module, else `module.a.module.b`.
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub mode: ResourceMode,
    #[serde(default)]
    pub attributes: AttrBag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceRecord {
    /// Module-qualified identifier. Data sources carry a `data.` prefix
    /// on the local part.
    pub fn id(&self) -> String {
        match self.mode {
            ResourceMode::Managed => id::qualified(&self.module, &self.resource_type, &self.name),
            ResourceMode::Data => {
                id::qualified(&self.module, "data", &format!("{}.{}", self.resource_type, self.name))
            }
        }
    }

    pub fn is_data(&self) -> bool {
        self.mode == ResourceMode::Data
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    #[serde(default)]
    pub module: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Value supplied for this run (variable files, environment).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    #[serde(default)]
    pub module: String,
    pub name: String,
    /// Bare expression text (`var.a + 1`, `"${var.env}-web"`).
    pub expression: String,
}

/// A `module "name" { … }` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleCall {
    /// Path of the calling module, `""` for root.
    #[serde(default)]
    pub module: String,
    pub name: String,
    #[serde(default)]
    pub source: String,
    /// Argument expressions, evaluated in the caller's scope.
    #[serde(default)]
    pub arguments: AttrBag,
    /// Output expressions, evaluated in the called module's scope.
    #[serde(default)]
    pub outputs: AttrBag,
}

impl ModuleCall {
    /// Path of the module instance this call creates.
    pub fn path(&self) -> String {
        child_module_path(&self.module, &self.name)
    }
}

pub fn child_module_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        format!("module.{}", name)
    } else {
        format!("{}.module.{}", parent, name)
    }
}

/// Coarse edge from the planning tool, between full identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

impl PlanInput {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn managed_resources(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.resources.iter().filter(|r| !r.is_data())
    }
}

// ─── Acquisition ────────────────────────────────────────────────

/// Something that can produce a record set.
pub trait PlanSource {
    fn describe(&self) -> String;
    fn fetch(&self) -> Result<PlanInput>;
}

/// A record set already exported to a JSON file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PlanSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn fetch(&self) -> Result<PlanInput> {
        PlanInput::load(&self.path)
    }
}

/// Runs an external exporter and parses its stdout.
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

/// Output fragments that indicate a retry may help.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "too many requests",
    "rate exceeded",
    "throttl",
];

impl CommandSource {
    /// Build from a command line, program first. Returns `None` for an
    /// empty command.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            workdir: None,
        })
    }

    pub fn with_workdir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }
}

impl PlanSource for CommandSource {
    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn fetch(&self) -> Result<PlanInput> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        let output = command.output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let captured = format!("{}{}", stderr, stdout);
            let lowered = captured.to_lowercase();
            return Err(ArchGraphError::ExternalTool {
                tool: self.program.clone(),
                status: output.status.to_string(),
                transient: TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)),
                output: captured.trim().to_string(),
            });
        }
        PlanInput::from_json(&stdout)
    }
}

/// Acquisition is never retried more than this, whatever the configuration
/// asks for.
pub const MAX_RETRIES: usize = 1;

/// Fetch a record set, retrying transient failures up to `retries` times
/// (at most [`MAX_RETRIES`]).
pub fn fetch_plan(source: &dyn PlanSource, retries: usize) -> Result<PlanInput> {
    let retries = retries.min(MAX_RETRIES);
    let mut attempt = 0;
    loop {
        match source.fetch() {
            Ok(plan) => {
                info!(
                    source = %source.describe(),
                    resources = plan.resources.len(),
                    "acquired plan"
                );
                return Ok(plan);
            }
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(source = %source.describe(), attempt, error = %e, "transient acquisition failure, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "resources": [
            {"type": "aws_vpc", "name": "main", "attributes": {"cidr_block": "10.0.0.0/16"}},
            {"type": "aws_subnet", "name": "a", "module": "module.net",
             "attributes": {"vpc_id": "${var.vpc_id}"}, "count": 2},
            {"type": "aws_ami", "name": "ubuntu", "mode": "data"}
        ],
        "variables": [{"name": "env", "default": "dev"}],
        "modules": [{"name": "net", "source": "./net", "arguments": {"vpc_id": "${aws_vpc.main.id}"}}],
        "dependencies": [{"from": "module.net.aws_subnet.a", "to": "aws_vpc.main"}]
    }"#;

    #[test]
    fn test_parse_record_set() {
        let plan = PlanInput::from_json(SAMPLE).unwrap();
        assert_eq!(plan.resources.len(), 3);
        assert_eq!(plan.resources[1].id(), "module.net.aws_subnet.a");
        assert_eq!(plan.resources[1].count, Some(Value::Int(2)));
        assert_eq!(plan.resources[2].id(), "data.aws_ami.ubuntu");
        assert_eq!(plan.managed_resources().count(), 2);
        assert_eq!(plan.modules[0].path(), "module.net");
        assert_eq!(plan.dependencies[0].to, "aws_vpc.main");
    }

    #[test]
    fn test_child_module_path() {
        assert_eq!(child_module_path("", "a"), "module.a");
        assert_eq!(child_module_path("module.a", "b"), "module.a.module.b");
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let plan = FileSource::new(file.path()).fetch().unwrap();
        assert_eq!(plan.variables[0].name, "env");
    }

    struct Flaky {
        failures: Cell<usize>,
        transient: bool,
        calls: Cell<usize>,
    }

    fn flaky(failures: usize, transient: bool) -> Flaky {
        Flaky {
            failures: Cell::new(failures),
            transient,
            calls: Cell::new(0),
        }
    }

    impl PlanSource for Flaky {
        fn describe(&self) -> String {
            "flaky".to_string()
        }

        fn fetch(&self) -> Result<PlanInput> {
            self.calls.set(self.calls.get() + 1);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(ArchGraphError::ExternalTool {
                    tool: "flaky".into(),
                    status: "exit status: 1".into(),
                    output: "connection reset by peer".into(),
                    transient: self.transient,
                });
            }
            Ok(PlanInput::default())
        }
    }

    #[test]
    fn test_retry_once_on_transient_failure() {
        let source = flaky(1, true);
        assert!(fetch_plan(&source, 1).is_ok());
        assert_eq!(source.calls.get(), 2);

        let source = flaky(2, true);
        assert!(fetch_plan(&source, 1).is_err());
    }

    #[test]
    fn test_retries_capped_at_one() {
        let source = flaky(usize::MAX, true);
        assert!(fetch_plan(&source, 5).is_err());
        assert_eq!(source.calls.get(), 2);

        let source = flaky(1, true);
        assert!(fetch_plan(&source, 0).is_err());
        assert_eq!(source.calls.get(), 1);
    }

    #[test]
    fn test_no_retry_on_permanent_failure() {
        let source = flaky(1, false);
        let err = fetch_plan(&source, 1).unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(source.calls.get(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_source_captures_output() {
        let command = vec!["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 3".to_string()];
        let source = CommandSource::from_command_line(&command).unwrap();
        match source.fetch() {
            Err(ArchGraphError::ExternalTool { output, transient, .. }) => {
                assert_eq!(output, "boom");
                assert!(!transient);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(CommandSource::from_command_line(&[]).is_none());
    }
}
