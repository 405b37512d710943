//! Error types for archgraph.
//!
//! Only structural invariant violations and unrecoverable external-tool
//! failures are errors. Degraded-but-usable conditions (unresolved
//! expressions, reference cycles, unknown resource types) are reported as
//! [`crate::graph::Diagnostic`] values instead.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArchGraphError>;

#[derive(Error, Debug)]
pub enum ArchGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Two group nodes that are not ancestor/descendant of each other
    /// contain the same child.
    #[error("[{phase}] group nodes '{first}' and '{second}' share child '{child}'")]
    SharedChild {
        phase: String,
        first: String,
        second: String,
        child: String,
    },

    #[error("[{phase}] '{parent}' references unknown node '{child}'")]
    DanglingReference {
        phase: String,
        parent: String,
        child: String,
    },

    #[error("[{phase}] node '{node}' has no metadata entry (or metadata without a graph entry)")]
    MetadataMismatch { phase: String, node: String },

    #[error("Snapshot format {found} is incompatible with pipeline major version {expected}")]
    SnapshotVersion { found: String, expected: u32 },

    #[error("Handler for '{pattern}' is invalid: {reason}")]
    InvalidHandler { pattern: String, reason: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown callback '{0}'")]
    UnknownCallback(String),

    #[error("Unknown pipeline stage '{0}'")]
    UnknownStage(String),

    #[error("{tool} failed ({status}): {output}")]
    ExternalTool {
        tool: String,
        status: String,
        output: String,
        transient: bool,
    },

    #[error("Run cancelled during phase '{phase}'")]
    Cancelled { phase: String },
}

impl ArchGraphError {
    pub fn invalid_handler<P: Into<String>, E: std::fmt::Display>(pattern: P, reason: E) -> Self {
        Self::InvalidHandler {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_pattern<P: Into<String>, E: std::fmt::Display>(pattern: P, reason: E) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a retry may succeed. Only external tool failures that look
    /// like network or timeout trouble qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            ArchGraphError::ExternalTool { transient, .. } => *transient,
            ArchGraphError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_child_message_names_both_groups() {
        let err = ArchGraphError::SharedChild {
            phase: "validate".to_string(),
            first: "aws_subnet.a".to_string(),
            second: "aws_subnet.b".to_string(),
            child: "aws_instance.web".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("aws_subnet.a"));
        assert!(msg.contains("aws_subnet.b"));
        assert!(msg.contains("aws_instance.web"));
        assert!(msg.contains("validate"));
    }

    #[test]
    fn test_transient_classification() {
        let err = ArchGraphError::ExternalTool {
            tool: "plan".to_string(),
            status: "exit 1".to_string(),
            output: "connection reset".to_string(),
            transient: true,
        };
        assert!(err.is_transient());

        let io = ArchGraphError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        assert!(!io.is_transient());
        let io = ArchGraphError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "x"));
        assert!(io.is_transient());
    }
}
