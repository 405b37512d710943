//! Hand-off to a renderer.
//!
//! The finished graph leaves the crate as an [`OutputDocument`]. A
//! [`CommandRenderer`] pipes it as JSON into an external program; a render
//! failure is fatal and never retried since the input is deterministic.

use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use tracing::{info, info_span};

use crate::error::{ArchGraphError, Result};
use crate::graph::{GraphModel, OutputDocument};

pub trait Renderer {
    fn name(&self) -> String;

    /// Render a document, returning whatever the renderer printed.
    fn render(&self, document: &OutputDocument) -> Result<String>;
}

/// Pretty JSON, for tooling other than a diagram renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn name(&self) -> String {
        "json".to_string()
    }

    fn render(&self, document: &OutputDocument) -> Result<String> {
        document.to_json()
    }
}

/// External renderer reading the document on stdin.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    /// Program first; `None` for an empty command line.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Renderer for CommandRenderer {
    fn name(&self) -> String {
        self.program.clone()
    }

    fn render(&self, document: &OutputDocument) -> Result<String> {
        let payload = document.to_json()?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // Feed stdin from a thread so a renderer that streams output
        // cannot fill its stdout pipe while we are still writing.
        let stdin = child.stdin.take();
        let writer = thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(payload.as_bytes())?;
            }
            Ok(())
        });
        let output = child.wait_with_output()?;
        let written = writer.join().map_err(|_| ArchGraphError::ExternalTool {
            tool: self.program.clone(),
            status: "stdin writer panicked".to_string(),
            output: String::new(),
            transient: false,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ArchGraphError::ExternalTool {
                tool: self.program.clone(),
                status: output.status.to_string(),
                output: format!("{}{}", stderr, stdout).trim().to_string(),
                transient: false,
            });
        }
        written?;
        Ok(stdout)
    }
}

/// Render a finished graph.
pub fn render_graph(graph: &GraphModel, renderer: &dyn Renderer) -> Result<String> {
    let _span = info_span!("render", renderer = %renderer.name()).entered();
    let document = OutputDocument::from_graph(graph);
    let rendered = renderer.render(&document)?;
    info!(nodes = document.graph.len(), bytes = rendered.len(), "graph rendered");
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> GraphModel {
        let mut graph = GraphModel::new("aws");
        graph.add_edge("aws_vpc.main", "aws_subnet.a");
        graph
    }

    #[test]
    fn test_json_renderer_matches_document() {
        let rendered = render_graph(&graph(), &JsonRenderer).unwrap();
        assert_eq!(rendered, OutputDocument::from_graph(&graph()).to_json().unwrap());
    }

    #[test]
    fn test_empty_command_line() {
        assert!(CommandRenderer::from_command_line(&[]).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_renderer_receives_document() {
        let renderer = CommandRenderer::from_command_line(&["cat".to_string()]).unwrap();
        let rendered = render_graph(&graph(), &renderer).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["graph"]["aws_vpc.main"][0], "aws_subnet.a");
    }

    #[cfg(unix)]
    #[test]
    fn test_unread_stdin_surfaces_writer_error() {
        let mut graph = GraphModel::new("aws");
        for n in 0..5000 {
            graph.add_edge("aws_vpc.main", &format!("aws_subnet.s{}", n));
        }
        let command = ["sh", "-c", "exit 0"].map(String::from).to_vec();
        let renderer = CommandRenderer::from_command_line(&command).unwrap();
        match render_graph(&graph, &renderer).unwrap_err() {
            ArchGraphError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failure_is_not_transient() {
        let command = ["sh", "-c", "cat >/dev/null; echo boom >&2; exit 3"]
            .map(String::from)
            .to_vec();
        let renderer = CommandRenderer::from_command_line(&command).unwrap();
        let err = render_graph(&graph(), &renderer).unwrap_err();
        assert!(!err.is_transient());
        match err {
            ArchGraphError::ExternalTool { output, .. } => assert_eq!(output, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
