//! archgraph CLI - infrastructure graphs to architecture diagrams.
//!
//! Usage:
//!   archgraph build -i plan.json              # Output document on stdout
//!   archgraph build -i plan.json -a notes.yml -o out.json --snapshot snap.json
//!   archgraph build --from-command --render   # Acquire, build, render
//!   archgraph replay -s snap.json             # Resume from the validator
//!   archgraph validate -s snap.json           # Structural check only
//!   archgraph stats -i plan.json              # Graph statistics

use anyhow::{bail, Context, Result};
use std::path::Path;

use archgraph::cli::{init_tracing, Cli, Commands};
use archgraph::graph::OutputDocument;
use archgraph::plan::{fetch_plan, CommandSource, FileSource, PlanInput, PlanSource};
use archgraph::render::{render_graph, CommandRenderer};
use archgraph::{Annotations, ArchConfig, Pipeline, Snapshot};
use clap::Parser;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = ArchConfig::load(&cli.config);

    match cli.command {
        Commands::Build {
            input,
            from_command,
            annotations,
            output,
            snapshot,
            render,
        } => {
            let plan = acquire(&config, input.as_deref(), from_command)?;
            let mut pipeline = Pipeline::from_config(&config)
                .context("failed to load provider tables")?
                .capture_snapshot(snapshot.is_some());
            if let Some(path) = &annotations {
                pipeline = pipeline.with_annotations(load_annotations(path)?);
            }

            let result = pipeline.run(&plan)?;
            print_diagnostics(&result.diagnostics);
            if let (Some(path), Some(snap)) = (&snapshot, &result.snapshot) {
                snap.save(path)
                    .with_context(|| format!("failed to write snapshot {}", path.display()))?;
            }
            emit(&OutputDocument::from_graph(&result.graph), output.as_deref())?;

            if render {
                let renderer = CommandRenderer::from_command_line(&config.render.command)
                    .context("no renderer configured ([render] command)")?;
                let rendered = render_graph(&result.graph, &renderer)?;
                if !rendered.is_empty() {
                    eprintln!("{}", rendered.trim_end());
                }
            }
        }

        Commands::Replay {
            snapshot,
            annotations,
            output,
        } => {
            let snap = Snapshot::load(&snapshot)
                .with_context(|| format!("failed to read snapshot {}", snapshot.display()))?;
            let mut pipeline = Pipeline::from_config(&config)?;
            if let Some(path) = &annotations {
                pipeline = pipeline.with_annotations(load_annotations(path)?);
            }
            let result = pipeline.replay(snap)?;
            print_diagnostics(&result.diagnostics);
            emit(&OutputDocument::from_graph(&result.graph), output.as_deref())?;
        }

        Commands::Validate { snapshot } => {
            let snap = Snapshot::load(&snapshot)
                .with_context(|| format!("failed to read snapshot {}", snapshot.display()))?;
            let graph = Pipeline::from_config(&config)
                .context("failed to load provider tables")?
                .check_snapshot(snap)?;
            println!("✓ {} is valid", snapshot.display());
            println!("  Nodes: {}", graph.len());
            println!("  Edges: {}", graph.edge_count());
        }

        Commands::Stats { input } => {
            let plan = PlanInput::load(&input)
                .with_context(|| format!("failed to read plan {}", input.display()))?;
            let result = Pipeline::from_config(&config)?.run(&plan)?;
            let stats = result.graph.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if !result.diagnostics.is_empty() {
                println!("Diagnostics: {}", result.diagnostics.len());
            }
        }
    }

    Ok(())
}

fn acquire(config: &ArchConfig, input: Option<&Path>, from_command: bool) -> Result<PlanInput> {
    let source: Box<dyn PlanSource> = match (input, from_command) {
        (Some(path), false) => Box::new(FileSource::new(path)),
        (None, true) => match CommandSource::from_command_line(&config.acquisition.command) {
            Some(source) => Box::new(source),
            None => bail!("no acquisition command configured ([acquisition] command)"),
        },
        _ => bail!("pass either --input or --from-command"),
    };
    let plan = fetch_plan(source.as_ref(), config.acquisition.retries)
        .with_context(|| format!("failed to acquire plan from {}", source.describe()))?;
    Ok(plan)
}

fn load_annotations(path: &Path) -> Result<Annotations> {
    Annotations::load(path).with_context(|| format!("failed to read annotations {}", path.display()))
}

fn emit(document: &OutputDocument, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => document
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{}", document.to_json()?),
    }
    Ok(())
}

fn print_diagnostics(diagnostics: &[archgraph::Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    eprintln!("{} diagnostic(s):", diagnostics.len());
    for diagnostic in diagnostics {
        eprintln!("  {}", diagnostic);
    }
}
