// SPDX-License-Identifier: MIT OR Apache-2.0
//! `workflow-graph` - inspect, validate and rewrite workflow documents.
//!
//! Documents of either format version are accepted; anything written is
//! in the current format.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workflow_graph::serialization::to_json;
use workflow_graph::{Document, EngineConfig, GraphMutationOperation, GraphMutationService, GraphScope, NodeRegistry};

#[derive(Parser)]
#[command(name = "workflow-graph")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect, validate and rewrite workflow graph documents")]
struct Cli {
    /// RON catalog of node kinds
    #[arg(long, global = true, env = "WORKFLOW_GRAPH_CATALOG")]
    catalog: Option<PathBuf>,

    /// RON engine configuration
    #[arg(long, global = true, env = "WORKFLOW_GRAPH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a summary of a document
    Inspect {
        /// Document to read
        file: PathBuf,
    },
    /// Check a document and report the first broken invariant
    Validate {
        /// Document to read
        file: PathBuf,
    },
    /// Rewrite a document in the current format
    Normalize {
        /// Document to read
        file: PathBuf,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Apply a JSON array of mutation operations to a document
    Apply {
        /// Document to read
        file: PathBuf,
        /// JSON file holding the operations
        operations: PathBuf,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("workflow_graph=info,workflow_graph_tool=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(Cli::parse()) {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let registry = load_registry(cli.catalog.as_deref())?;
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("reading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let mut service = GraphMutationService::with_config(registry, config);

    match cli.command {
        Command::Inspect { file } => {
            load_document(&mut service, &file)?;
            inspect(&service);
        }
        Command::Validate { file } => {
            load_document(&mut service, &file)?;
            service.graph().validate()?;
            println!("{}: ok", file.display());
        }
        Command::Normalize { file, output } => {
            load_document(&mut service, &file)?;
            write_output(&service, output.as_deref())?;
        }
        Command::Apply {
            file,
            operations,
            output,
        } => {
            load_document(&mut service, &file)?;
            let source = std::fs::read_to_string(&operations)
                .with_context(|| format!("reading {}", operations.display()))?;
            let ops: Vec<GraphMutationOperation> = serde_json::from_str(&source)
                .with_context(|| format!("parsing operations in {}", operations.display()))?;
            for (index, op) in ops.into_iter().enumerate() {
                let name = op.name();
                let out = service
                    .apply_operation(op)
                    .with_context(|| format!("operation {index} ({name})"))?;
                tracing::debug!(index, operation = name, ?out, "applied");
            }
            write_output(&service, output.as_deref())?;
        }
    }
    Ok(())
}

fn load_registry(path: Option<&Path>) -> Result<NodeRegistry> {
    let Some(path) = path else {
        bail!("a node catalog is required (--catalog or WORKFLOW_GRAPH_CATALOG)");
    };
    let source = std::fs::read_to_string(path).with_context(|| format!("reading catalog {}", path.display()))?;
    let registry = NodeRegistry::from_ron(&source).with_context(|| format!("parsing catalog {}", path.display()))?;
    tracing::debug!(kinds = registry.kinds().count(), "loaded node catalog");
    Ok(registry)
}

fn load_document(service: &mut GraphMutationService, path: &Path) -> Result<()> {
    let source = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let document = Document::from_json(&source).with_context(|| format!("parsing {}", path.display()))?;
    if document.is_legacy() {
        tracing::info!("{} is a legacy document; it will be upgraded", path.display());
    }
    service.load(&document)?;
    Ok(())
}

fn write_output(service: &GraphMutationService, output: Option<&Path>) -> Result<()> {
    let json = to_json(service.graph())?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!("wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn inspect(service: &GraphMutationService) {
    let graph = service.graph();
    let root = graph.root();
    println!("id:        {}", graph.id());
    println!("revision:  {}", graph.revision());
    println!(
        "root:      {} nodes, {} links, {} groups, {} reroutes",
        root.node_count(),
        root.link_count(),
        root.groups().count(),
        root.reroutes().count()
    );

    let used = graph.used_subgraph_ids();
    for id in &used {
        let Some(subgraph) = graph.subgraph(*id) else {
            continue;
        };
        println!(
            "subgraph:  {} \"{}\" - {} in, {} out, {} nodes, {} instances",
            id,
            subgraph.name,
            subgraph.inputs().len(),
            subgraph.outputs().len(),
            subgraph.body().node_count(),
            graph.subgraph_instances(*id).len()
        );
    }

    println!("node types:");
    for (node_type, count) in graph.aggregate_node_types() {
        println!("  {count:>4}  {node_type}");
    }

    let bypassed = graph
        .scopes()
        .into_iter()
        .filter_map(|scope| graph.body(scope).ok().map(|body| (scope, body)))
        .flat_map(|(scope, body)| body.nodes().filter(|n| n.is_bypassed()).map(move |n| (scope, n.id())))
        .collect::<Vec<_>>();
    if !bypassed.is_empty() {
        println!("bypassed:");
        for (scope, id) in bypassed {
            match scope {
                GraphScope::Root => println!("  node {id}"),
                GraphScope::Subgraph(sg) => println!("  node {id} in {sg}"),
            }
        }
    }
}
