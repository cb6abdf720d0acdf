use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use xmlgraph::config::load_settings;
use xmlgraph::errors::{Result, XmlGraphError};
use xmlgraph::index::{build_index, uniqueness_violations, validate_xml};
use xmlgraph::mcp::{AppState, McpServer, ToolContext};
use xmlgraph::store::{IndexCache, RepoStore, Snapshot};
use xmlgraph::types::EntitySummary;

/// Read-only MCP server for XML entity registries.
#[derive(Parser)]
#[command(name = "xmlgraph", version, about = "Read-only MCP server for XML entity registries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve every repository under a root directory over HTTP and SSE
    Serve {
        /// Directory laid out as <root>/<owner>/<repo>/mcp.yaml
        #[arg(short, long)]
        root: PathBuf,
        /// Listen address (overrides xmlgraph.toml)
        #[arg(short, long)]
        bind: Option<String>,
        /// Maximum concurrent SSE sessions
        #[arg(long)]
        max_sessions: Option<usize>,
        /// Seconds between SSE keep-alive comments
        #[arg(long)]
        keepalive_secs: Option<u64>,
    },
    /// Serve a single repository over stdin/stdout
    Stdio {
        /// Repository directory containing mcp.yaml
        #[arg(short, long)]
        repo: PathBuf,
    },
    /// Index an XML file and print statistics
    Index {
        /// XML file
        file: PathBuf,
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
    /// Search entities in an XML file
    Search {
        /// XML file
        file: PathBuf,
        /// Search query
        query: String,
        /// Maximum results
        #[arg(short, long, default_value = "25")]
        limit: usize,
    },
    /// Check an XML file for well-formedness and uniqueness violations
    Validate {
        /// XML file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Logs go to stderr so stdout stays usable as a JSON-RPC channel.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("XMLGRAPH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve {
            root,
            bind,
            max_sessions,
            keepalive_secs,
        } => {
            let mut settings = load_settings(&root)?;
            if let Some(bind) = bind {
                settings.bind = bind;
            }
            if let Some(max) = max_sessions {
                settings.max_sessions = max;
            }
            if let Some(secs) = keepalive_secs {
                settings.keepalive_secs = secs;
            }
            let state = AppState::new(RepoStore::new(root), settings);
            xmlgraph::mcp::http::serve(state).await?;
        }
        Commands::Stdio { repo } => {
            let name = repo
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "local".to_string());
            let snapshot = Arc::new(Snapshot::load_dir(&repo, &name)?);
            let index = IndexCache::new(1).primary_index(&snapshot)?;
            let ctx = ToolContext::new(snapshot, index);
            McpServer::new().run_stdio(&ctx).await?;
        }
        Commands::Index { file, json } => {
            let index = index_file(&file)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "source_file": index.source_file,
                        "stats": index.stats,
                        "duplicates": index.duplicates.len(),
                    }))?
                );
            } else {
                println!("Indexed {}", index.source_file);
                println!("  Entities:   {}", index.stats.total_entities);
                println!("  Duplicates: {}", index.duplicates.len());
                if !index.stats.type_counts.is_empty() {
                    println!("\n  Entities by type:");
                    for (entity_type, count) in &index.stats.type_counts {
                        println!("    {}: {}", entity_type, count);
                    }
                }
            }
        }
        Commands::Search { file, query, limit } => {
            let index = index_file(&file)?;
            let results = index.search_entities(&query, limit);
            if results.is_empty() {
                println!("No results found for '{}'", query);
            } else {
                for entity in results {
                    let summary = EntitySummary::from(entity);
                    if summary.parent_id.is_empty() {
                        println!("{} - {}", summary.id, summary.name);
                    } else {
                        println!("{} - {} (in {})", summary.id, summary.name, summary.parent_id);
                    }
                }
            }
        }
        Commands::Validate { file } => {
            let bytes = read_file(&file)?;
            let report = validate_xml(&bytes, &file.display().to_string());
            let mut problems = report.error.iter().cloned().collect::<Vec<_>>();
            if report.valid {
                let index = build_index(&bytes, &report.path, "")?;
                problems.extend(uniqueness_violations(&index));
            }
            if problems.is_empty() {
                println!(
                    "{}: valid ({} entities)",
                    report.path, report.stats.total_entities
                );
            } else {
                println!("{}: invalid", report.path);
                for problem in &problems {
                    println!("  - {}", problem);
                }
                process::exit(2);
            }
        }
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| XmlGraphError::Source {
        message: format!("failed to read file: {}", e),
        path: path.display().to_string(),
    })
}

fn index_file(path: &Path) -> Result<xmlgraph::index::EntityIndex> {
    let bytes = read_file(path)?;
    build_index(&bytes, &path.display().to_string(), "")
}
