use anyhow::Context;
use clap::Parser;
use gindex_lookup::config::LookupConfig;
use gindex_lookup::core::QueryNode;
use gindex_lookup::query::RangeStream;
use gindex_lookup::storage::MemoryIndex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// gindex-lookup - plan a predicate against a global index and print the matching partitions
#[derive(Parser, Debug)]
#[command(name = "gindex-lookup")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration (defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Index fixture in JSON lines
    #[arg(long)]
    index: PathBuf,

    /// Predicate tree as JSON
    #[arg(long)]
    query: String,

    /// Print the plan report after the results
    #[arg(long)]
    stats: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => LookupConfig::load(path)?,
        None => LookupConfig::default(),
    };
    let index = MemoryIndex::load_json_lines(&cli.index)?;
    info!("Loaded {} index entries from {}", index.len(), cli.index.display());

    let query: QueryNode = serde_json::from_str(&cli.query).context("failed to parse --query as a predicate tree")?;
    let intersector = config.uid_intersector.build();
    let mut planner = RangeStream::new(config, Arc::new(index), intersector)?;

    let context = planner.stream_plan(&query)?;
    info!("Planned {} with a context of {}", query, context);
    let stats = planner.stats().clone();

    let results = planner.into_results()?;
    info!("Results stream has a context of {}", results.context());

    let mut emitted = 0usize;
    for (key, hits) in results {
        let uids: Vec<&str> = hits.uids().iter().map(|m| m.uid()).collect();
        let node = hits.node().map(|n| n.to_string()).unwrap_or_default();
        println!("{}\t{}\t[{}]\t{}", key, hits.count(), uids.join(","), node);
        emitted += 1;
    }
    info!("Emitted {} partitions", emitted);

    if cli.stats {
        println!("{}", stats);
    }
    Ok(())
}
