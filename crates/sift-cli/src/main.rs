//! Sift CLI - background web mining and semantic retrieval.
//!
//! # Usage
//!
//! ```bash
//! # Run a mining job described in TOML
//! sift mine job.toml --workers 8
//!
//! # Build or refresh the semantic index of a tree
//! sift index ./docs
//!
//! # Query it
//! sift search "cache freshness" --top-k 5
//! sift context "how are retries scheduled" --max-tokens 2000
//!
//! # Show the effective configuration
//! sift config
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use sift_cli::{OutputFormat, SiftConfig, commands, output};
use sift_core::LogFormat;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Sift - background web mining and semantic retrieval", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (human, json)
    #[arg(long, global = true, default_value = "human")]
    format: OutputFormatArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormatArg {
    Human,
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Human => OutputFormat::Human,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mining job until it finishes
    Mine {
        /// Job description (TOML)
        job: PathBuf,

        /// Number of workers (overrides configuration)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Directory for extracted results
        #[arg(short, long)]
        results: Option<PathBuf>,
    },

    /// Index a directory for semantic search
    Index {
        /// Directory to index
        path: PathBuf,

        /// Index file (overrides configuration)
        #[arg(short, long)]
        index: Option<PathBuf>,
    },

    /// Search the semantic index
    Search {
        /// Search query
        query: String,

        /// Number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Minimum cosine similarity
        #[arg(short, long)]
        min_similarity: Option<f32>,

        /// Index file (overrides configuration)
        #[arg(short, long)]
        index: Option<PathBuf>,
    },

    /// Assemble the best matching chunks within a token budget
    Context {
        /// Search query
        query: String,

        /// Token budget
        #[arg(short = 't', long, default_value = "4000")]
        max_tokens: usize,

        /// Index file (overrides configuration)
        #[arg(short, long)]
        index: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match SiftConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            output::error(format!("{e:#}"));
            process::exit(2);
        }
    };

    init_logging(cli.verbose, &config);

    if let Err(e) = run(cli, config).await {
        output::error(format!("{e:#}"));
        process::exit(1);
    }
}

async fn run(cli: Cli, config: SiftConfig) -> Result<()> {
    let format: OutputFormat = cli.format.into();

    match cli.command {
        Commands::Mine {
            job,
            workers,
            results,
        } => {
            commands::mine(config, &job, workers, results, format).await?;
        }

        Commands::Index { path, index } => {
            commands::index(config, &path, index, format).await?;
        }

        Commands::Search {
            query,
            top_k,
            min_similarity,
            index,
        } => {
            commands::search(config, &query, top_k, min_similarity, index, format).await?;
        }

        Commands::Context {
            query,
            max_tokens,
            index,
        } => {
            commands::context(config, &query, max_tokens, index, format).await?;
        }

        Commands::Config => {
            commands::show_config(&config, format)?;
        }
    }

    Ok(())
}

/// Initialize logging based on verbosity and the `[general]` section
fn init_logging(verbose: bool, config: &SiftConfig) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose {
        EnvFilter::new(
            "sift=debug,sift_core=debug,sift_mining=debug,sift_semantic=debug,sift_cli=debug,info",
        )
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = &config.general.log_level;
            EnvFilter::new(format!(
                "sift_core={level},sift_mining={level},sift_semantic={level},sift_cli={level},warn"
            ))
        })
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.general.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
