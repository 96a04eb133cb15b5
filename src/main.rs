use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kindex::config::{Config, LoggingConfig};

mod cli;

use cli::OutputFormat;

#[derive(Parser)]
#[command(name = "kindex")]
#[command(author = "Intent Project Team")]
#[command(version)]
#[command(about = "Background declaration index for Kotlin projects", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory
    #[arg(short, long, global = true, default_value = ".")]
    project: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the project, optionally watching for changes
    Index {
        /// Keep watching content roots after the initial pass
        #[arg(short, long)]
        watch: bool,

        /// Drop the stored index and cached module graph first
        #[arg(short, long)]
        rebuild: bool,
    },

    /// Complete a declaration name prefix
    Complete {
        prefix: String,

        /// Only members and extensions of this type (declarations without an owner always match)
        #[arg(long)]
        receiver: Option<String>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List the files of a package
    Package {
        fq_name: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List the immediate subpackages of a package prefix
    Subpackages {
        #[arg(default_value = "")]
        prefix: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show the resolved module graph
    Modules {
        /// Resolve again even if the cached graph is current
        #[arg(long)]
        refresh: bool,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show index statistics
    Stats {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_logging(debug: bool, verbose: bool, logging: &LoggingConfig) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        logging.level.as_str()
    };

    // RUST_LOG wins over flags and config
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let root = cli::project_root(&cli.project)?;
    let config = Config::from_project_dir(&root);
    init_logging(cli.debug, cli.verbose, &config.logging);

    info!("kindex v{} starting for {}", env!("CARGO_PKG_VERSION"), root.display());

    match cli.command {
        Commands::Index { watch, rebuild } => {
            cli::index::index_project(root, config, watch, rebuild).await?;
        }

        Commands::Complete {
            prefix,
            receiver,
            limit,
            format,
        } => {
            cli::query::complete(&root, &config, &prefix, receiver.as_deref(), limit, format)?;
        }

        Commands::Package { fq_name, format } => {
            cli::query::package_files(&root, &config, &fq_name, format)?;
        }

        Commands::Subpackages { prefix, format } => {
            cli::query::subpackages(&root, &config, &prefix, format)?;
        }

        Commands::Modules { refresh, format } => {
            cli::modules::show_modules(&root, &config, refresh, format)?;
        }

        Commands::Stats { format } => {
            cli::stats::show_stats(&root, &config, format)?;
        }
    }

    Ok(())
}
