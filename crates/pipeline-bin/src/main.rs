//! pipelinectl - set up and inspect stream pipeline shared state.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pipeline_config_and_utils::{init_logging_for_service, Config, Paths};

/// Stream pipeline control tool.
#[derive(Parser)]
#[command(name = "pipelinectl")]
#[command(about = "Create and inspect stream buffers, ack tables and IPC endpoints")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (sockets, logs, config). Defaults to ~/.pipeline
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a stream buffer and ack table and hold them until Ctrl-C
    InitBuffer {
        /// Buffer id
        #[arg(long)]
        id: String,
    },
    /// Print the stats of an existing stream buffer
    InspectBuffer {
        /// Buffer id
        #[arg(long)]
        id: String,
    },
    /// Remove stale IPC socket files
    PurgeSockets,
    /// Print the effective configuration
    ShowConfig,
    /// Bind a destination id and print the micro-batches it receives
    Recv {
        /// Destination id
        #[arg(long)]
        id: u64,
        /// Stop after this many micro-batches
        #[arg(short, long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;

    let config = Config::load(&paths)?;
    init_logging_for_service(
        "pipelinectl",
        config.effective_log_level(cli.log_level.as_deref()),
        Some(&paths),
    );

    match cli.command {
        Commands::InitBuffer { id } => commands::init_buffer(&config, &id).await?,
        Commands::InspectBuffer { id } => commands::inspect_buffer(&config, &id)?,
        Commands::PurgeSockets => commands::purge_sockets(&paths)?,
        Commands::ShowConfig => commands::show_config(&config)?,
        Commands::Recv { id, count } => commands::recv(&config, &paths, id, count).await?,
    }

    Ok(())
}
