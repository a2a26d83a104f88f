mod resolve_cmd;
mod serve_cmd;
mod status_cmd;
mod worker_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gantry", about = "Per-commit CI control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the manager daemon (scheduler + worker protocol listener)
    Serve {
        /// Listen address override
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run a worker daemon against a manager
    Worker {
        /// Manager address (host:port)
        #[arg(long)]
        manager: Option<String>,
        /// Machine id to report; generated if omitted
        #[arg(long)]
        machine_id: Option<String>,
    },
    /// Resolve a commit's test definitions and print them as JSON
    Resolve {
        /// Repo name (must appear in the config's repo list)
        repo: String,
        /// 40-hex commit hash
        commit: String,
    },
    /// Show config and data-dir status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { force } => init_config(force),
        Commands::Serve { listen } => serve_cmd::run(listen).await,
        Commands::Worker {
            manager,
            machine_id,
        } => worker_cmd::run(manager, machine_id).await,
        Commands::Resolve { repo, commit } => resolve_cmd::run(&repo, &commit).await,
        Commands::Status => status_cmd::run(),
    }
}

fn init_config(force: bool) -> Result<()> {
    use gantry_core::config;

    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    config::save_config(&config::ConfigFile::default())?;
    println!("wrote {}", path.display());
    println!("add [[repos]] entries (name + url) to start tracking repositories");
    Ok(())
}
