use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crawl_common::config::AppConfig;

mod master_cmd;
mod worker_cmd;

#[derive(Parser)]
#[command(name = "crawler", about = "distributed crawl platform")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a crawl worker.
    Worker,
    /// Run a master coordinator.
    Master(MasterArgs),
    /// Print version information.
    Version,
}

#[derive(Args)]
pub struct MasterArgs {
    /// Master sequence number, part of the campaign identity.
    #[arg(long, default_value = "1")]
    pub id: String,

    /// HTTP listen address; overrides the configuration file.
    #[arg(long)]
    pub http: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = AppConfig::load(&cli.config)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", cli.config.display()))?;
    init_tracing(&config.log_level)?;
    tracing::info!(config = %cli.config.display(), "configuration loaded");

    match cli.command {
        Command::Worker => worker_cmd::run(config).await,
        Command::Master(args) => master_cmd::run(config, args).await,
        Command::Version => unreachable!("handled above"),
    }
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(log_level.parse()?)
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
