use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;

use cli::cache::CacheCommand;
use cli::config::ConfigCommand;
use cli::detect_config::DetectConfigCommand;
use cli::exec::ExecCommand;
use cli::fetch_crashes::FetchCrashesCommand;
use cli::provision::ProvisionCommand;
use cli::reconnect::ReconnectCommand;
use cli::restart::RestartCommand;

#[derive(Parser)]
#[command(name = "dut-provision")]
#[command(about = "Provision a test device with a new OS image, firmware and DLCs over SSH", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Provision(ProvisionCommand),
    Exec(ExecCommand),
    Restart(RestartCommand),
    Reconnect(ReconnectCommand),
    Cache(CacheCommand),
    FetchCrashes(FetchCrashesCommand),
    DetectConfig(DetectConfigCommand),
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with INFO level by default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Provision(cmd) => cmd.execute().await,
        Commands::Exec(cmd) => cmd.execute().await,
        Commands::Restart(cmd) => cmd.execute().await,
        Commands::Reconnect(cmd) => cmd.execute().await,
        Commands::Cache(cmd) => cmd.execute().await,
        Commands::FetchCrashes(cmd) => cmd.execute().await,
        Commands::DetectConfig(cmd) => cmd.execute().await,
        Commands::Config(cmd) => cmd.execute(),
    }
}
