//! Loyalty Control - CLI client for the loyalty engine

use anyhow::Result;
use clap::Parser;
use loyaltyctl::cli::Cli;
use loyaltyctl::{commands, output};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e), json);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = commands::load_config(&cli)?;
    let engine = commands::open_engine(config).await?;
    let reply = commands::execute(&engine, cli.command).await?;
    output::print(&reply, cli.json)
}
