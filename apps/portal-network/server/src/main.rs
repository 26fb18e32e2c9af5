use anyhow::{bail, Context, Result};
use clap::Parser;
use portal_network_core::persist::REGISTRY_FILE_NAME;
use portal_network_server::config::{Cli, Command, ServerConfig};
use portal_network_server::sim::{Simulation, WORLD_STATE_FILE_NAME};
use portal_network_server::telemetry::{self, logging};
use portal_network_server::RunningServer;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Command::Serve);
    let config = ServerConfig::try_from(cli)?;
    logging::init(&config.log).context("failed to initialise logging")?;

    match command {
        Command::Serve => serve(config).await,
        Command::SeedDemo { force } => seed_demo(&config, force),
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        world_dir = %config.world_dir.display(),
        tick_ms = config.tick.as_millis() as u64,
        "starting portal-network server"
    );
    telemetry::install_metrics(config.metrics_addr)?;

    let sim = Simulation::open(&config.world_dir, config.coordinator);
    let server = RunningServer::spawn(&config, sim).await?;
    shutdown_signal().await;
    info!("shutdown signal received; saving world");
    let sim = server.shutdown().await?;
    info!(tick = sim.current_tick(), "server stopped");
    Ok(())
}

fn seed_demo(config: &ServerConfig, force: bool) -> Result<()> {
    let existing = [REGISTRY_FILE_NAME, WORLD_STATE_FILE_NAME]
        .into_iter()
        .map(|name| config.world_dir.join(name))
        .find(|path| path.exists());
    if let (Some(path), false) = (existing, force) {
        bail!(
            "{} already exists; pass --force to replace the world",
            path.display()
        );
    }

    let mut sim = Simulation::empty(&config.world_dir, config.coordinator);
    let (home, hub) = sim.seed_demo().context("failed to build demo world")?;
    sim.save().context("failed to save demo world")?;
    info!(
        world_dir = %config.world_dir.display(),
        home = %home,
        hub = %hub,
        "demo world written"
    );
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
