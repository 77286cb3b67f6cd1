mod config;
mod geometry;
mod graph;
mod handler;
mod interfaces;
mod mapf;
mod position;
mod protocol;
mod scenario;
mod solver;

use anyhow::{bail, Result};
use clap::Parser;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Cli, Config};
use geometry::GeometryLayout;
use handler::SwarmOperationHandler;
use interfaces::{
    DroneFleetClient, FleetInterface, InteractionInterface, InteractionServer, LinkState,
};
use protocol::DroneOperation;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::new(&cli)?;
    config.validate()?;

    if let Some(demo) = &config.grid_demo {
        return scenario::run(demo);
    }

    info!("starting up drone endpoint client");
    let fleet = DroneFleetClient::connect(&config.drone_endpoint, config.notify_interval_ms)?;

    info!("waiting for the first state notification");
    loop {
        match fleet.link_state() {
            LinkState::Running => break,
            LinkState::Disconnected => {
                bail!("drone endpoint disconnected before reporting any state")
            }
            LinkState::Connecting => thread::sleep(Duration::from_millis(50)),
        }
    }

    info!("drone endpoint is reporting, starting the interaction endpoint");
    let interaction = InteractionServer::bind(&config.interaction_bind)?;
    interaction.publish_positions(fleet.positions());
    interaction.publish_drone_states(fleet.drone_states());
    interaction.publish_operations(
        fleet
            .drones()
            .into_iter()
            .map(|drone| (drone, DroneOperation::None))
            .collect(),
    );
    interaction.publish_swarm_state(fleet.swarm_state());

    info!("building the flight volume lattice");
    let geometry = GeometryLayout::new(&config.geometry, &fleet.positions())?;

    let mut handler = SwarmOperationHandler::new(
        &fleet,
        &interaction,
        &geometry,
        config.handler_settings(),
    );
    info!("running, the system is operational");

    let mut last_status = Instant::now();
    loop {
        if fleet.link_state() == LinkState::Disconnected {
            warn!("drone endpoint disconnected, exiting gracefully");
            return Ok(());
        }

        handler.tick();

        if last_status.elapsed() >= Duration::from_secs(1) {
            info!(
                "swarm {:?}, {} drones reporting",
                fleet.swarm_state(),
                fleet.positions().len()
            );
            last_status = Instant::now();
        }
        thread::sleep(config.tick);
    }
}
