//! Host process for the worldhost world driver.
//!
//! Runs several worlds side by side, each on its own driver thread over an
//! in-memory echo simulation, and feeds them synthetic client traffic. A
//! fault in one world is logged and repaired without disturbing the others.
//! Only configuration errors and a failed traffic thread end the process.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (`WORLDHOST_CONFIG`, else `worldhost-config.yaml`)
//! 2. Initialize structured logging (tracing)
//! 3. Create and start one driver per configured world
//! 4. Attach the configured number of clients to each world
//! 5. Start the synthetic traffic thread
//! 6. Supervise the worlds until the run time elapses
//! 7. Stop every world, detach its clients, and log the totals

mod error;
mod supervisor;
#[cfg(test)]
mod test_support;
mod traffic;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use worldhost_core::config::{HostConfig, HostSettings};
use worldhost_core::driver::{DriverSettings, WorldDriver};
use worldhost_core::simulation::EchoSimulation;
use worldhost_types::{ClientId, Position, SpawnTarget, WorldId};

use crate::error::HostError;
use crate::traffic::Traffic;

/// Environment variable naming the configuration file.
const CONFIG_ENV_VAR: &str = "WORLDHOST_CONFIG";

/// Configuration file looked up in the working directory.
const DEFAULT_CONFIG_PATH: &str = "worldhost-config.yaml";

/// Unique entity every echo world offers as a spawn point.
const BEACON: &str = "spawn_beacon";

/// Time between traffic rounds.
const TRAFFIC_ROUND: Duration = Duration::from_millis(10);

/// Application entry point for the world host.
///
/// # Errors
///
/// Returns an error if configuration is invalid or a world cannot be
/// started.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging. RUST_LOG wins over the config.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .with_thread_names(true)
        .init();

    info!("worldhost-server starting");
    info!(
        tick_rate_hz = config.driver.tick_rate_hz,
        fidelity = config.driver.fidelity,
        storage_interval_ms = config.driver.storage_interval_ms,
        worlds = config.host.worlds,
        clients_per_world = config.host.clients_per_world,
        run_seconds = config.host.run_seconds,
        "Configuration loaded"
    );

    // 3. Create and start the worlds.
    let settings = DriverSettings::from_config(&config.driver)?;
    let worlds = start_worlds(config.host.worlds, settings);

    // 4. Attach clients.
    for world in &worlds {
        let attached = attach_clients(world, config.host.clients_per_world);
        info!(world_id = %world.world_id(), attached, "Clients attached");
    }

    // 5. Start synthetic traffic.
    let traffic = Traffic::start(worlds.clone(), TRAFFIC_ROUND)?;
    info!("Synthetic traffic started");

    // 6. Supervise until the run time elapses.
    let restarts = supervise_until_done(&worlds, &config.host);

    // 7. Shut down.
    let totals = traffic.finish()?;
    let mut leftover = 0_usize;
    for world in &worlds {
        world.stop();
        for client in world.clients() {
            leftover = leftover.saturating_add(world.remove_client(client).len());
        }
        let stats = world.stats();
        let chunks = world.read_chunks().map(|chunks| chunks.len()).unwrap_or_default();
        info!(
            world_id = %world.world_id(),
            state = %world.state(),
            ticks = stats.ticks,
            persists = stats.persists,
            chunks,
            "World shut down"
        );
    }

    info!(
        sent = totals.sent,
        received = totals.received,
        dropped = totals.dropped,
        returned_on_detach = leftover,
        restarts,
        "worldhost-server shutdown complete"
    );

    Ok(())
}

/// Load configuration from `WORLDHOST_CONFIG` or `worldhost-config.yaml`.
///
/// Falls back to defaults when neither names an existing file. Environment
/// overrides apply either way.
fn load_config() -> Result<HostConfig, HostError> {
    let path = std::env::var_os(CONFIG_ENV_VAR)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    if path.exists() {
        return Ok(HostConfig::from_file(&path)?);
    }
    let mut config = HostConfig::default();
    config.driver.apply_env_overrides();
    config.driver.validate()?;
    Ok(config)
}

/// Create and start `count` worlds. A world that fails to start is kept
/// and left for the supervisor to start later.
fn start_worlds(count: u32, settings: DriverSettings) -> Vec<Arc<WorldDriver>> {
    let mut worlds = Vec::new();
    for _ in 0..count {
        let simulation = EchoSimulation::new().with_unique_entity(BEACON);
        let world = Arc::new(WorldDriver::new(WorldId::new(), simulation, settings));
        if let Err(e) = world.start() {
            error!(world_id = %world.world_id(), error = %e, "World failed to start");
        }
        worlds.push(world);
    }
    info!(worlds = worlds.len(), "Worlds started");
    worlds
}

/// Attach up to `count` clients, cycling through the kinds of spawn target.
///
/// Stops at the first failure, which leaves the world faulted for the
/// supervisor. Returns the number of clients attached.
fn attach_clients(world: &WorldDriver, count: u16) -> usize {
    let mut attached = 0_usize;
    for id in 1..=count {
        let client = ClientId(id);
        let target = match id % 4 {
            0 => SpawnTarget::WorldDefault,
            1 => SpawnTarget::UniqueEntity(BEACON.to_owned()),
            2 => SpawnTarget::X(f32::from(id) * 8.0),
            _ => SpawnTarget::Position(Position::new(f32::from(id), 64.0)),
        };
        let outcome = world.spawn_target_valid(&target).and_then(|valid| {
            if valid {
                world.add_client(client, &target, false)
            } else {
                Ok(false)
            }
        });
        match outcome {
            Ok(true) => attached = attached.saturating_add(1),
            Ok(false) => {
                warn!(world_id = %world.world_id(), client_id = %client, "Client rejected");
            }
            Err(e) => {
                error!(world_id = %world.world_id(), client_id = %client, error = %e, "Client attach failed");
                break;
            }
        }
    }
    attached
}

/// Run supervision passes until `host.run_seconds` elapse (forever when 0).
/// Returns the number of restarts performed.
fn supervise_until_done(worlds: &[Arc<WorldDriver>], host: &HostSettings) -> u32 {
    let started = Instant::now();
    let run_for = (host.run_seconds > 0).then(|| Duration::from_secs(host.run_seconds));
    let interval = Duration::from_millis(host.supervise_interval_ms.max(1));
    let mut restarts = 0_u32;

    while run_for.is_none_or(|limit| started.elapsed() < limit) {
        thread::sleep(interval);
        for world in worlds {
            if supervisor::supervise(world).restarted {
                restarts = restarts.saturating_add(1);
            }
        }
    }
    restarts
}
