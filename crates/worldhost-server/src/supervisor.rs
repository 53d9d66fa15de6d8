//! Periodic supervision of running worlds.
//!
//! A world that faults never takes the host down. Each pass logs every
//! world's stats, detaches clients the simulation dropped on its own, and
//! restarts worlds that are not running. Failures are logged and retried on
//! the next pass.

use tracing::{error, info, warn};
use worldhost_core::driver::WorldDriver;
use worldhost_core::status::DriverState;

/// What one supervision pass did to one world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Supervision {
    /// Errored clients that were detached.
    pub detached: usize,
    /// Whether the world was restarted.
    pub restarted: bool,
}

/// Inspect one world and repair what can be repaired.
pub fn supervise(world: &WorldDriver) -> Supervision {
    let stats = world.stats();
    info!(
        world_id = %world.world_id(),
        state = %world.state(),
        fidelity = %stats.fidelity,
        fidelity_score = stats.fidelity_score,
        update_rate = stats.update_rate,
        ticks = stats.ticks,
        persists = stats.persists,
        clients = world.clients().len(),
        "World status"
    );

    let mut outcome = Supervision::default();

    match world.errored_clients() {
        Ok(errored) => {
            for client in errored {
                let returned = world.remove_client(client);
                warn!(
                    world_id = %world.world_id(),
                    client_id = %client,
                    returned = returned.len(),
                    "Detached errored client"
                );
                outcome.detached = outcome.detached.saturating_add(1);
            }
        }
        Err(e) => {
            warn!(world_id = %world.world_id(), error = %e, "Could not check for errored clients");
        }
    }

    let state = world.state();
    if state != DriverState::Running {
        warn!(world_id = %world.world_id(), state = %state, "World not running, restarting");
        match world.start() {
            Ok(()) => outcome.restarted = true,
            Err(e) => {
                error!(world_id = %world.world_id(), error = %e, "World restart failed, retrying next pass");
            }
        }
    }

    outcome
}
