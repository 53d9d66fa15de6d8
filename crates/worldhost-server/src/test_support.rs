//! A simulation that fails at every step, for exercising fault handling.

use worldhost_core::simulation::{SimulationError, WorldSimulation};
use worldhost_types::{
    ClientId, Fidelity, Packet, PlanetTypeChange, PlayerPlacement, SpawnTarget, WorldChunks,
};

/// Returns an error from every fallible call and panics when listing
/// clients.
pub struct BrokenSimulation;

fn broken() -> SimulationError {
    SimulationError::Storage {
        message: "backing store unreachable".to_owned(),
    }
}

#[allow(clippy::panic)]
impl WorldSimulation for BrokenSimulation {
    fn spawn_target_valid(&self, _target: &SpawnTarget) -> Result<bool, SimulationError> {
        Err(broken())
    }

    fn add_client(
        &mut self,
        _client: ClientId,
        _target: &SpawnTarget,
        _is_local: bool,
    ) -> Result<bool, SimulationError> {
        Err(broken())
    }

    fn remove_client(&mut self, _client: ClientId) -> Result<Vec<Packet>, SimulationError> {
        Err(broken())
    }

    fn has_client(&self, _client: ClientId) -> bool {
        false
    }

    fn client_ids(&self) -> Vec<ClientId> {
        panic!("client table corrupted")
    }

    fn handle_incoming_packets(
        &mut self,
        _client: ClientId,
        _packets: Vec<Packet>,
    ) -> Result<(), SimulationError> {
        Err(broken())
    }

    fn set_fidelity(&mut self, _fidelity: Fidelity) {}

    fn update(&mut self) -> Result<(), SimulationError> {
        Err(broken())
    }

    fn outgoing_packets(&mut self, _client: ClientId) -> Result<Vec<Packet>, SimulationError> {
        Err(broken())
    }

    fn sync(&mut self) -> Result<(), SimulationError> {
        Err(broken())
    }

    fn read_chunks(&self) -> Result<WorldChunks, SimulationError> {
        Err(broken())
    }

    fn pull_new_planet_type(&mut self) -> Result<Option<PlanetTypeChange>, SimulationError> {
        Err(broken())
    }

    fn player_placement(
        &self,
        _client: ClientId,
    ) -> Result<Option<PlayerPlacement>, SimulationError> {
        Err(broken())
    }
}
