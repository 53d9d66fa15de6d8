//! The simulation collaborator contract and an in-memory implementation.
//!
//! The driver never simulates anything itself. It schedules and serializes
//! calls into a [`WorldSimulation`]: hand it each client's inbound packets,
//! advance it one tick at a chosen [`Fidelity`], collect what it produced,
//! and occasionally ask it to persist.
//!
//! Expected outcomes are values: a rejected spawn is `Ok(false)`, a client
//! without a player is `Ok(None)`. Anything exceptional is an
//! `Err(SimulationError)`. Which tier of fault an error becomes is decided
//! by the driver from the call that produced it, not from the variant.
//!
//! [`EchoSimulation`] is a small implementation used by the host binary
//! and the tests. It echoes every inbound packet back to its sender on the
//! following tick.

use std::collections::{BTreeMap, BTreeSet};

use worldhost_types::{
    ClientId, Fidelity, Packet, PlanetTypeChange, PlayerPlacement, Position, SpawnTarget,
    WorldChunks,
};

/// Exceptional failures reported by a simulation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulationError {
    /// Processing for a single client failed.
    #[error("client {client_id} failed: {message}")]
    Client {
        /// The client whose processing failed.
        client_id: ClientId,
        /// Description of the failure.
        message: String,
    },

    /// Persisting world state failed.
    #[error("storage failure: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// Any other failure inside the simulation.
    #[error("simulation failure: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// The simulation panicked and the driver caught it.
    #[error("simulation panicked: {message}")]
    Panicked {
        /// The panic payload, when it was a string.
        message: String,
    },
}

/// A world simulation driven by a [`WorldDriver`](crate::driver::WorldDriver).
///
/// All methods are called with the driver's state lock held, from either
/// the tick loop thread or a caller's thread, never concurrently.
pub trait WorldSimulation: Send {
    /// Whether a client could be placed at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if validation itself fails.
    fn spawn_target_valid(&self, target: &SpawnTarget) -> Result<bool, SimulationError>;

    /// Attach a client. `Ok(false)` is an ordinary rejection.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] on an exceptional failure.
    fn add_client(
        &mut self,
        client: ClientId,
        target: &SpawnTarget,
        is_local: bool,
    ) -> Result<bool, SimulationError>;

    /// Detach a client and return any final packets for it.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if the client could not be removed.
    fn remove_client(&mut self, client: ClientId) -> Result<Vec<Packet>, SimulationError>;

    /// Whether the simulation currently knows `client`.
    fn has_client(&self, client: ClientId) -> bool;

    /// Every client the simulation currently knows, in id order.
    fn client_ids(&self) -> Vec<ClientId>;

    /// Accept a batch of inbound packets for `client`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if the batch could not be processed. The
    /// driver treats this as a fault of that client alone.
    fn handle_incoming_packets(
        &mut self,
        client: ClientId,
        packets: Vec<Packet>,
    ) -> Result<(), SimulationError>;

    /// Set the detail level for subsequent ticks.
    fn set_fidelity(&mut self, fidelity: Fidelity);

    /// Advance the world by one tick.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if the tick failed.
    fn update(&mut self) -> Result<(), SimulationError>;

    /// Packets produced for `client` since the last call.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if the packets could not be produced.
    fn outgoing_packets(&mut self, client: ClientId) -> Result<Vec<Packet>, SimulationError>;

    /// Persist world state to durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if persisting failed.
    fn sync(&mut self) -> Result<(), SimulationError>;

    /// Snapshot of the world's stored chunks.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if the chunks could not be read.
    fn read_chunks(&self) -> Result<WorldChunks, SimulationError>;

    /// Take the pending change of world type, if one was requested.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if the pending change could not be read.
    fn pull_new_planet_type(&mut self) -> Result<Option<PlanetTypeChange>, SimulationError>;

    /// Where `client`'s player stands, or `None` if it has no player.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if the lookup failed.
    fn player_placement(&self, client: ClientId)
    -> Result<Option<PlayerPlacement>, SimulationError>;
}

/// Feet offset reported for every player in an [`EchoSimulation`].
pub const ECHO_FEET_OFFSET: Position = Position::new(0.0, -2.5);

/// Per-client state inside an [`EchoSimulation`].
#[derive(Debug, Clone, Default)]
struct EchoClient {
    /// Where the player was placed.
    position: Position,
    /// Packets received and not yet echoed.
    inbox: Vec<Packet>,
    /// Packets echoed and not yet collected.
    outbox: Vec<Packet>,
}

/// An in-memory world that echoes packets back to their sender.
///
/// Packets handed in during one iteration are moved to the sender's
/// outbox by the next [`update`](WorldSimulation::update). Each sync stores
/// the tick count, the sync count, and the current fidelity as chunks
/// under `b"tick"`, `b"syncs"` and `b"fidelity"`.
#[derive(Debug, Default)]
pub struct EchoSimulation {
    /// Attached clients.
    clients: BTreeMap<ClientId, EchoClient>,
    /// Entity names that [`SpawnTarget::UniqueEntity`] may refer to.
    unique_entities: BTreeSet<String>,
    /// Fidelity set for the most recent tick.
    fidelity: Fidelity,
    /// Ticks advanced so far.
    ticks: u64,
    /// Syncs performed so far.
    syncs: u64,
    /// Persisted chunks.
    chunks: WorldChunks,
    /// World type change waiting to be pulled.
    pending_planet_type: Option<PlanetTypeChange>,
}

impl EchoSimulation {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` a valid [`SpawnTarget::UniqueEntity`] target.
    #[must_use]
    pub fn with_unique_entity(mut self, name: impl Into<String>) -> Self {
        self.unique_entities.insert(name.into());
        self
    }

    fn spawn_position(target: &SpawnTarget) -> Position {
        match target {
            SpawnTarget::Position(position) => *position,
            SpawnTarget::X(x) => Position::new(*x, 0.0),
            SpawnTarget::WorldDefault | SpawnTarget::UniqueEntity(_) => Position::default(),
        }
    }
}

impl WorldSimulation for EchoSimulation {
    fn spawn_target_valid(&self, target: &SpawnTarget) -> Result<bool, SimulationError> {
        Ok(match target {
            SpawnTarget::WorldDefault => true,
            SpawnTarget::UniqueEntity(name) => self.unique_entities.contains(name),
            SpawnTarget::Position(position) => position.x.is_finite() && position.y.is_finite(),
            SpawnTarget::X(x) => x.is_finite(),
        })
    }

    fn add_client(
        &mut self,
        client: ClientId,
        target: &SpawnTarget,
        _is_local: bool,
    ) -> Result<bool, SimulationError> {
        if self.clients.contains_key(&client) || !self.spawn_target_valid(target)? {
            return Ok(false);
        }
        self.clients.insert(
            client,
            EchoClient {
                position: Self::spawn_position(target),
                ..EchoClient::default()
            },
        );
        Ok(true)
    }

    fn remove_client(&mut self, client: ClientId) -> Result<Vec<Packet>, SimulationError> {
        let Some(mut state) = self.clients.remove(&client) else {
            return Ok(Vec::new());
        };
        // Anything still waiting to be echoed is flushed on the way out.
        state.outbox.append(&mut state.inbox);
        Ok(state.outbox)
    }

    fn has_client(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    fn handle_incoming_packets(
        &mut self,
        client: ClientId,
        packets: Vec<Packet>,
    ) -> Result<(), SimulationError> {
        let state = self
            .clients
            .get_mut(&client)
            .ok_or_else(|| SimulationError::Client {
                client_id: client,
                message: "client is not attached".to_owned(),
            })?;
        state.inbox.extend(packets);
        Ok(())
    }

    fn set_fidelity(&mut self, fidelity: Fidelity) {
        self.fidelity = fidelity;
    }

    fn update(&mut self) -> Result<(), SimulationError> {
        self.ticks = self.ticks.saturating_add(1);
        for state in self.clients.values_mut() {
            let mut echoed = std::mem::take(&mut state.inbox);
            state.outbox.append(&mut echoed);
        }
        Ok(())
    }

    fn outgoing_packets(&mut self, client: ClientId) -> Result<Vec<Packet>, SimulationError> {
        Ok(self
            .clients
            .get_mut(&client)
            .map(|state| std::mem::take(&mut state.outbox))
            .unwrap_or_default())
    }

    fn sync(&mut self) -> Result<(), SimulationError> {
        self.syncs = self.syncs.saturating_add(1);
        self.chunks
            .insert(b"tick".as_slice(), self.ticks.to_le_bytes().as_slice());
        self.chunks
            .insert(b"syncs".as_slice(), self.syncs.to_le_bytes().as_slice());
        self.chunks
            .insert(b"fidelity".as_slice(), self.fidelity.to_string().as_bytes());
        Ok(())
    }

    fn read_chunks(&self) -> Result<WorldChunks, SimulationError> {
        Ok(self.chunks.clone())
    }

    fn pull_new_planet_type(&mut self) -> Result<Option<PlanetTypeChange>, SimulationError> {
        Ok(self.pending_planet_type.take())
    }

    fn player_placement(
        &self,
        client: ClientId,
    ) -> Result<Option<PlayerPlacement>, SimulationError> {
        Ok(self.clients.get(&client).map(|state| PlayerPlacement {
            position: state.position,
            feet_offset: ECHO_FEET_OFFSET,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn packet(byte: u8) -> Packet {
        Packet::new(vec![byte])
    }

    #[test]
    fn echoes_after_one_tick() {
        let mut sim = EchoSimulation::new();
        let client = ClientId(1);
        assert!(sim.add_client(client, &SpawnTarget::WorldDefault, false).unwrap());

        sim.handle_incoming_packets(client, vec![packet(1), packet(2)])
            .unwrap();
        assert!(sim.outgoing_packets(client).unwrap().is_empty());

        sim.update().unwrap();
        assert_eq!(sim.outgoing_packets(client).unwrap(), vec![packet(1), packet(2)]);
        assert!(sim.outgoing_packets(client).unwrap().is_empty());
        assert_eq!(sim.ticks, 1);
    }

    #[test]
    fn rejects_duplicates_and_unknown_entities() {
        let mut sim = EchoSimulation::new().with_unique_entity("door");
        let door = SpawnTarget::UniqueEntity("door".to_owned());
        let window = SpawnTarget::UniqueEntity("window".to_owned());

        assert!(sim.spawn_target_valid(&door).unwrap());
        assert!(!sim.spawn_target_valid(&window).unwrap());
        assert!(!sim.add_client(ClientId(1), &window, false).unwrap());
        assert!(sim.add_client(ClientId(1), &door, false).unwrap());
        assert!(!sim.add_client(ClientId(1), &door, false).unwrap());
        assert_eq!(sim.client_ids(), vec![ClientId(1)]);
    }

    #[test]
    fn packets_for_unknown_client_are_a_client_error() {
        let mut sim = EchoSimulation::new();
        let err = sim
            .handle_incoming_packets(ClientId(4), vec![packet(0)])
            .unwrap_err();
        assert!(matches!(err, SimulationError::Client { client_id, .. } if client_id == ClientId(4)));
    }

    #[test]
    fn remove_flushes_pending_packets() {
        let mut sim = EchoSimulation::new();
        let client = ClientId(2);
        sim.add_client(client, &SpawnTarget::WorldDefault, true)
            .unwrap();
        sim.handle_incoming_packets(client, vec![packet(7)]).unwrap();
        sim.update().unwrap();
        sim.handle_incoming_packets(client, vec![packet(8)]).unwrap();

        assert_eq!(sim.remove_client(client).unwrap(), vec![packet(7), packet(8)]);
        assert!(!sim.has_client(client));
        assert!(sim.remove_client(client).unwrap().is_empty());
    }

    #[test]
    fn sync_records_tick_chunk() {
        let mut sim = EchoSimulation::new();
        sim.set_fidelity(Fidelity::High);
        sim.update().unwrap();
        sim.update().unwrap();
        sim.sync().unwrap();
        let chunks = sim.read_chunks().unwrap();
        assert_eq!(chunks.get(b"tick"), Some(2_u64.to_le_bytes().as_slice()));
        assert_eq!(chunks.get(b"syncs"), Some(1_u64.to_le_bytes().as_slice()));
        assert_eq!(chunks.get(b"fidelity"), Some(Fidelity::High.to_string().as_bytes()));
    }

    #[test]
    fn placement_follows_spawn_target() {
        let mut sim = EchoSimulation::new();
        sim.add_client(ClientId(3), &SpawnTarget::X(12.0), false)
            .unwrap();
        let placement = sim.player_placement(ClientId(3)).unwrap().unwrap();
        assert_eq!(placement.revive_position(), Position::new(12.0, -2.5));
        assert_eq!(sim.player_placement(ClientId(9)).unwrap(), None);
    }

    #[test]
    fn planet_type_is_pulled_once() {
        let mut sim = EchoSimulation::new();
        sim.pending_planet_type = Some(PlanetTypeChange {
            planet_type: "desert".to_owned(),
            primary_biome: "dunes".to_owned(),
        });
        assert_eq!(
            sim.pull_new_planet_type().unwrap().map(|c| c.planet_type),
            Some("desert".to_owned())
        );
        assert_eq!(sim.pull_new_planet_type().unwrap(), None);
    }
}
