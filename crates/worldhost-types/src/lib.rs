//! Shared type definitions for the worldhost world driver.
//!
//! These types cross the boundary between the network layer, the driver
//! in `worldhost-core`, and the simulation collaborator.
//!
//! # Modules
//!
//! - [`ids`] -- World and client identifiers
//! - [`enums`] -- Fidelity levels and fidelity mode selection
//! - [`structs`] -- Packets, spawn targets, positions, chunk snapshots

pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{Fidelity, FidelityMode, ParseFidelityError};
pub use ids::{ClientId, WorldId};
pub use structs::{
    Packet, PlanetTypeChange, PlayerPlacement, Position, SpawnTarget, WorldChunks,
};
