//! Threaded world driver: runs one simulated world on its own thread.
//!
//! The driver decouples simulation ticking from the network layer. Network
//! code pushes and pulls per-client packets at any time; the driver's loop
//! drains them into the simulation, ticks it at an adaptively chosen
//! fidelity, queues what it produced, and persists it periodically.
//!
//! # Modules
//!
//! - [`clock`] -- Time source trait with system and manual clocks.
//! - [`config`] -- Configuration loading from `worldhost-config.yaml` into
//!   strongly-typed structs.
//! - [`driver`] -- [`WorldDriver`], its loop, and the [`LockedWorld`] token.
//! - [`fidelity`] -- Hysteresis controller choosing the fidelity level.
//! - [`pacer`] -- Tick rate measurement, spare time, and the persistence
//!   timer.
//! - [`queues`] -- Per-client inbound and outbound packet queues.
//! - [`registry`] -- The driver's set of attached clients.
//! - [`simulation`] -- [`WorldSimulation`] contract and [`EchoSimulation`].
//! - [`status`] -- Driver lifecycle state machine.
//!
//! [`WorldDriver`]: driver::WorldDriver
//! [`LockedWorld`]: driver::LockedWorld
//! [`WorldSimulation`]: simulation::WorldSimulation
//! [`EchoSimulation`]: simulation::EchoSimulation

pub mod clock;
pub mod config;
pub mod driver;
pub mod fidelity;
pub mod pacer;
pub mod queues;
pub mod registry;
pub mod simulation;
pub mod status;
