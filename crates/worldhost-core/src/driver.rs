//! The threaded world driver.
//!
//! A [`WorldDriver`] owns one [`WorldSimulation`] and runs it on a
//! dedicated background thread. Each loop iteration:
//!
//! 1. Publishes the effective fidelity and measured tick rate to
//!    [`DriverStats`].
//! 2. Under the state lock: forwards every client's queued inbound packets
//!    to the simulation, sets the fidelity, advances one tick unless
//!    paused, queues what the simulation produced for each client, and
//!    runs the per-update action.
//! 3. Records the tick with the [`TickPacer`] and feeds the resulting
//!    spare time to the [`FidelityController`].
//! 4. Syncs the simulation when the persistence interval has elapsed.
//! 5. Sleeps for whatever spare time remains.
//!
//! # Locking
//!
//! Two locks, always taken in this order: the state lock (simulation,
//! client registry, update action, pause signal) and the queue lock inside
//! [`PacketQueueBridge`]. The queue lock is never held while the
//! simulation runs, so [`WorldDriver::push_incoming`] and
//! [`WorldDriver::pull_outgoing`] never wait on a tick.
//!
//! The state lock is not re-entrant. Code that already holds it, namely
//! actions passed to [`WorldDriver::execute_action`] and the per-update
//! action, receives a [`LockedWorld`] token exposing the same client
//! operations. Calling the driver's own locking methods from inside an
//! action deadlocks. Dropping the last [`WorldDriver`] handle from inside
//! the per-update action is allowed: the loop stops and detaches the
//! remaining clients once it has released the lock.
//!
//! # Faults
//!
//! A failure while handling one client's inbound packets removes that
//! client from the simulation and the loop carries on. Every other failure
//! is fatal: it is logged, the driver latches [`DriverState::Faulted`], and
//! the loop exits. Panics raised by the simulation or an action are caught
//! and treated as failures. Only [`WorldDriver::start`] clears the latch.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, trace, warn};
use worldhost_types::{
    ClientId, Fidelity, FidelityMode, Packet, PlanetTypeChange, PlayerPlacement, Position,
    SpawnTarget, WorldChunks, WorldId,
};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, DriverConfig};
use crate::fidelity::FidelityController;
use crate::pacer::{PersistTimer, TickPacer};
use crate::queues::PacketQueueBridge;
use crate::registry::ClientRegistry;
use crate::simulation::{SimulationError, WorldSimulation};
use crate::status::{DriverState, StatusCell};

thread_local! {
    /// World whose loop runs on the current thread, if any.
    static LOOP_WORLD: Cell<Option<WorldId>> = const { Cell::new(None) };
}

/// Errors surfaced by a [`WorldDriver`].
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A simulation call failed. The driver has latched its fault flag.
    #[error("world {world_id}: {operation} failed: {source}")]
    Simulation {
        /// The world whose simulation failed.
        world_id: WorldId,
        /// The driver operation that made the call.
        operation: &'static str,
        /// The failure reported by the simulation.
        source: SimulationError,
    },

    /// The background thread could not be spawned.
    #[error("failed to spawn world thread: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

/// Recurring action run once per loop iteration, after outbound packets
/// have been queued.
pub type UpdateAction = Box<dyn FnMut(&mut LockedWorld<'_>) + Send>;

/// Resolved loop parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverSettings {
    /// Desired time between ticks.
    pub target_period: Duration,
    /// Window over which the tick rate is measured.
    pub measure_window: Duration,
    /// Time between periodic syncs.
    pub storage_interval: Duration,
    /// Locked fidelity or automatic control.
    pub fidelity_mode: FidelityMode,
    /// Score at or below which automatic fidelity drops.
    pub fidelity_decrement_score: f64,
    /// Score at or above which automatic fidelity rises.
    pub fidelity_increment_score: f64,
}

impl DriverSettings {
    /// Resolve settings from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration is invalid.
    pub fn from_config(config: &DriverConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            target_period: config.target_period(),
            measure_window: config.update_measure_window(),
            storage_interval: config.storage_interval(),
            fidelity_mode: config.fidelity_mode()?,
            fidelity_decrement_score: config.fidelity_decrement_score,
            fidelity_increment_score: config.fidelity_increment_score,
        })
    }
}

/// Observability snapshot published by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DriverStats {
    /// Fidelity used for the most recent iteration.
    pub fidelity: Fidelity,
    /// Fidelity controller score accumulated since its last level change.
    pub fidelity_score: f64,
    /// Measured ticks per second.
    pub update_rate: f64,
    /// Loop iterations completed.
    pub iterations: u64,
    /// Iterations in which the simulation was advanced.
    pub ticks: u64,
    /// Periodic syncs performed.
    pub persists: u64,
    /// Wall-clock time of the last periodic sync.
    pub last_persisted_at: Option<DateTime<Utc>>,
}

impl Default for DriverStats {
    fn default() -> Self {
        Self {
            fidelity: Fidelity::default(),
            fidelity_score: 0.0,
            update_rate: 0.0,
            iterations: 0,
            ticks: 0,
            persists: 0,
            last_persisted_at: None,
        }
    }
}

/// Everything guarded by the state lock.
struct WorldState {
    simulation: Box<dyn WorldSimulation>,
    registry: ClientRegistry,
    update_action: Option<UpdateAction>,
    pause: Option<Arc<AtomicBool>>,
}

impl WorldState {
    /// Whether the pause signal is present and set.
    ///
    /// The signal is owned outside the driver and only ever gates whether
    /// the next tick runs, so no ordering with other memory is needed.
    fn paused(&self) -> bool {
        self.pause
            .as_ref()
            .is_some_and(|pause| pause.load(Ordering::Relaxed))
    }
}

/// State shared between the driver handle and its loop thread.
struct Shared {
    world_id: WorldId,
    state: Mutex<WorldState>,
    queues: PacketQueueBridge,
    status: StatusCell,
    stop_requested: AtomicBool,
    /// Set when the driver handle was dropped on its own loop thread; the
    /// loop detaches the remaining clients once it has released the state.
    detach_on_exit: AtomicBool,
    stats: Mutex<DriverStats>,
    clock: Arc<dyn Clock>,
    settings: DriverSettings,
}

/// Runs one world on its own thread and mediates all access to it.
pub struct WorldDriver {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorldDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldDriver")
            .field("world_id", &self.shared.world_id)
            .field("state", &self.shared.status.get())
            .finish_non_exhaustive()
    }
}

impl WorldDriver {
    /// Create a stopped driver timed by the system clock.
    pub fn new(
        world_id: WorldId,
        simulation: impl WorldSimulation + 'static,
        settings: DriverSettings,
    ) -> Self {
        Self::with_clock(world_id, simulation, settings, Arc::new(SystemClock::new()))
    }

    /// Create a stopped driver timed by `clock`.
    pub fn with_clock(
        world_id: WorldId,
        simulation: impl WorldSimulation + 'static,
        settings: DriverSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Shared {
            world_id,
            state: Mutex::new(WorldState {
                simulation: Box::new(simulation),
                registry: ClientRegistry::new(),
                update_action: None,
                pause: None,
            }),
            queues: PacketQueueBridge::new(),
            status: StatusCell::new(),
            stop_requested: AtomicBool::new(false),
            detach_on_exit: AtomicBool::new(false),
            stats: Mutex::new(DriverStats::default()),
            clock,
            settings,
        };
        Self {
            shared: Arc::new(shared),
            handle: Mutex::new(None),
        }
    }

    /// The world this driver runs.
    pub fn world_id(&self) -> WorldId {
        self.shared.world_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        self.shared.status.get()
    }

    /// Whether an unrecoverable failure has occurred since the last start.
    pub fn server_error_occurred(&self) -> bool {
        self.shared.status.is_faulted()
    }

    /// Latest observability snapshot.
    pub fn stats(&self) -> DriverStats {
        *self.shared.lock_stats()
    }

    /// Start the loop thread, clearing any stop request and fault.
    ///
    /// Does nothing if a loop is already running normally. A loop that is
    /// winding down after a stop request or fault is joined first.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Spawn`] if the thread could not be created.
    pub fn start(&self) -> Result<(), DriverError> {
        let mut handle = self.lock_handle();
        let live = handle.as_ref().is_some_and(|running| !running.is_finished());
        if live
            && self.shared.status.get() == DriverState::Running
            && !self.shared.stop_requested.load(Ordering::Acquire)
        {
            return Ok(());
        }
        if let Some(previous) = handle.take() {
            self.join_loop(previous);
        }

        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.status.begin_running();

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("world-{}", self.shared.world_id))
            .spawn(move || shared.run());
        match spawned {
            Ok(running) => {
                *handle = Some(running);
                info!(world_id = %self.shared.world_id, "World driver started");
                Ok(())
            }
            Err(source) => {
                self.shared.status.mark_stopped();
                error!(world_id = %self.shared.world_id, error = %source, "Failed to spawn world thread");
                Err(DriverError::Spawn { source })
            }
        }
    }

    /// Request the loop to stop and wait for it to exit.
    ///
    /// The current iteration completes first. Called from the loop thread
    /// itself, this only records the request.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        if LOOP_WORLD.with(Cell::get) == Some(self.shared.world_id) {
            return;
        }
        let mut handle = self.lock_handle();
        if let Some(running) = handle.take() {
            self.join_loop(running);
            info!(world_id = %self.shared.world_id, state = %self.state(), "World driver stopped");
        }
    }

    fn join_loop(&self, running: JoinHandle<()>) {
        if running.join().is_err() {
            self.shared.status.latch_fault();
            error!(world_id = %self.shared.world_id, "World thread panicked");
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a client. See [`LockedWorld::add_client`].
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] on an exceptional failure.
    pub fn add_client(
        &self,
        client: ClientId,
        target: &SpawnTarget,
        is_local: bool,
    ) -> Result<bool, DriverError> {
        self.with_world(|world| world.add_client(client, target, is_local))
    }

    /// Detach a client. See [`LockedWorld::remove_client`].
    pub fn remove_client(&self, client: ClientId) -> Vec<Packet> {
        self.with_world(|world| world.remove_client(client))
    }

    /// Attached clients, in id order.
    pub fn clients(&self) -> Vec<ClientId> {
        self.shared.lock_state().registry.snapshot()
    }

    /// Whether `client` is attached.
    pub fn has_client(&self, client: ClientId) -> bool {
        self.shared.lock_state().registry.contains(client)
    }

    /// Attached clients the simulation has dropped on its own.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] and latches the fault flag if
    /// the simulation could not list its clients.
    pub fn errored_clients(&self) -> Result<Vec<ClientId>, DriverError> {
        self.with_world(|world| world.errored_clients())
    }

    /// Queue inbound packets for `client`. Never waits on a tick.
    ///
    /// Returns `false`, dropping the packets, if the client is not attached.
    pub fn push_incoming(&self, client: ClientId, packets: Vec<Packet>) -> bool {
        self.shared.queues.push_incoming(client, packets)
    }

    /// Take every outbound packet queued for `client`, oldest first.
    pub fn pull_outgoing(&self, client: ClientId) -> Vec<Packet> {
        self.shared.queues.take_outgoing(client)
    }

    /// Run `action` with exclusive access to the world, between ticks.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] with
    /// [`SimulationError::Panicked`] if the action panicked. The fault flag
    /// is latched in that case.
    pub fn execute_action<R>(
        &self,
        action: impl FnOnce(&mut LockedWorld<'_>) -> R,
    ) -> Result<R, DriverError> {
        let outcome = {
            let mut state = self.shared.lock_state();
            let mut world = LockedWorld::new(&self.shared, &mut state);
            panic::catch_unwind(AssertUnwindSafe(|| action(&mut world)))
        };
        outcome.map_err(|payload| {
            self.shared.fault(
                "execute_action",
                None,
                SimulationError::Panicked {
                    message: panic_message(payload.as_ref()),
                },
            )
        })
    }

    /// Install an action to run once per loop iteration, replacing any
    /// previous one.
    pub fn set_update_action(&self, action: impl FnMut(&mut LockedWorld<'_>) + Send + 'static) {
        self.with_world(|world| world.set_update_action(action));
    }

    /// Remove the per-update action.
    pub fn clear_update_action(&self) {
        self.with_world(|world| world.clear_update_action());
    }

    /// Install or remove the externally owned pause signal.
    ///
    /// While the signal is set the loop keeps moving packets and syncing
    /// but does not advance the simulation.
    pub fn set_pause(&self, pause: Option<Arc<AtomicBool>>) {
        self.shared.lock_state().pause = pause;
    }

    /// Whether a client could be placed at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] and latches the fault flag if
    /// validation failed.
    pub fn spawn_target_valid(&self, target: &SpawnTarget) -> Result<bool, DriverError> {
        self.query("spawn_target_valid", None, |sim| {
            sim.spawn_target_valid(target)
        })
    }

    /// Where `client`'s player should be revived: its position moved to
    /// its feet. `None` if the client has no player.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] and latches the fault flag if
    /// the lookup failed.
    pub fn player_revive_position(&self, client: ClientId) -> Result<Option<Position>, DriverError> {
        self.query("player_revive_position", Some(client), |sim| {
            sim.player_placement(client)
        })
        .map(|placement| placement.map(PlayerPlacement::revive_position))
    }

    /// Take the pending change of world type, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] and latches the fault flag if
    /// the change could not be read.
    pub fn pull_new_planet_type(&self) -> Result<Option<PlanetTypeChange>, DriverError> {
        self.query("pull_new_planet_type", None, |sim| sim.pull_new_planet_type())
    }

    /// Snapshot of the world's stored chunks.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] and latches the fault flag if
    /// the chunks could not be read.
    pub fn read_chunks(&self) -> Result<WorldChunks, DriverError> {
        self.query("read_chunks", None, |sim| sim.read_chunks())
    }

    fn with_world<R>(&self, f: impl FnOnce(&mut LockedWorld<'_>) -> R) -> R {
        let mut state = self.shared.lock_state();
        f(&mut LockedWorld::new(&self.shared, &mut state))
    }

    fn query<R>(
        &self,
        operation: &'static str,
        client: Option<ClientId>,
        call: impl FnOnce(&mut dyn WorldSimulation) -> Result<R, SimulationError>,
    ) -> Result<R, DriverError> {
        let mut state = self.shared.lock_state();
        let simulation = state.simulation.as_mut();
        guarded(|| call(simulation)).map_err(|source| self.shared.fault(operation, client, source))
    }
}

impl Drop for WorldDriver {
    fn drop(&mut self) {
        self.stop();
        if LOOP_WORLD.with(Cell::get) == Some(self.shared.world_id) {
            // The loop may be holding the state lock right now.
            self.shared.detach_on_exit.store(true, Ordering::Release);
            debug!(world_id = %self.shared.world_id, "Driver dropped on its loop thread, detaching clients on exit");
            return;
        }
        self.shared.detach_all();
    }
}

/// Exclusive access to a world whose state lock is already held.
///
/// Handed to actions and the per-update action. Every method here works
/// on the held state directly, so none of them can deadlock.
pub struct LockedWorld<'a> {
    shared: &'a Shared,
    state: &'a mut WorldState,
    update_action_replaced: bool,
}

impl<'a> LockedWorld<'a> {
    fn new(shared: &'a Shared, state: &'a mut WorldState) -> Self {
        Self {
            shared,
            state,
            update_action_replaced: false,
        }
    }

    /// The world being accessed.
    pub fn world_id(&self) -> WorldId {
        self.shared.world_id
    }

    /// Direct access to the simulation.
    pub fn simulation(&mut self) -> &mut dyn WorldSimulation {
        self.state.simulation.as_mut()
    }

    /// Attach a client with the simulation, then create its queues.
    ///
    /// `Ok(false)` means the simulation rejected the client; nothing is
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] and latches the fault flag on an
    /// exceptional failure.
    pub fn add_client(
        &mut self,
        client: ClientId,
        target: &SpawnTarget,
        is_local: bool,
    ) -> Result<bool, DriverError> {
        let simulation = self.state.simulation.as_mut();
        match guarded(|| simulation.add_client(client, target, is_local)) {
            Ok(true) => {
                self.state.registry.insert(client);
                self.shared.queues.register(client);
                info!(world_id = %self.shared.world_id, client_id = %client, is_local, "Client added");
                Ok(true)
            }
            Ok(false) => {
                debug!(world_id = %self.shared.world_id, client_id = %client, "Client rejected by simulation");
                Ok(false)
            }
            Err(source) => Err(self.shared.fault("add_client", Some(client), source)),
        }
    }

    /// Detach a client and return everything still owed to it.
    ///
    /// Queued inbound packets are handed to the simulation first if it
    /// still knows the client. The result is the queued outbound packets
    /// followed by whatever the simulation emits while removing the client.
    /// Unknown clients yield an empty result.
    ///
    /// The client's queues and registration are always removed. A
    /// simulation failure along the way is logged and latches the fault
    /// flag.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<Packet> {
        if !self.state.registry.contains(client) {
            return Vec::new();
        }

        let incoming = self.shared.queues.take_incoming(client);
        let simulation = self.state.simulation.as_mut();
        let farewell = guarded(|| {
            if !simulation.has_client(client) {
                return Ok(Vec::new());
            }
            simulation.handle_incoming_packets(client, incoming)?;
            simulation.remove_client(client)
        });

        self.state.registry.remove(client);
        let mut outgoing = self.shared.queues.unregister(client).outgoing;
        match farewell {
            Ok(packets) => outgoing.extend(packets),
            Err(source) => {
                self.shared.fault("remove_client", Some(client), source);
            }
        }
        info!(world_id = %self.shared.world_id, client_id = %client, returned = outgoing.len(), "Client removed");
        outgoing
    }

    /// Attached clients, in id order.
    pub fn clients(&self) -> Vec<ClientId> {
        self.state.registry.snapshot()
    }

    /// Whether `client` is attached.
    pub fn has_client(&self, client: ClientId) -> bool {
        self.state.registry.contains(client)
    }

    /// Attached clients the simulation no longer knows.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Simulation`] and latches the fault flag if
    /// the simulation could not list its clients.
    pub fn errored_clients(&self) -> Result<Vec<ClientId>, DriverError> {
        let simulation = &*self.state.simulation;
        let known = guarded(|| Ok(simulation.client_ids()))
            .map_err(|source| self.shared.fault("errored_clients", None, source))?;
        Ok(self.state.registry.errored(&known))
    }

    /// Install the per-update action, replacing any previous one.
    pub fn set_update_action(&mut self, action: impl FnMut(&mut LockedWorld<'_>) + Send + 'static) {
        self.state.update_action = Some(Box::new(action));
        self.update_action_replaced = true;
    }

    /// Remove the per-update action.
    pub fn clear_update_action(&mut self) {
        self.state.update_action = None;
        self.update_action_replaced = true;
    }

    /// Ask the loop to exit after the current iteration.
    pub fn request_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, DriverStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log a fatal failure, latch the fault flag, and build the error.
    fn fault(
        &self,
        operation: &'static str,
        client: Option<ClientId>,
        source: SimulationError,
    ) -> DriverError {
        error!(
            world_id = %self.world_id,
            client_id = client.map(ClientId::get),
            operation,
            error = %source,
            "World fault"
        );
        if self.status.latch_fault() {
            warn!(world_id = %self.world_id, "World driver faulted");
        }
        DriverError::Simulation {
            world_id: self.world_id,
            operation,
            source,
        }
    }

    /// Body of the loop thread.
    fn run(&self) {
        let span = info_span!("world", world_id = %self.world_id);
        let _entered = span.enter();
        LOOP_WORLD.with(|world| world.set(Some(self.world_id)));

        let settings = self.settings;
        let mut controller = FidelityController::new(
            settings.fidelity_mode,
            settings.fidelity_decrement_score,
            settings.fidelity_increment_score,
        );
        let mut pacer = TickPacer::new(settings.target_period, settings.measure_window);
        let mut persist = PersistTimer::new(settings.storage_interval, self.clock.now());

        info!(
            target_period_ms = settings.target_period.as_secs_f64() * 1_000.0,
            fidelity_mode = %settings.fidelity_mode,
            storage_interval_ms = settings.storage_interval.as_secs_f64() * 1_000.0,
            "World loop started"
        );

        while !self.stop_requested.load(Ordering::Acquire) && !self.status.is_faulted() {
            let fidelity = controller.current();
            self.publish(fidelity, controller.score(), pacer.rate());

            let Ok(ticked) = self.iterate(fidelity) else {
                break;
            };

            let now = self.clock.now();
            pacer.tick(now);
            controller.record(pacer.spare_time());

            if persist.time_up(now) {
                if self.sync().is_err() {
                    break;
                }
                persist.restart(self.clock.now());
            }

            self.record_iteration(ticked);

            if let Some(spare) = pacer.spare_duration() {
                self.clock.sleep(spare);
            }
        }

        LOOP_WORLD.with(|world| world.set(None));
        if self.detach_on_exit.swap(false, Ordering::AcqRel) {
            self.detach_all();
        }
        let state = self.status.mark_stopped();
        info!(state = %state, "World loop exited");
    }

    /// One pass over clients and simulation under the state lock.
    /// Returns whether the simulation was advanced.
    fn iterate(&self, fidelity: Fidelity) -> Result<bool, DriverError> {
        // Declared before the guard so a replaced action is dropped only
        // after the state lock is released.
        let mut retired: Vec<UpdateAction> = Vec::new();
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let known = guarded(|| Ok(state.simulation.client_ids()))
            .map_err(|source| self.fault("client_ids", None, source))?;
        let mut live: Vec<ClientId> = known
            .into_iter()
            .filter(|client| state.registry.contains(*client))
            .collect();

        let mut dropped = Vec::new();
        for &client in &live {
            let incoming = self.queues.take_incoming(client);
            let simulation = state.simulation.as_mut();
            let Err(cause) = guarded(|| simulation.handle_incoming_packets(client, incoming)) else {
                continue;
            };
            error!(
                world_id = %self.world_id,
                client_id = %client,
                operation = "handle_incoming_packets",
                error = %cause,
                "Client fault, removing client from simulation"
            );
            let farewell = guarded(|| simulation.remove_client(client))
                .map_err(|source| self.fault("remove_client", Some(client), source))?;
            self.queues.push_outgoing(client, farewell);
            dropped.push(client);
        }
        live.retain(|client| !dropped.contains(client));

        let paused = state.paused();
        let simulation = state.simulation.as_mut();
        guarded(|| {
            simulation.set_fidelity(fidelity);
            if paused {
                Ok(())
            } else {
                simulation.update()
            }
        })
        .map_err(|source| self.fault("update", None, source))?;

        for client in live {
            let produced = guarded(|| simulation.outgoing_packets(client))
                .map_err(|source| self.fault("outgoing_packets", Some(client), source))?;
            self.queues.push_outgoing(client, produced);
        }

        if let Some(mut action) = state.update_action.take() {
            let mut world = LockedWorld::new(self, state);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| action(&mut world)));
            if world.update_action_replaced {
                retired.push(action);
            } else {
                state.update_action = Some(action);
            }
            if let Err(payload) = outcome {
                return Err(self.fault(
                    "update_action",
                    None,
                    SimulationError::Panicked {
                        message: panic_message(payload.as_ref()),
                    },
                ));
            }
        }

        Ok(!paused)
    }

    /// Force-remove every attached client.
    fn detach_all(&self) {
        let mut state = self.lock_state();
        let mut world = LockedWorld::new(self, &mut state);
        for client in world.clients() {
            world.remove_client(client);
        }
    }

    /// Periodic persistence.
    fn sync(&self) -> Result<(), DriverError> {
        let mut state = self.lock_state();
        debug!(world_id = %self.world_id, "Periodic sync of world state");
        let simulation = state.simulation.as_mut();
        guarded(|| simulation.sync()).map_err(|source| self.fault("sync", None, source))?;
        drop(state);

        let mut stats = self.lock_stats();
        stats.persists = stats.persists.saturating_add(1);
        stats.last_persisted_at = Some(Utc::now());
        Ok(())
    }

    fn publish(&self, fidelity: Fidelity, fidelity_score: f64, update_rate: f64) {
        trace!(fidelity = %fidelity, fidelity_score, update_rate, "World tick");
        let mut stats = self.lock_stats();
        stats.fidelity = fidelity;
        stats.fidelity_score = fidelity_score;
        stats.update_rate = update_rate;
    }

    fn record_iteration(&self, ticked: bool) {
        let mut stats = self.lock_stats();
        stats.iterations = stats.iterations.saturating_add(1);
        if ticked {
            stats.ticks = stats.ticks.saturating_add(1);
        }
    }
}

/// Run a simulation call, converting a panic into
/// [`SimulationError::Panicked`].
fn guarded<R>(call: impl FnOnce() -> Result<R, SimulationError>) -> Result<R, SimulationError> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(SimulationError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Instant;

    use crate::clock::ManualClock;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Incoming(ClientId, Vec<Packet>),
        Removed(ClientId),
        Update,
        Sync,
    }

    /// Knobs and observations shared between a test and its simulation.
    #[derive(Debug, Default)]
    struct Script {
        events: Vec<Event>,
        fidelities: Vec<Fidelity>,
        fail_incoming: BTreeSet<ClientId>,
        fail_update: bool,
        panic_update: bool,
        fail_add: bool,
        panic_client_ids: bool,
        update_cost: Duration,
    }

    impl Script {
        fn count(&self, wanted: &Event) -> usize {
            self.events.iter().filter(|event| *event == wanted).count()
        }
    }

    struct ScriptedSimulation {
        script: Arc<Mutex<Script>>,
        clock: Arc<ManualClock>,
        clients: BTreeSet<ClientId>,
        outbox: BTreeMap<ClientId, Vec<Packet>>,
        ticks: u64,
    }

    impl WorldSimulation for ScriptedSimulation {
        fn spawn_target_valid(&self, target: &SpawnTarget) -> Result<bool, SimulationError> {
            Ok(*target != SpawnTarget::UniqueEntity("nowhere".to_owned()))
        }

        fn add_client(
            &mut self,
            client: ClientId,
            target: &SpawnTarget,
            _is_local: bool,
        ) -> Result<bool, SimulationError> {
            if self.script.lock().unwrap().fail_add {
                return Err(SimulationError::Internal {
                    message: "entity store unavailable".to_owned(),
                });
            }
            Ok(self.spawn_target_valid(target)? && self.clients.insert(client))
        }

        fn remove_client(&mut self, client: ClientId) -> Result<Vec<Packet>, SimulationError> {
            self.script.lock().unwrap().events.push(Event::Removed(client));
            self.clients.remove(&client);
            let mut farewell = self.outbox.remove(&client).unwrap_or_default();
            farewell.push(Packet::new(format!("bye {client}")));
            Ok(farewell)
        }

        fn has_client(&self, client: ClientId) -> bool {
            self.clients.contains(&client)
        }

        fn client_ids(&self) -> Vec<ClientId> {
            let explode = self.script.lock().unwrap().panic_client_ids;
            assert!(!explode, "client table corrupted");
            self.clients.iter().copied().collect()
        }

        fn handle_incoming_packets(
            &mut self,
            client: ClientId,
            packets: Vec<Packet>,
        ) -> Result<(), SimulationError> {
            let mut script = self.script.lock().unwrap();
            if script.fail_incoming.contains(&client) {
                return Err(SimulationError::Client {
                    client_id: client,
                    message: "malformed packet".to_owned(),
                });
            }
            if !packets.is_empty() {
                script.events.push(Event::Incoming(client, packets));
            }
            Ok(())
        }

        fn set_fidelity(&mut self, fidelity: Fidelity) {
            self.script.lock().unwrap().fidelities.push(fidelity);
        }

        fn update(&mut self) -> Result<(), SimulationError> {
            let (explode, fail, cost) = {
                let mut script = self.script.lock().unwrap();
                script.events.push(Event::Update);
                (script.panic_update, script.fail_update, script.update_cost)
            };
            // Panic with the script unlocked so the test can still read it.
            assert!(!explode, "physics exploded");
            if fail {
                return Err(SimulationError::Internal {
                    message: "tick failed".to_owned(),
                });
            }
            self.clock.advance(cost);
            self.ticks = self.ticks.saturating_add(1);
            for client in &self.clients {
                self.outbox
                    .entry(*client)
                    .or_default()
                    .push(Packet::new(format!("tick {} for {client}", self.ticks)));
            }
            Ok(())
        }

        fn outgoing_packets(&mut self, client: ClientId) -> Result<Vec<Packet>, SimulationError> {
            Ok(self.outbox.remove(&client).unwrap_or_default())
        }

        fn sync(&mut self) -> Result<(), SimulationError> {
            self.script.lock().unwrap().events.push(Event::Sync);
            Ok(())
        }

        fn read_chunks(&self) -> Result<WorldChunks, SimulationError> {
            Err(SimulationError::Storage {
                message: "chunk store offline".to_owned(),
            })
        }

        fn pull_new_planet_type(&mut self) -> Result<Option<PlanetTypeChange>, SimulationError> {
            Ok(None)
        }

        fn player_placement(
            &self,
            client: ClientId,
        ) -> Result<Option<PlayerPlacement>, SimulationError> {
            Ok(self.clients.contains(&client).then_some(PlayerPlacement {
                position: Position::new(1.0, 10.0),
                feet_offset: Position::new(0.0, -1.0),
            }))
        }
    }

    fn settings(period_ms: u64, storage_ms: u64, fidelity_mode: FidelityMode) -> DriverSettings {
        DriverSettings {
            target_period: Duration::from_millis(period_ms),
            measure_window: Duration::from_millis(500),
            storage_interval: Duration::from_millis(storage_ms),
            fidelity_mode,
            fidelity_decrement_score: -2.0,
            fidelity_increment_score: 10.0,
        }
    }

    fn harness(settings: DriverSettings) -> (WorldDriver, Arc<Mutex<Script>>, Arc<ManualClock>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let clock = Arc::new(ManualClock::new());
        let simulation = ScriptedSimulation {
            script: Arc::clone(&script),
            clock: Arc::clone(&clock),
            clients: BTreeSet::new(),
            outbox: BTreeMap::new(),
            ticks: 0,
        };
        let driver = WorldDriver::with_clock(WorldId::new(), simulation, settings, Arc::clone(&clock) as Arc<dyn Clock>);
        (driver, script, clock)
    }

    fn wait_until_idle(driver: &WorldDriver) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while driver.state() == DriverState::Running {
            assert!(Instant::now() < deadline, "world loop did not exit");
            thread::sleep(Duration::from_millis(1));
        }
        driver.stop();
    }

    /// Run the loop for exactly `iterations` iterations, or until it faults.
    fn run_iterations(driver: &WorldDriver, iterations: u64) {
        let mut seen = 0_u64;
        driver.set_update_action(move |world| {
            seen = seen.saturating_add(1);
            if seen >= iterations {
                world.request_stop();
            }
        });
        driver.start().unwrap();
        wait_until_idle(driver);
    }

    /// Run the loop until the manual clock reaches `limit`.
    fn run_until(driver: &WorldDriver, clock: &Arc<ManualClock>, limit: Duration) {
        let clock = Arc::clone(clock);
        driver.set_update_action(move |world| {
            if clock.now() >= limit {
                world.request_stop();
            }
        });
        driver.start().unwrap();
        wait_until_idle(driver);
    }

    fn packets(labels: &[&str]) -> Vec<Packet> {
        labels.iter().map(|label| Packet::new(*label)).collect()
    }

    #[test]
    fn one_tick_forwards_inbound_in_order_and_returns_outbound() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        let c1 = ClientId(1);
        assert!(driver.add_client(c1, &SpawnTarget::WorldDefault, false).unwrap());
        assert!(driver.push_incoming(c1, packets(&["a", "b", "c"])));

        run_iterations(&driver, 1);

        let script = script.lock().unwrap();
        assert_eq!(
            script.events,
            vec![Event::Incoming(c1, packets(&["a", "b", "c"])), Event::Update]
        );
        drop(script);
        assert_eq!(
            driver.pull_outgoing(c1),
            vec![Packet::new(format!("tick 1 for {c1}"))]
        );
        assert!(driver.pull_outgoing(c1).is_empty());
    }

    #[test]
    fn outbound_order_is_preserved_across_ticks() {
        let (driver, _script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        let client = ClientId(3);
        driver.add_client(client, &SpawnTarget::WorldDefault, false).unwrap();

        run_iterations(&driver, 3);

        let expected: Vec<Packet> = (1..=3)
            .map(|tick| Packet::new(format!("tick {tick} for {client}")))
            .collect();
        assert_eq!(driver.pull_outgoing(client), expected);
    }

    #[test]
    fn client_fault_is_isolated() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        let (a, b) = (ClientId(1), ClientId(2));
        driver.add_client(a, &SpawnTarget::WorldDefault, false).unwrap();
        driver.add_client(b, &SpawnTarget::WorldDefault, false).unwrap();
        script.lock().unwrap().fail_incoming.insert(a);

        run_iterations(&driver, 1);

        assert_eq!(driver.state(), DriverState::Stopped);
        assert!(!driver.server_error_occurred());
        assert_eq!(driver.pull_outgoing(a), vec![Packet::new(format!("bye {a}"))]);
        assert_eq!(driver.pull_outgoing(b), vec![Packet::new(format!("tick 1 for {b}"))]);
        assert_eq!(driver.errored_clients().unwrap(), vec![a]);
        assert!(driver.has_client(a));

        // Detaching the errored client cleans up without touching the
        // simulation again.
        assert!(driver.remove_client(a).is_empty());
        assert!(driver.errored_clients().unwrap().is_empty());
    }

    #[test]
    fn fatal_update_failure_stops_ticking() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        script.lock().unwrap().fail_update = true;

        run_iterations(&driver, 5);

        assert_eq!(driver.state(), DriverState::Faulted);
        assert!(driver.server_error_occurred());
        assert_eq!(script.lock().unwrap().count(&Event::Update), 1);
        assert_eq!(driver.stats().iterations, 0);
    }

    #[test]
    fn panicking_simulation_faults_and_restart_recovers() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        script.lock().unwrap().panic_update = true;

        run_iterations(&driver, 5);
        assert!(driver.server_error_occurred());

        script.lock().unwrap().panic_update = false;
        run_iterations(&driver, 2);

        assert!(!driver.server_error_occurred());
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(script.lock().unwrap().count(&Event::Update), 3);
        assert_eq!(driver.stats().ticks, 2);
    }

    #[test]
    fn persists_on_interval_boundaries() {
        let (driver, script, clock) = harness(settings(50, 100, FidelityMode::Automatic));

        run_until(&driver, &clock, Duration::from_millis(250));

        // Syncs at 100ms and 200ms; the iteration at 250ms is the last.
        assert_eq!(script.lock().unwrap().count(&Event::Sync), 2);
        let stats = driver.stats();
        assert_eq!(stats.persists, 2);
        assert!(stats.last_persisted_at.is_some());
    }

    #[test]
    fn paused_world_moves_packets_and_persists_without_ticking() {
        let (driver, script, clock) = harness(settings(50, 100, FidelityMode::Automatic));
        let client = ClientId(7);
        driver.add_client(client, &SpawnTarget::WorldDefault, true).unwrap();
        driver.push_incoming(client, packets(&["hello"]));
        driver.set_pause(Some(Arc::new(AtomicBool::new(true))));

        run_until(&driver, &clock, Duration::from_millis(250));

        let script = script.lock().unwrap();
        assert_eq!(script.count(&Event::Update), 0);
        assert_eq!(script.count(&Event::Sync), 2);
        assert_eq!(
            script.events.first(),
            Some(&Event::Incoming(client, packets(&["hello"])))
        );
        drop(script);
        let stats = driver.stats();
        assert_eq!(stats.ticks, 0);
        assert_eq!(stats.iterations, 6);
    }

    #[test]
    fn locked_fidelity_is_used_verbatim() {
        let (driver, script, _clock) =
            harness(settings(50, 60_000, FidelityMode::Locked(Fidelity::Low)));
        script.lock().unwrap().update_cost = Duration::from_secs(1);

        run_iterations(&driver, 6);

        let script = script.lock().unwrap();
        assert_eq!(script.fidelities.len(), 6);
        assert!(script.fidelities.iter().all(|f| *f == Fidelity::Low));
    }

    #[test]
    fn overloaded_world_drops_to_minimum_fidelity() {
        let mut settings = settings(50, 60_000, FidelityMode::Automatic);
        settings.fidelity_decrement_score = -0.2;
        let (driver, script, _clock) = harness(settings);
        script.lock().unwrap().update_cost = Duration::from_millis(200);

        run_iterations(&driver, 12);

        let script = script.lock().unwrap();
        assert_eq!(script.fidelities.first(), Some(&Fidelity::Medium));
        assert_eq!(script.fidelities.last(), Some(&Fidelity::Minimum));
        assert!(script.fidelities.windows(2).all(|pair| pair.first() >= pair.get(1)));
        drop(script);
        let stats = driver.stats();
        assert_eq!(stats.fidelity, Fidelity::Minimum);
        assert!(stats.fidelity_score <= 0.0);
    }

    #[test]
    fn remove_client_is_idempotent() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        assert!(driver.remove_client(ClientId(42)).is_empty());

        let client = ClientId(5);
        driver.add_client(client, &SpawnTarget::WorldDefault, false).unwrap();
        driver.push_incoming(client, packets(&["last words"]));

        let returned = driver.remove_client(client);
        assert_eq!(returned, vec![Packet::new(format!("bye {client}"))]);
        assert_eq!(
            script.lock().unwrap().events,
            vec![
                Event::Incoming(client, packets(&["last words"])),
                Event::Removed(client)
            ]
        );
        assert!(driver.remove_client(client).is_empty());
        assert!(driver.clients().is_empty());
        assert!(!driver.push_incoming(client, packets(&["late"])));
        assert!(!driver.server_error_occurred());
    }

    #[test]
    fn rejected_spawn_is_not_a_fault() {
        let (driver, _script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        let nowhere = SpawnTarget::UniqueEntity("nowhere".to_owned());
        assert!(!driver.spawn_target_valid(&nowhere).unwrap());
        assert!(!driver.add_client(ClientId(1), &nowhere, false).unwrap());
        assert!(!driver.has_client(ClientId(1)));
        assert!(!driver.server_error_occurred());
    }

    #[test]
    fn exceptional_add_failure_latches_fault() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        script.lock().unwrap().fail_add = true;
        let err = driver
            .add_client(ClientId(1), &SpawnTarget::WorldDefault, false)
            .unwrap_err();
        assert!(matches!(err, DriverError::Simulation { operation: "add_client", .. }));
        assert!(driver.server_error_occurred());
        assert!(driver.clients().is_empty());
    }

    #[test]
    fn failed_query_latches_fault() {
        let (driver, _script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        assert!(driver.read_chunks().is_err());
        assert_eq!(driver.state(), DriverState::Faulted);
    }

    #[test]
    fn queries_reach_the_simulation() {
        let (driver, _script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        let client = ClientId(8);
        driver.add_client(client, &SpawnTarget::WorldDefault, false).unwrap();
        assert_eq!(
            driver.player_revive_position(client).unwrap(),
            Some(Position::new(1.0, 9.0))
        );
        assert_eq!(driver.player_revive_position(ClientId(9)).unwrap(), None);
        assert_eq!(driver.pull_new_planet_type().unwrap(), None);
    }

    #[test]
    fn actions_can_reenter_through_the_token() {
        let (driver, _script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        let client = ClientId(4);
        let removed = driver
            .execute_action(|world| {
                assert!(world.add_client(client, &SpawnTarget::X(3.0), false).unwrap());
                assert!(world.has_client(client));
                world.remove_client(client)
            })
            .unwrap();
        assert_eq!(removed, vec![Packet::new(format!("bye {client}"))]);
        assert!(driver.clients().is_empty());
    }

    #[test]
    fn panicking_action_latches_fault() {
        let (driver, _script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        let result = driver.execute_action(|world| {
            let no_clients = world.clients();
            assert!(!no_clients.is_empty(), "action gave up");
        });
        assert!(matches!(
            result,
            Err(DriverError::Simulation {
                source: SimulationError::Panicked { .. },
                ..
            })
        ));
        assert!(driver.server_error_occurred());
        // The state lock is still usable.
        assert!(driver.clients().is_empty());
    }

    #[test]
    fn drop_detaches_remaining_clients() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        driver.add_client(ClientId(1), &SpawnTarget::WorldDefault, false).unwrap();
        driver.push_incoming(ClientId(1), packets(&["pending"]));
        drop(driver);
        assert_eq!(
            script.lock().unwrap().events,
            vec![
                Event::Incoming(ClientId(1), packets(&["pending"])),
                Event::Removed(ClientId(1))
            ]
        );
    }

    #[test]
    fn update_action_may_release_the_last_driver_handle() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        let client = ClientId(1);
        driver.add_client(client, &SpawnTarget::WorldDefault, false).unwrap();

        let driver = Arc::new(driver);
        let slot = Arc::new(Mutex::new(Some(Arc::clone(&driver))));
        let armed = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));
        {
            let (armed, released) = (Arc::clone(&armed), Arc::clone(&released));
            driver.set_update_action(move |_world| {
                if !armed.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(last) = slot.lock().unwrap().take() {
                    drop(last);
                    released.store(true, Ordering::SeqCst);
                }
            });
        }
        driver.start().unwrap();
        // From here on the action owns the only handle.
        drop(driver);
        armed.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(10);
        while !script.lock().unwrap().events.contains(&Event::Removed(client)) {
            assert!(Instant::now() < deadline, "world was never torn down");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_client_listing_latches_fault() {
        let (driver, script, _clock) = harness(settings(50, 60_000, FidelityMode::Automatic));
        driver.add_client(ClientId(1), &SpawnTarget::WorldDefault, false).unwrap();
        script.lock().unwrap().panic_client_ids = true;

        let err = driver.errored_clients().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Simulation {
                operation: "errored_clients",
                source: SimulationError::Panicked { .. },
                ..
            }
        ));
        assert!(driver.server_error_occurred());
        // The state lock is still usable.
        assert_eq!(driver.clients(), vec![ClientId(1)]);
    }

    #[test]
    fn settings_resolve_from_config() {
        let config = DriverConfig {
            fidelity: "high".to_owned(),
            ..DriverConfig::default()
        };
        let settings = DriverSettings::from_config(&config).unwrap();
        assert_eq!(settings.fidelity_mode, FidelityMode::Locked(Fidelity::High));
        assert_eq!(settings.storage_interval, Duration::from_millis(30_000));
    }
}
