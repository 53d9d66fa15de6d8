//! Synthetic network traffic.
//!
//! Stands in for the session layer: a single thread that, every few
//! milliseconds, pushes a random handful of packets to each attached client
//! of each world and pulls whatever the worlds produced. Packets carry the
//! client id and a per-client sequence number so echoes can be matched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use worldhost_core::driver::WorldDriver;
use worldhost_types::{ClientId, Packet, WorldId};

use crate::error::HostError;

/// Most packets pushed to one client in one round.
const MAX_BURST: u32 = 3;

/// Totals gathered by the traffic thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    /// Packets pushed into worlds.
    pub sent: u64,
    /// Packets pulled back out.
    pub received: u64,
    /// Pushes dropped because the client had been detached.
    pub dropped: u64,
}

/// Handle to a running traffic thread.
pub struct Traffic {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<TrafficTotals>,
}

impl Traffic {
    /// Start generating traffic for `worlds`, one round per `round`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Traffic`] if the thread could not be spawned.
    pub fn start(worlds: Vec<Arc<WorldDriver>>, round: Duration) -> Result<Self, HostError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("traffic".to_owned())
            .spawn(move || run(&worlds, round, &flag))
            .map_err(|e| HostError::Traffic {
                message: format!("failed to spawn traffic thread: {e}"),
            })?;
        Ok(Self { stop, handle })
    }

    /// Stop the thread and return its totals.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Traffic`] if the thread panicked.
    pub fn finish(self) -> Result<TrafficTotals, HostError> {
        self.stop.store(true, Ordering::Release);
        self.handle.join().map_err(|payload| HostError::Traffic {
            message: format!("traffic thread panicked: {payload:?}"),
        })
    }
}

fn run(worlds: &[Arc<WorldDriver>], round: Duration, stop: &AtomicBool) -> TrafficTotals {
    let mut rng = rand::rng();
    let mut totals = TrafficTotals::default();
    let mut sequence: BTreeMap<(WorldId, ClientId), u32> = BTreeMap::new();

    while !stop.load(Ordering::Acquire) {
        for world in worlds {
            for client in world.clients() {
                let next = sequence.entry((world.world_id(), client)).or_default();
                let burst = rng.random_range(0..=MAX_BURST);
                let packets: Vec<Packet> = (0..burst)
                    .map(|offset| packet(client, next.wrapping_add(offset)))
                    .collect();
                *next = next.wrapping_add(burst);

                let count = u64::from(burst);
                if world.push_incoming(client, packets) {
                    totals.sent = totals.sent.saturating_add(count);
                } else {
                    totals.dropped = totals.dropped.saturating_add(count);
                }

                let pulled = world.pull_outgoing(client);
                let pulled = u64::try_from(pulled.len()).unwrap_or(u64::MAX);
                totals.received = totals.received.saturating_add(pulled);
            }
        }
        thread::sleep(round);
    }

    if totals.dropped > 0 {
        warn!(dropped = totals.dropped, "Traffic for detached clients was dropped");
    }
    debug!(sent = totals.sent, received = totals.received, "Traffic thread finished");
    totals
}

/// Encode a packet as `[client id (2 bytes LE), sequence (4 bytes LE)]`.
fn packet(client: ClientId, sequence: u32) -> Packet {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&client.get().to_le_bytes());
    payload.extend_from_slice(&sequence.to_le_bytes());
    Packet::new(payload)
}
