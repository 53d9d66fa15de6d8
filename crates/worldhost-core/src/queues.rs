//! Per-client inbound and outbound packet queues.
//!
//! [`PacketQueueBridge`] is the only state shared between the network side
//! and the tick loop that does not live behind the simulation lock. Its own
//! mutex guards nothing but the queue map and is held only for the length
//! of a single append, drain, or map update, never while the simulation is
//! running. Network producers and consumers therefore never wait on a tick.
//!
//! Queues exist only for registered clients. Packets pushed for an unknown
//! client are dropped; pulls for an unknown client return nothing.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;
use worldhost_types::{ClientId, Packet};

/// Inbound and outbound packets for one client, oldest first.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientQueues {
    /// Packets received from the client, not yet handed to the simulation.
    pub incoming: Vec<Packet>,
    /// Packets produced by the simulation, not yet pulled by the network.
    pub outgoing: Vec<Packet>,
}

/// Queue map shared between the network layer and the tick loop.
#[derive(Debug, Default)]
pub struct PacketQueueBridge {
    /// Client id to that client's queues.
    queues: Mutex<BTreeMap<ClientId, ClientQueues>>,
}

impl PacketQueueBridge {
    /// Create an empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ClientId, ClientQueues>> {
        // Nothing that can panic runs while this lock is held, but a
        // poisoned map is still structurally valid.
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create empty queues for `client`. Existing queues are kept.
    pub fn register(&self, client: ClientId) {
        self.lock().entry(client).or_default();
    }

    /// Remove `client`'s queues and return whatever was left in them.
    pub fn unregister(&self, client: ClientId) -> ClientQueues {
        self.lock().remove(&client).unwrap_or_default()
    }

    /// Whether queues exist for `client`.
    pub fn is_registered(&self, client: ClientId) -> bool {
        self.lock().contains_key(&client)
    }

    /// Append packets to `client`'s inbound queue.
    ///
    /// Returns `false`, dropping the packets, if the client has no queues.
    pub fn push_incoming(&self, client: ClientId, packets: Vec<Packet>) -> bool {
        let mut queues = self.lock();
        let Some(entry) = queues.get_mut(&client) else {
            drop(queues);
            debug!(client_id = %client, dropped = packets.len(), "Packets for unknown client dropped");
            return false;
        };
        entry.incoming.extend(packets);
        true
    }

    /// Remove and return everything in `client`'s inbound queue.
    pub fn take_incoming(&self, client: ClientId) -> Vec<Packet> {
        self.lock()
            .get_mut(&client)
            .map(|entry| std::mem::take(&mut entry.incoming))
            .unwrap_or_default()
    }

    /// Append packets to `client`'s outbound queue.
    ///
    /// Returns `false`, dropping the packets, if the client has no queues.
    pub fn push_outgoing(&self, client: ClientId, packets: Vec<Packet>) -> bool {
        if packets.is_empty() {
            return self.is_registered(client);
        }
        let mut queues = self.lock();
        let Some(entry) = queues.get_mut(&client) else {
            drop(queues);
            debug!(client_id = %client, dropped = packets.len(), "Outbound packets for unknown client dropped");
            return false;
        };
        entry.outgoing.extend(packets);
        true
    }

    /// Remove and return everything in `client`'s outbound queue.
    ///
    /// The queue is emptied under a single lock acquisition, so concurrent
    /// pulls never split or duplicate a batch.
    pub fn take_outgoing(&self, client: ClientId) -> Vec<Packet> {
        self.lock()
            .get_mut(&client)
            .map(|entry| std::mem::take(&mut entry.outgoing))
            .unwrap_or_default()
    }
}
