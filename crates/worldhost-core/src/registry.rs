//! The driver's view of which clients are attached.
//!
//! The simulation keeps its own client set. The two agree except when the
//! simulation drops a client on its own, typically after a fault while
//! handling that client's packets. [`ClientRegistry::errored`] reports the
//! clients the driver still believes are attached but the simulation no
//! longer knows.

use std::collections::BTreeSet;

use worldhost_types::ClientId;

/// Set of clients the driver has registered with the simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientRegistry {
    /// Registered clients.
    clients: BTreeSet<ClientId>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            clients: BTreeSet::new(),
        }
    }

    /// Record `client` as attached. Returns `false` if it already was.
    pub fn insert(&mut self, client: ClientId) -> bool {
        self.clients.insert(client)
    }

    /// Forget `client`. Returns `false` if it was not attached.
    pub fn remove(&mut self, client: ClientId) -> bool {
        self.clients.remove(&client)
    }

    /// Whether `client` is attached.
    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains(&client)
    }

    /// Attached clients, in id order.
    pub fn snapshot(&self) -> Vec<ClientId> {
        self.clients.iter().copied().collect()
    }

    /// Clients attached here but missing from `known_to_simulation`.
    pub fn errored(&self, known_to_simulation: &[ClientId]) -> Vec<ClientId> {
        let known: BTreeSet<ClientId> = known_to_simulation.iter().copied().collect();
        self.clients.difference(&known).copied().collect()
    }
}
