//! Plain data carried between the network layer, the driver, and the
//! simulation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One opaque network message.
///
/// The driver never looks inside a packet; it only preserves the order in
/// which packets were queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Packet {
    /// Encoded message body.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Wrap an encoded message body.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Borrow the encoded body.
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Length of the encoded body in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A point in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate.
    pub x: f32,
    /// Vertical coordinate.
    pub y: f32,
}

impl Position {
    /// Create a position.
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Component-wise sum, used to apply feet offsets.
    #[must_use]
    pub fn offset(self, by: Self) -> Self {
        Self {
            x: self.x + by.x,
            y: self.y + by.y,
        }
    }
}

/// Where a client's player stands, as reported by the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerPlacement {
    /// Position of the player entity.
    pub position: Position,
    /// Offset from the entity position to the player's feet.
    pub feet_offset: Position,
}

impl PlayerPlacement {
    /// Where the player should be revived: the entity position moved to
    /// its feet.
    #[must_use]
    pub fn revive_position(self) -> Position {
        self.position.offset(self.feet_offset)
    }
}

/// Where a client's player should appear when it joins a world.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnTarget {
    /// The world's own default spawn point.
    #[default]
    WorldDefault,
    /// Next to a uniquely named entity.
    UniqueEntity(String),
    /// At an exact position.
    Position(Position),
    /// At a horizontal coordinate, vertical placement chosen by the world.
    X(f32),
}

/// A pending change of world type reported by the simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanetTypeChange {
    /// The new world type name.
    pub planet_type: String,
    /// The new primary biome name.
    pub primary_biome: String,
}

/// Snapshot of a world's stored chunks, keyed by chunk key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorldChunks {
    /// Chunk key to encoded chunk data.
    pub chunks: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl WorldChunks {
    /// Create an empty snapshot.
    pub const fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
        }
    }

    /// Store a chunk, replacing any previous data under the same key.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, data: impl Into<Vec<u8>>) {
        self.chunks.insert(key.into(), data.into());
    }

    /// Look up a chunk by key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.chunks.get(key).map(Vec::as_slice)
    }

    /// Number of chunks in the snapshot.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the snapshot holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
