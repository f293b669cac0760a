// Replicated state owned by a room: the document plus its awareness table.
//
// The relay never merges edits or interprets presence itself; it hands
// payloads to a `Replica` and relays whatever the replica says changed.

mod ydoc;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

pub use ydoc::{YrsReplica, CELLS_MAP_NAME};

/// Awareness client identifier as published by a peer.
pub type ClientId = u64;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("failed to apply document update: {0}")]
    Apply(String),

    #[error("awareness operation failed: {0}")]
    Awareness(String),
}

/// Result of applying one SYNC payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// SYNC payload to relay to every other member of the room.
    pub update: Option<Vec<u8>>,
    /// SYNC payload meant only for the sender.
    pub reply: Option<Vec<u8>>,
}

/// Client ids touched by one applied awareness update.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Ids whose state is present after the update.
    pub fn present(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.added.iter().chain(self.updated.iter()).copied()
    }

    pub fn all_changes(&self) -> Vec<ClientId> {
        self.present().chain(self.removed.iter().copied()).collect()
    }
}

pub trait Replica: Send {
    /// SYNC payload asking a newly joined peer for what the room is missing.
    fn handshake(&self) -> Vec<u8>;

    fn apply_sync(&mut self, payload: &[u8]) -> Result<SyncOutcome, ReplicaError>;

    /// Applies a length-prefixed awareness update. Stale updates yield an empty change.
    fn apply_awareness(&mut self, payload: &[u8]) -> Result<AwarenessChange, ReplicaError>;

    /// Length-prefixed awareness update covering `clients`, including removals.
    fn encode_awareness(&self, clients: &[ClientId]) -> Result<Vec<u8>, ReplicaError>;

    /// Ids that currently have a presence state.
    fn awareness_clients(&self) -> Vec<ClientId>;

    /// Drops presence for `clients`; returns the ids that actually had state.
    fn remove_awareness(&mut self, clients: &[ClientId]) -> Vec<ClientId>;

    /// Raw presence payloads, sorted by client id.
    fn presence(&self) -> Vec<(ClientId, String)>;

    /// Current cell contents of the grid document.
    fn cells(&self) -> BTreeMap<String, String>;
}

pub type ReplicaFactory = Arc<dyn Fn() -> Box<dyn Replica> + Send + Sync>;

pub fn yrs_factory() -> ReplicaFactory {
    Arc::new(|| Box::new(YrsReplica::new()) as Box<dyn Replica>)
}
