// Replica backed by a yrs document and y-protocols awareness table.

use std::collections::BTreeMap;

use gridsync_common::protocol::{decode_var_buf, encode_var_buf};
use tokio::sync::mpsc;
use yrs::sync::{Awareness, AwarenessUpdate, DefaultProtocol, Protocol, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{merge_updates_v1, Doc, Map, ReadTxn, Transact, Update};

use super::{AwarenessChange, ClientId, Replica, ReplicaError, SyncOutcome};

/// Root map holding cell values keyed by `"{row}-{col}"`.
pub const CELLS_MAP_NAME: &str = "spreadsheet";

// v1 encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

pub struct YrsReplica {
    awareness: Awareness,
    protocol: DefaultProtocol,
}

impl YrsReplica {
    pub fn new() -> Self {
        Self::with_doc(Doc::new())
    }

    pub fn with_doc(doc: Doc) -> Self {
        Self { awareness: Awareness::new(doc), protocol: DefaultProtocol }
    }

    /// Apply `update` and return what it actually added to the document,
    /// or `None` when everything in it was already known.
    ///
    /// Updates whose dependencies are missing are held back by yrs and come
    /// out in a later delta once they integrate.
    fn integrate(&self, update: Update) -> Result<Option<Vec<u8>>, ReplicaError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self
            .awareness
            .doc()
            .observe_update_v1(move |_, event| {
                let _ = tx.send(event.update.clone());
            })
            .map_err(|error| ReplicaError::Apply(error.to_string()))?;

        let applied = self.protocol.handle_update(&self.awareness, update);
        drop(subscription);
        applied.map_err(|error| ReplicaError::Apply(error.to_string()))?;

        let mut deltas = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            deltas.push(delta);
        }

        match deltas.len() {
            0 => Ok(None),
            1 => Ok(deltas.pop()),
            _ => merge_updates_v1(&deltas)
                .map(Some)
                .map_err(|error| ReplicaError::Apply(error.to_string())),
        }
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for YrsReplica {
    fn handshake(&self) -> Vec<u8> {
        let state_vector = self.awareness.doc().transact().state_vector();
        SyncMessage::SyncStep1(state_vector).encode_v1()
    }

    fn apply_sync(&mut self, payload: &[u8]) -> Result<SyncOutcome, ReplicaError> {
        let message = SyncMessage::decode_v1(payload)
            .map_err(|error| ReplicaError::Malformed(error.to_string()))?;

        match message {
            SyncMessage::SyncStep1(state_vector) => {
                let diff = self.awareness.doc().transact().encode_state_as_update_v1(&state_vector);
                Ok(SyncOutcome {
                    update: None,
                    reply: Some(SyncMessage::SyncStep2(diff).encode_v1()),
                })
            }
            // Step-2 carries the peer's missing updates; fan it out like any other update.
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                if update == EMPTY_UPDATE_V1 {
                    return Ok(SyncOutcome::default());
                }

                let decoded = Update::decode_v1(&update)
                    .map_err(|error| ReplicaError::Malformed(error.to_string()))?;
                let Some(delta) = self.integrate(decoded)? else {
                    return Ok(SyncOutcome::default());
                };

                Ok(SyncOutcome { update: Some(SyncMessage::Update(delta).encode_v1()), reply: None })
            }
        }
    }

    fn apply_awareness(&mut self, payload: &[u8]) -> Result<AwarenessChange, ReplicaError> {
        let encoded =
            decode_var_buf(payload).map_err(|error| ReplicaError::Malformed(error.to_string()))?;
        let update = AwarenessUpdate::decode_v1(encoded)
            .map_err(|error| ReplicaError::Malformed(error.to_string()))?;

        let summary = self
            .awareness
            .apply_update_summary(update)
            .map_err(|error| ReplicaError::Awareness(error.to_string()))?;

        Ok(summary
            .map(|summary| AwarenessChange {
                added: summary.added,
                updated: summary.updated,
                removed: summary.removed,
            })
            .unwrap_or_default())
    }

    fn encode_awareness(&self, clients: &[ClientId]) -> Result<Vec<u8>, ReplicaError> {
        let update = self
            .awareness
            .update_with_clients(clients.to_vec())
            .map_err(|error| ReplicaError::Awareness(error.to_string()))?;
        Ok(encode_var_buf(&update.encode_v1()))
    }

    fn awareness_clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self
            .awareness
            .iter()
            .filter(|(_, state)| state.data.is_some())
            .map(|(client_id, _)| client_id)
            .collect();
        clients.sort_unstable();
        clients
    }

    fn remove_awareness(&mut self, clients: &[ClientId]) -> Vec<ClientId> {
        let present = self.awareness_clients();
        let mut removed = Vec::new();
        for client_id in clients {
            if present.binary_search(client_id).is_ok() {
                self.awareness.remove_state(*client_id);
                removed.push(*client_id);
            }
        }
        removed
    }

    fn presence(&self) -> Vec<(ClientId, String)> {
        let mut peers: Vec<(ClientId, String)> = self
            .awareness
            .iter()
            .filter_map(|(client_id, state)| {
                let raw = state.data.as_ref()?;
                Some((client_id, raw.to_string()))
            })
            .collect();
        peers.sort_by_key(|(client_id, _)| *client_id);
        peers
    }

    fn cells(&self) -> BTreeMap<String, String> {
        let txn = self.awareness.doc().transact();
        let Some(cells) = txn.get_map(CELLS_MAP_NAME) else {
            return BTreeMap::new();
        };

        cells.iter(&txn).map(|(key, value)| (key.to_string(), value.to_string(&txn))).collect()
    }
}
