use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::gauge;
use tidepool_proto::SignalingMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The relay's handle to one live WebSocket connection. Clones share the
/// connection's outbound queue; equality is by connection.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    connection_id: Uuid,
    remote_addr: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl PeerHandle {
    pub fn channel(
        remote_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            connection_id: Uuid::new_v4(),
            remote_addr,
            tx,
        };
        (handle, rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Queue a frame for this connection's writer. Hands the frame back
    /// when the connection has already gone away.
    pub fn send(&self, message: SignalingMessage) -> Result<(), SignalingMessage> {
        self.tx.send(message).map_err(|err| err.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn same_connection(&self, other: &PeerHandle) -> bool {
        self.connection_id == other.connection_id
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_connection(other)
    }
}

impl Eq for PeerHandle {}

/// Endpoint identifier → live connection.
///
/// At most one connection per identifier; a later `register` for the same
/// identifier replaces the earlier one. `remove` only deletes entries that
/// still point at the closing connection, so a reconnect that registered
/// first is never undone by its predecessor's late disconnect.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<DashMap<String, PeerHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the superseded connection, if any.
    pub fn register(&self, endpoint_id: impl Into<String>, peer: PeerHandle) -> Option<PeerHandle> {
        let previous = self.entries.insert(endpoint_id.into(), peer);
        self.record_size();
        previous
    }

    pub fn lookup(&self, endpoint_id: &str) -> Option<PeerHandle> {
        self.entries
            .get(endpoint_id)
            .map(|entry| entry.value().clone())
    }

    /// Drop every identifier still bound to `peer`; returns the identifiers removed.
    pub fn remove(&self, peer: &PeerHandle) -> Vec<String> {
        // Collect before mutating so no shard guard is held across remove_if.
        let candidates = self.endpoints_of(peer);
        let removed: Vec<String> = candidates
            .into_iter()
            .filter(|id| {
                self.entries
                    .remove_if(id, |_, current| current.same_connection(peer))
                    .is_some()
            })
            .collect();
        if !removed.is_empty() {
            self.record_size();
        }
        removed
    }

    /// Identifiers currently bound to `peer`.
    pub fn endpoints_of(&self, peer: &PeerHandle) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.value().same_connection(peer))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every registered connection except the originator's, one entry per
    /// connection even when it signed in under several identifiers.
    pub fn broadcast_targets(&self, origin: &PeerHandle, origin_id: &str) -> Vec<(String, PeerHandle)> {
        let mut seen = HashSet::new();
        let mut targets: Vec<(String, PeerHandle)> = self
            .entries
            .iter()
            .filter(|entry| entry.key() != origin_id && !entry.value().same_connection(origin))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets.retain(|(_, peer)| seen.insert(peer.connection_id()));
        targets
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record_size(&self) {
        gauge!("tidepool_relay_endpoints_registered", self.entries.len() as f64);
    }
}
