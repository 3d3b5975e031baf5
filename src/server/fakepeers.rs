//! In-memory `PeerApi` used by unit tests in place of real sockets.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::server::{
    MessageId, NodeInfo, PeerApi, RetrieveOutcome, StoreAck,
};
use crate::utils::FamstoreError;

use async_trait::async_trait;

/// Behavior and state of one fake peer.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakePeer {
    /// Unreachable peers fail every call at the transport level.
    pub(crate) down: bool,

    /// Answer `Store` with `success = false`.
    pub(crate) reject_store: bool,

    /// Answer `Retrieve` with this outcome instead of looking at `blobs`.
    pub(crate) retrieve_override: Option<RetrieveOutcome>,

    /// Membership view returned by `Join`/`GetView`.
    pub(crate) view: Vec<NodeInfo>,

    /// Replica copies held.
    pub(crate) blobs: HashMap<MessageId, String>,
}

/// A set of fake peers keyed by identity, plus a log of calls made.
#[derive(Debug, Default)]
pub(crate) struct FakePeers {
    peers: Mutex<HashMap<NodeInfo, FakePeer>>,
    calls: Mutex<Vec<(String, NodeInfo)>>,
}

impl FakePeers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, node: NodeInfo, peer: FakePeer) {
        self.peers.lock().unwrap().insert(node, peer);
    }

    pub(crate) fn update(&self, node: &NodeInfo, f: impl FnOnce(&mut FakePeer)) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(node) {
            f(peer);
        }
    }

    pub(crate) fn blob(&self, node: &NodeInfo, id: MessageId) -> Option<String> {
        self.peers
            .lock()
            .unwrap()
            .get(node)
            .and_then(|peer| peer.blobs.get(&id).cloned())
    }

    /// Calls made so far, as `(operation, target)` pairs in order.
    pub(crate) fn calls(&self) -> Vec<(String, NodeInfo)> {
        self.calls.lock().unwrap().clone()
    }

    fn reach(
        &self,
        op: &str,
        target: &NodeInfo,
    ) -> Result<FakePeer, FamstoreError> {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), target.clone()));
        match self.peers.lock().unwrap().get(target) {
            Some(peer) if !peer.down => Ok(peer.clone()),
            _ => Err(FamstoreError::msg(format!("{} unreachable", target))),
        }
    }
}

#[async_trait]
impl PeerApi for FakePeers {
    async fn join(
        &self,
        target: &NodeInfo,
        me: &NodeInfo,
    ) -> Result<Vec<NodeInfo>, FamstoreError> {
        let mut view = self.reach("join", target)?.view;
        if !view.contains(me) {
            view.push(me.clone());
        }
        Ok(view)
    }

    async fn get_view(
        &self,
        target: &NodeInfo,
    ) -> Result<Vec<NodeInfo>, FamstoreError> {
        Ok(self.reach("get_view", target)?.view)
    }

    async fn store(
        &self,
        target: &NodeInfo,
        id: MessageId,
        text: &str,
    ) -> Result<StoreAck, FamstoreError> {
        if self.reach("store", target)?.reject_store {
            return Ok(StoreAck {
                success: false,
                message: "disk full".into(),
            });
        }
        self.update(target, |peer| {
            peer.blobs.insert(id, text.to_string());
        });
        Ok(StoreAck {
            success: true,
            message: "stored".into(),
        })
    }

    async fn retrieve(
        &self,
        target: &NodeInfo,
        id: MessageId,
    ) -> Result<RetrieveOutcome, FamstoreError> {
        let peer = self.reach("retrieve", target)?;
        if let Some(outcome) = peer.retrieve_override {
            return Ok(outcome);
        }
        Ok(match peer.blobs.get(&id) {
            Some(text) => RetrieveOutcome::Found(text.clone()),
            None => RetrieveOutcome::NotFound,
        })
    }
}
