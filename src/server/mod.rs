//! Famstore's family member functionality modules.

mod registry;
mod storage;
mod selector;
mod ledger;
mod transport;
mod discovery;
mod detector;
mod status;
mod leader;
mod node;

#[cfg(test)]
pub(crate) mod fakepeers;

pub use registry::{FamilyRegistry, NodeInfo};
pub use storage::{CommitStrategy, MessageId, StorageEngine};
pub use selector::ReplicaSelector;
pub use ledger::{LocationLedger, ReplayStats};
pub use transport::{
    PeerApi, PeerReply, PeerRequest, PeerServer, RetrieveOutcome, StoreAck,
    TcpPeerApi,
};
pub use discovery::join_family;
pub use detector::FailureDetector;
pub use status::StatusReporter;
pub use leader::{ControlCommand, ControlReply, ControlServer, LeaderCore};
pub use node::{FamilyNode, NodeConfig};
