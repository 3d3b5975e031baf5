//! Public interface to the Famstore core library, linked by the node and
//! client executables.

#[macro_use]
mod utils;

pub mod client;
pub mod server;

// Helper utilities, macros, and structs.
pub use crate::utils::{
    logger_init, tcp_bind, tcp_bind_first_free, FamstoreError, PeriodicJob,
};

// Family member and client side modules.
pub use crate::client::ControlClient;
pub use crate::server::{
    CommitStrategy, ControlReply, FamilyNode, MessageId, NodeConfig, NodeInfo,
};
