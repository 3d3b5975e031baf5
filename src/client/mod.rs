//! Famstore's client functionality modules.

mod endpoint;

pub use endpoint::ControlClient;
