//! The one error type shared by every famstore module.
//!
//! Errors are plain messages. Expected outcomes such as a missing blob or an
//! unknown message ID are never errors; they come back as `Option`s. What
//! does end up here is surfaced to clients as `ERROR <message>` by the
//! leader, so the message text is what a user of the line protocol sees.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Error carried through storage, ledger, peer RPC and node setup paths.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FamstoreError(pub(crate) String);

impl FamstoreError {
    /// Wraps anything displayable, e.g. a literal or a formatted string.
    pub fn msg(msg: impl ToString) -> Self {
        FamstoreError(msg.to_string())
    }
}

impl fmt::Display for FamstoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for FamstoreError {}

// Lets `?` lift I/O, codec, config and runtime errors straight into a
// `FamstoreError` carrying their message.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for FamstoreError {
            fn from(e: $error) -> Self {
                FamstoreError(e.to_string())
            }
        }
    };
}

// Channel send errors are generic over the unsent payload, which is dropped.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for FamstoreError {
            fn from(e: $error) -> FamstoreError {
                FamstoreError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = FamstoreError::msg("no such family member");
        assert_eq!(format!("{}", e), "no such family member");
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "disk!");
        let e = FamstoreError::from(io_error);
        assert!(e.0.contains("disk!"));
    }

    #[test]
    fn from_closed_channel() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u32>();
        drop(rx);
        let e: FamstoreError = tx.send(7).unwrap_err().into();
        assert!(e.to_string().contains("closed"));
    }

    #[test]
    fn from_parse_error() {
        let e: FamstoreError = "12x".parse::<i32>().unwrap_err().into();
        assert!(e.to_string().contains("invalid digit"));
    }
}
