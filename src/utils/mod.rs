//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod schedule;

pub use error::FamstoreError;
pub use print::logger_init;
pub use safetcp::{tcp_bind, tcp_bind_first_free};
pub use schedule::PeriodicJob;

pub(crate) use safetcp::{read_frame, write_frame};
