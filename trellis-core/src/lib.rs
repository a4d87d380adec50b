//! Trellis Core - Shared protocol types
//!
//! This crate contains the wire-level constants, identifier validators, and
//! error envelope shared between the Trellis server (`trellis-server`) and
//! the supervisor reporting channel (`trellis-socket`).

mod ident;
mod protocol;

pub use ident::*;
pub use protocol::*;
