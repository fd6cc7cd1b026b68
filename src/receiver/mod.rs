//! Receiver engine
//!
//! High-level API for authenticating, replay-checking and delivering incoming
//! messages.

#[allow(clippy::module_inception)]
mod receiver;

pub use receiver::*;
