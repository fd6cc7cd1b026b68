//! Sender engine
//!
//! High-level API for sealing messages and retransmitting them until they
//! are acknowledged or the sender stops.

#[allow(clippy::module_inception)]
mod sender;

pub use sender::*;
