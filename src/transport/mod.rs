//! Transport layer
//!
//! This module provides:
//!
//! - **Packet encoding/decoding**: [`Packet`] and the fixed wire layout
//! - **Outstanding-packet ledger**: [`OutstandingLedger`] tracking unacknowledged packets
//! - **Async sockets**: [`DatagramSocket`] wrapper for tokio UDP
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Sender / Receiver engines        │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   packets, ledger, sockets              │
//! ├─────────────────────────────────────────┤
//! │         Crypto Layer                    │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod ledger;
mod packet;
mod socket;

pub use ledger::{DueBatch, OutstandingLedger, OutstandingPacket};
pub use packet::{Packet, decode, encode};
pub use socket::DatagramSocket;
