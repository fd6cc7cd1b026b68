//! Protocol extensions
//!
//! Optional behaviour layered over the core framing. Compiled with the
//! `extensions` feature (on by default); each extension is also disabled at
//! runtime until both engines opt in through their builders.
//!
//! | AAD kind | Module | Description                                    |
//! |----------|--------|------------------------------------------------|
//! | 0x02     | `ack`  | Receiver acknowledgments, stop retransmission  |

mod ack;

pub use ack::*;
