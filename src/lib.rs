//! # Secure UDP
//!
//! A minimal secure datagram transport. Messages are sealed with AES-256-GCM
//! under a pre-shared key, framed with a sequence number and timestamp, sent
//! over UDP, and retransmitted until acknowledged or the sender stops.
//!
//! - **Confidentiality and integrity**: AES-256-GCM with a fresh random nonce
//!   per packet; sequence and timestamp are bound as associated data
//! - **Replay defense**: sliding window over sequence numbers,
//!   with sender restarts detected through authenticated timestamps
//! - **Retransmission**: a background task resends outstanding packets
//!   verbatim every interval
//! - **Acknowledgments** (optional): receiver ACK frames stop retransmission
//!
//! ## Feature Flags
//!
//! - `extensions` (default): acknowledgment frames
//!
//! ## Modules
//!
//! - [`core`]: Constants, clock and error types
//! - [`crypto`]: AEAD codec, pre-shared keys, replay defense
//! - [`transport`]: Packet codec, outstanding-packet ledger, sockets
//! - [`sender`]: Sender engine
//! - [`receiver`]: Receiver engine
//! - [`extensions`]: Optional protocol extensions
//!
//! ## Wire Format
//!
//! ```text
//! +-----------+-------------+----------+----------------+----------+
//! | Sequence  | Timestamp   | Nonce    | Ciphertext     | Tag      |
//! | 4 (LE32)  | 8 (LE64 ms) | 12 bytes | N bytes        | 16 bytes |
//! +-----------+-------------+----------+----------------+----------+
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use secure_udp::prelude::*;
//!
//! # async fn run() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let key = PreSharedKey::generate();
//!
//! let receiver = ReceiverBuilder::new()
//!     .bind_addr("127.0.0.1:9000".parse()?)
//!     .bind(key.clone())
//!     .await?;
//! let mut messages = receiver.start_channel(64)?;
//!
//! let sender = SenderBuilder::new()
//!     .remote_addr(receiver.local_addr())
//!     .connect(key)
//!     .await?;
//! sender.send(b"ping").await?;
//!
//! if let Some(delivery) = messages.recv().await {
//!     assert_eq!(delivery.payload, b"ping");
//! }
//!
//! sender.stop().await;
//! receiver.stop().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
pub mod crypto;
pub mod receiver;
pub mod sender;
pub mod transport;

// Extensions (feature-gated)
#[cfg(feature = "extensions")]
#[cfg_attr(docsrs, doc(cfg(feature = "extensions")))]
pub mod extensions;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        BoxError, CryptoError, Error, LifecycleError, PacketError, ReceiveError, ReplayError,
        Result, SendError, SocketError,
    };

    pub use crate::crypto::{PreSharedKey, ReplayConfig, ReplayScope};

    pub use crate::receiver::{
        Delivery, ReceiverBuilder, ReceiverConfig, ReceiverState, SecureReceiver,
    };

    pub use crate::sender::{SecureSender, SenderBuilder, SenderConfig};
}

// Re-export commonly used items at crate root
pub use crate::core::{Error, Result};
pub use crate::crypto::PreSharedKey;
pub use crate::receiver::{Delivery, SecureReceiver};
pub use crate::sender::SecureSender;
