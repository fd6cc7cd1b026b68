//! Error types for the secure datagram transport.
//!
//! Receive-path errors are never surfaced past the receive loop: a corrupt,
//! forged or replayed datagram is dropped silently and the loop continues.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Boxed error returned by message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Supplied key length.
        actual: usize,
    },

    /// Key material could not be decoded.
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// No key was found in the configured source.
    #[error("missing key: {0}")]
    MissingKey(String),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD tag verification failed (forged, corrupted or wrong key).
    #[error("AEAD authentication failed")]
    AuthenticationFailed,
}

/// Structurally invalid packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the minimum frame.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Acknowledgment body is not a packet nonce.
    #[error("invalid acknowledgment payload ({actual} bytes)")]
    InvalidAck {
        /// Decrypted body length.
        actual: usize,
    },
}

/// Replay defense verdicts that reject a packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// Sequence already accepted within the window.
    #[error("duplicate sequence {sequence}")]
    Duplicate {
        /// Rejected sequence.
        sequence: u32,
    },

    /// Sequence at or below the window floor with no newer timestamp.
    #[error("sequence {sequence} below replay window")]
    BelowWindow {
        /// Rejected sequence.
        sequence: u32,
    },

    /// Packet sealed before the current run of the sender began.
    #[error("sequence {sequence} is stale")]
    Stale {
        /// Rejected sequence.
        sequence: u32,
    },

    /// Timestamp older than the configured maximum packet age.
    #[error("sequence {sequence} expired ({age_ms} ms old)")]
    Expired {
        /// Rejected sequence.
        sequence: u32,
        /// Age of the packet according to the local clock.
        age_ms: u64,
    },
}

/// Reasons an incoming datagram is dropped.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Frame parsing error.
    #[error("malformed packet: {0}")]
    Malformed(#[from] PacketError),

    /// Decryption or authentication error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Replay defense rejected the packet.
    #[error("replay rejected: {0}")]
    Replay(#[from] ReplayError),
}

impl ReceiveError {
    /// Check if this error should result in a silent drop.
    ///
    /// Every receive-path failure is recovered locally, so this is always
    /// `true`; it exists so callers can assert the policy explicitly.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            ReceiveError::Malformed(_) | ReceiveError::Crypto(_) | ReceiveError::Replay(_)
        )
    }

    /// Check if this error indicates tampering or replay rather than noise.
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            ReceiveError::Crypto(CryptoError::AuthenticationFailed) | ReceiveError::Replay(_)
        )
    }
}

/// Errors returned synchronously by `send()`.
#[derive(Debug, Error)]
pub enum SendError {
    /// Encryption failed; nothing was queued.
    #[error("encryption failed: {0}")]
    Encryption(#[from] CryptoError),

    /// Payload can never fit in a single datagram.
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Largest accepted payload.
        max: usize,
    },

    /// The sender has been stopped.
    #[error("sender stopped")]
    Stopped,
}

/// Errors from the datagram transport.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Failed to bind the local endpoint.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// I/O error on an open socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Misuse of an engine's state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// `start` was already called.
    #[error("already started")]
    AlreadyStarted,

    /// The engine has been stopped.
    #[error("stopped")]
    Stopped,
}

/// Top-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Packet error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Receive error.
    #[error("receive error: {0}")]
    Receive(#[from] ReceiveError),

    /// Send error.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Socket error.
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// Lifecycle error.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Result alias using the top-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_errors_are_silent_drops() {
        let errors = [
            ReceiveError::Malformed(PacketError::TooShort {
                expected: 40,
                actual: 3,
            }),
            ReceiveError::Crypto(CryptoError::AuthenticationFailed),
            ReceiveError::Replay(ReplayError::Duplicate { sequence: 7 }),
        ];
        for err in &errors {
            assert!(err.is_silent_drop(), "{err}");
        }
    }

    #[test]
    fn test_security_errors() {
        assert!(ReceiveError::Crypto(CryptoError::AuthenticationFailed).is_security_error());
        assert!(ReceiveError::Replay(ReplayError::BelowWindow { sequence: 1 }).is_security_error());

        assert!(
            !ReceiveError::Malformed(PacketError::TooShort {
                expected: 40,
                actual: 0
            })
            .is_security_error()
        );
    }

    #[test]
    fn test_error_conversions() {
        let err: Error = SendError::Stopped.into();
        assert!(matches!(err, Error::Send(SendError::Stopped)));

        let err: SendError = CryptoError::EncryptionFailed.into();
        assert!(matches!(err, SendError::Encryption(_)));

        let io = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let err = SocketError::Bind {
            addr: "127.0.0.1:9000".parse().unwrap(),
            source: io,
        };
        assert!(err.to_string().contains("127.0.0.1:9000"));
    }
}
