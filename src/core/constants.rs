//! Protocol constants for the secure datagram transport.
//!
//! Wire sizes are fixed by the packet format and MUST NOT be changed without
//! breaking interoperability with existing peers.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// AES-256-GCM key size.
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size.
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Associated data size (kind + sequence + timestamp).
pub const AAD_SIZE: usize = 1 + SEQUENCE_SIZE + TIMESTAMP_SIZE;

/// Environment variable consulted by [`PreSharedKey::from_default_env`](crate::crypto::PreSharedKey::from_default_env).
pub const DEFAULT_KEY_ENV: &str = "SECURE_UDP_KEY";

// =============================================================================
// PACKET KINDS (authenticated, never on the wire)
// =============================================================================

/// Application data packet.
pub const PACKET_KIND_DATA: u8 = 0x01;

/// Acknowledgment packet (extension).
pub const PACKET_KIND_ACK: u8 = 0x02;

// =============================================================================
// WIRE SIZES
// =============================================================================

/// Sequence number field (u32 LE).
pub const SEQUENCE_SIZE: usize = 4;

/// Timestamp field (u64 LE, milliseconds).
pub const TIMESTAMP_SIZE: usize = 8;

/// Cleartext header (sequence + timestamp + nonce).
pub const HEADER_SIZE: usize = SEQUENCE_SIZE + TIMESTAMP_SIZE + NONCE_SIZE;

/// Minimum packet size (header + empty payload + tag).
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + TAG_SIZE;

/// Largest UDP payload over IPv4 (65535 - 8 UDP - 20 IP).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest application payload that still fits in one datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - MIN_PACKET_SIZE;

/// Default receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65_535;

/// Default UDP port used by both engines.
pub const DEFAULT_PORT: u16 = 9000;

/// Capacity of the delivery channel returned by `start_channel` helpers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// TIMING
// =============================================================================

/// Interval between retransmissions of an unacknowledged packet.
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// ANTI-REPLAY
// =============================================================================

/// Replay window size in sequence numbers.
pub const REPLAY_WINDOW_SIZE: usize = 1024;

/// Maximum number of distinct sources tracked by a receiver.
pub const DEFAULT_MAX_PEERS: usize = 1024;
