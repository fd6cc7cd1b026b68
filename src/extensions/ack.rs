//! Acknowledgment frames.
//!
//! An acknowledgment reuses the data packet layout. The header sequence is the
//! acknowledged sequence, the AAD kind is [`PACKET_KIND_ACK`], and the
//! encrypted body is the nonce of the acknowledged data packet. Nonces are
//! random per packet, so an acknowledgment only matches the exact frame it
//! answers: one captured from an earlier run of the sender cannot cancel a
//! new packet that reuses the sequence number.
//!
//! ```text
//! +-----------+-------------+----------+-----------------+----------+
//! | Acked seq | Timestamp   | Nonce    | Enc(acked nonce)| Tag      |
//! | 4 (LE32)  | 8 (LE64 ms) | 12 bytes | 12 bytes        | 16 bytes |
//! +-----------+-------------+----------+-----------------+----------+
//! ```

use crate::core::{
    CryptoError, MIN_PACKET_SIZE, NONCE_SIZE, PACKET_KIND_ACK, PacketError, ReceiveError,
};
use crate::crypto::PreSharedKey;
use crate::transport::Packet;

/// Encoded length of an acknowledgment frame.
pub const ACK_FRAME_SIZE: usize = MIN_PACKET_SIZE + NONCE_SIZE;

/// A verified acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    /// Acknowledged sequence number.
    pub sequence: u32,
    /// Nonce of the acknowledged data packet.
    pub nonce: [u8; NONCE_SIZE],
}

/// Seal an acknowledgment for the data packet `(sequence, nonce)`.
pub fn seal_ack(
    key: &PreSharedKey,
    sequence: u32,
    nonce: &[u8; NONCE_SIZE],
    timestamp: u64,
) -> Result<Vec<u8>, CryptoError> {
    let packet = Packet::seal_kind(key, PACKET_KIND_ACK, sequence, timestamp, nonce)?;
    Ok(packet.encode())
}

/// Verify an acknowledgment frame.
///
/// Data packets fail authentication here because their AAD kind differs.
pub fn open_ack(key: &PreSharedKey, bytes: &[u8]) -> Result<Acknowledgment, ReceiveError> {
    let packet = Packet::decode(bytes)?;
    let body = packet.open_kind(key, PACKET_KIND_ACK)?;

    let nonce: [u8; NONCE_SIZE] = body
        .as_slice()
        .try_into()
        .map_err(|_| PacketError::InvalidAck { actual: body.len() })?;

    Ok(Acknowledgment {
        sequence: packet.sequence,
        nonce,
    })
}
