//! Packet encoding and decoding.
//!
//! Wire format (little-endian fixed-width fields):
//! ```text
//! +-----------+-------------+----------+----------------+----------+
//! | Sequence  | Timestamp   | Nonce    | Ciphertext     | Tag      |
//! | 4 (LE32)  | 8 (LE64 ms) | 12 bytes | N bytes        | 16 bytes |
//! +-----------+-------------+----------+----------------+----------+
//! ```
//!
//! Sequence and timestamp travel in cleartext but are authenticated: they are
//! part of the AAD passed to the cipher, together with a packet kind that
//! separates data packets from acknowledgments.

use crate::core::{
    CryptoError, HEADER_SIZE, MIN_PACKET_SIZE, NONCE_SIZE, PACKET_KIND_DATA, PacketError,
    SEQUENCE_SIZE, TAG_SIZE, TIMESTAMP_SIZE,
};
use crate::crypto::{PreSharedKey, aead};

/// A complete sealed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Per-sender sequence number (wraps at 2^32).
    pub sequence: u32,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: u64,
    /// Per-packet AEAD nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Encrypted payload.
    pub ciphertext: Vec<u8>,
    /// AEAD authentication tag.
    pub tag: [u8; TAG_SIZE],
}

impl Packet {
    /// Encrypt `plaintext` into a data packet with a fresh random nonce.
    pub fn seal(
        key: &PreSharedKey,
        sequence: u32,
        timestamp: u64,
        plaintext: &[u8],
    ) -> Result<Self, CryptoError> {
        Self::seal_kind(key, PACKET_KIND_DATA, sequence, timestamp, plaintext)
    }

    /// Encrypt `plaintext` with an explicit packet kind bound into the AAD.
    pub fn seal_kind(
        key: &PreSharedKey,
        kind: u8,
        sequence: u32,
        timestamp: u64,
        plaintext: &[u8],
    ) -> Result<Self, CryptoError> {
        let nonce = aead::generate_nonce();
        let aad = aead::construct_aad(kind, sequence, timestamp);
        let (ciphertext, tag) = aead::encrypt(key, &nonce, &aad, plaintext)?;

        Ok(Self {
            sequence,
            timestamp,
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Verify and decrypt a data packet.
    pub fn open(&self, key: &PreSharedKey) -> Result<Vec<u8>, CryptoError> {
        self.open_kind(key, PACKET_KIND_DATA)
    }

    /// Verify and decrypt a packet of the given kind.
    pub fn open_kind(&self, key: &PreSharedKey, kind: u8) -> Result<Vec<u8>, CryptoError> {
        let aad = aead::construct_aad(kind, self.sequence, self.timestamp);
        aead::decrypt(key, &self.nonce, &aad, &self.ciphertext, &self.tag)
    }

    /// Total encoded length.
    pub fn encoded_len(&self) -> usize {
        MIN_PACKET_SIZE + self.ciphertext.len()
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        encode(
            self.sequence,
            self.timestamp,
            &self.nonce,
            &self.ciphertext,
            &self.tag,
        )
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        decode(bytes)
    }
}

/// Serialize packet fields to wire bytes.
///
/// Total length is `40 + ciphertext.len()`.
pub fn encode(
    sequence: u32,
    timestamp: u64,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_PACKET_SIZE + ciphertext.len());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(ciphertext);
    buf.extend_from_slice(tag);
    buf
}

/// Parse wire bytes into packet fields.
///
/// The ciphertext length is derived as `len - 40`.
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
    if bytes.len() < MIN_PACKET_SIZE {
        return Err(PacketError::TooShort {
            expected: MIN_PACKET_SIZE,
            actual: bytes.len(),
        });
    }

    let (header, rest) = bytes.split_at(HEADER_SIZE);
    let (ciphertext, tag_bytes) = rest.split_at(rest.len() - TAG_SIZE);

    let mut sequence = [0u8; SEQUENCE_SIZE];
    sequence.copy_from_slice(&header[..SEQUENCE_SIZE]);

    let mut timestamp = [0u8; TIMESTAMP_SIZE];
    timestamp.copy_from_slice(&header[SEQUENCE_SIZE..SEQUENCE_SIZE + TIMESTAMP_SIZE]);

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&header[SEQUENCE_SIZE + TIMESTAMP_SIZE..]);

    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(tag_bytes);

    Ok(Packet {
        sequence: u32::from_le_bytes(sequence),
        timestamp: u64::from_le_bytes(timestamp),
        nonce,
        ciphertext: ciphertext.to_vec(),
        tag,
    })
}
