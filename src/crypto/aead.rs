//! AES-256-GCM AEAD codec
//!
//! Stateless encrypt/decrypt pair operating on detached tags, so the packet
//! codec can place the tag after the ciphertext on the wire.
//!
//! The AAD (Additional Authenticated Data) structure is exactly 13 bytes:
//! - Packet kind (1 byte, not transmitted)
//! - Sequence number (4 bytes, LE32)
//! - Timestamp (8 bytes, LE64)

use aes_gcm::{
    Aes256Gcm, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use rand::{RngCore, rngs::OsRng};

use super::keys::PreSharedKey;
use crate::core::{AAD_SIZE, CryptoError, NONCE_SIZE, TAG_SIZE};

/// Construct AAD (Additional Authenticated Data) for a packet.
///
/// Layout (exactly 13 bytes):
/// ```text
/// [ kind (1) | sequence (4, LE) | timestamp (8, LE) ]
/// ```
pub fn construct_aad(kind: u8, sequence: u32, timestamp: u64) -> [u8; AAD_SIZE] {
    let mut aad = [0u8; AAD_SIZE];

    aad[0] = kind;
    aad[1..5].copy_from_slice(&sequence.to_le_bytes());
    aad[5..13].copy_from_slice(&timestamp.to_le_bytes());

    aad
}

/// Generate a fresh random nonce.
///
/// 96 random bits per packet keep the collision probability negligible for
/// any realistic number of packets under one key.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt plaintext using AES-256-GCM.
///
/// # Arguments
/// * `key` - 32-byte pre-shared key
/// * `nonce` - 12-byte nonce, unique per message under `key`
/// * `aad` - Additional authenticated data
/// * `plaintext` - Data to encrypt
///
/// # Returns
/// `(ciphertext, tag)`, where the ciphertext has the plaintext's length.
pub fn encrypt(
    key: &PreSharedKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE]), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok((buffer, tag_bytes))
}

/// Decrypt ciphertext using AES-256-GCM.
///
/// The tag is verified (constant-time) before any plaintext is produced; on
/// failure the scratch buffer is dropped and nothing is released.
///
/// # Arguments
/// * `key` - 32-byte pre-shared key
/// * `nonce` - 12-byte nonce taken from the packet
/// * `aad` - Additional authenticated data
/// * `ciphertext` - Ciphertext without tag
/// * `tag` - 16-byte GCM tag
pub fn decrypt(
    key: &PreSharedKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{KEY_SIZE, PACKET_KIND_ACK, PACKET_KIND_DATA};

    fn test_key(byte: u8) -> PreSharedKey {
        PreSharedKey::from_bytes([byte; KEY_SIZE])
    }

    #[test]
    fn test_aad_construction() {
        let aad = construct_aad(PACKET_KIND_DATA, 42, 0x0102_0304_0506_0708);

        assert_eq!(aad.len(), AAD_SIZE);
        assert_eq!(aad[0], PACKET_KIND_DATA);
        assert_eq!(&aad[1..5], &42u32.to_le_bytes());
        assert_eq!(&aad[5..13], &0x0102_0304_0506_0708u64.to_le_bytes());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key(0x42);
        let nonce = [0x01; NONCE_SIZE];
        let aad = construct_aad(PACKET_KIND_DATA, 1, 1000);
        let plaintext = b"Hello, secure datagram!";

        let (ciphertext, tag) = encrypt(&key, &nonce, &aad, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext.as_slice(), plaintext.as_slice());

        let decrypted = decrypt(&key, &nonce, &aad, &ciphertext, &tag).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key(0x42);
        let nonce = generate_nonce();
        let aad = construct_aad(PACKET_KIND_DATA, 0, 0);

        let (ciphertext, tag) = encrypt(&key, &nonce, &aad, b"").unwrap();
        assert!(ciphertext.is_empty());

        let decrypted = decrypt(&key, &nonce, &aad, &ciphertext, &tag).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let nonce = generate_nonce();
        let aad = construct_aad(PACKET_KIND_DATA, 1, 1);

        let (ciphertext, tag) = encrypt(&test_key(0x42), &nonce, &aad, b"secret").unwrap();
        let result = decrypt(&test_key(0x43), &nonce, &aad, &ciphertext, &tag);

        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_every_bit_flip_is_rejected() {
        let key = test_key(0x07);
        let nonce = [0x5A; NONCE_SIZE];
        let aad = construct_aad(PACKET_KIND_DATA, 9, 12345);
        let (ciphertext, tag) = encrypt(&key, &nonce, &aad, b"ping").unwrap();

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut corrupted = ciphertext.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(decrypt(&key, &nonce, &aad, &corrupted, &tag).is_err());
            }
        }
        for byte in 0..TAG_SIZE {
            for bit in 0..8 {
                let mut corrupted = tag;
                corrupted[byte] ^= 1 << bit;
                assert!(decrypt(&key, &nonce, &aad, &ciphertext, &corrupted).is_err());
            }
        }
        for byte in 0..NONCE_SIZE {
            for bit in 0..8 {
                let mut corrupted = nonce;
                corrupted[byte] ^= 1 << bit;
                assert!(decrypt(&key, &corrupted, &aad, &ciphertext, &tag).is_err());
            }
        }
        for byte in 0..AAD_SIZE {
            for bit in 0..8 {
                let mut corrupted = aad;
                corrupted[byte] ^= 1 << bit;
                assert!(decrypt(&key, &nonce, &corrupted, &ciphertext, &tag).is_err());
            }
        }
    }

    #[test]
    fn test_kind_separates_data_and_ack() {
        let key = test_key(0x11);
        let nonce = generate_nonce();
        let data_aad = construct_aad(PACKET_KIND_DATA, 3, 99);
        let ack_aad = construct_aad(PACKET_KIND_ACK, 3, 99);

        let (ciphertext, tag) = encrypt(&key, &nonce, &data_aad, b"abc").unwrap();
        assert_eq!(
            decrypt(&key, &nonce, &ack_aad, &ciphertext, &tag),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_generated_nonces_differ() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
