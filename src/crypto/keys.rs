//! Pre-shared key handling
//!
//! The transport performs no key exchange: both ends are configured with the
//! same 32-byte key, supplied as raw bytes, hex text or an environment variable.

use std::fmt;

use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroize;

use crate::core::{CryptoError, DEFAULT_KEY_ENV, KEY_SIZE};

/// A 256-bit pre-shared symmetric key.
///
/// Zeroized on drop for security. `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct PreSharedKey {
    key: [u8; KEY_SIZE],
}

impl PreSharedKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Create a key from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self { key })
    }

    /// Parse a hex-encoded key (64 hex digits, surrounding whitespace ignored).
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    /// Read a hex-encoded key from the environment variable `name`.
    pub fn from_env(name: &str) -> Result<Self, CryptoError> {
        let mut value = std::env::var(name)
            .map_err(|e| CryptoError::MissingKey(format!("{name}: {e}")))?;
        let key = Self::from_hex(&value);
        value.zeroize();
        key
    }

    /// Read a hex-encoded key from `SECURE_UDP_KEY`.
    pub fn from_default_env() -> Result<Self, CryptoError> {
        Self::from_env(DEFAULT_KEY_ENV)
    }

    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Encode the key as lowercase hex, e.g. for writing a config file.
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PreSharedKey(<redacted>)")
    }
}

impl Drop for PreSharedKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_checks_length() {
        assert!(PreSharedKey::from_slice(&[0u8; KEY_SIZE]).is_ok());
        assert_eq!(
            PreSharedKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: 16
            })
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = PreSharedKey::generate();
        let parsed = PreSharedKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(matches!(
            PreSharedKey::from_hex("not hex"),
            Err(CryptoError::InvalidKeyEncoding(_))
        ));
        assert!(matches!(
            PreSharedKey::from_hex("abcd"),
            Err(CryptoError::InvalidKeyLength { actual: 2, .. })
        ));
    }

    #[test]
    fn test_from_hex_trims_whitespace() {
        let text = format!("  {}\n", "11".repeat(KEY_SIZE));
        let key = PreSharedKey::from_hex(&text).unwrap();
        assert_eq!(key.as_bytes(), &[0x11; KEY_SIZE]);
    }

    #[test]
    fn test_from_env_missing() {
        let result = PreSharedKey::from_env("SECURE_UDP_TEST_KEY_THAT_IS_NEVER_SET");
        assert!(matches!(result, Err(CryptoError::MissingKey(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = PreSharedKey::from_bytes([0xAB; KEY_SIZE]);
        let debug = format!("{key:?}");
        assert!(!debug.contains("ab"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(PreSharedKey::generate(), PreSharedKey::generate());
    }
}
