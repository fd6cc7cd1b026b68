//! Security layer
//!
//! Implements the cryptographic pieces of the transport:
//! - AES-256-GCM AEAD with header fields bound as associated data
//! - Pre-shared key handling
//! - Anti-replay protection

pub mod aead;
pub mod keys;
pub mod replay;

pub use aead::{construct_aad, decrypt, encrypt, generate_nonce};
pub use keys::PreSharedKey;
pub use replay::{ReplayConfig, ReplayGuard, ReplayScope, ReplayWindow};
