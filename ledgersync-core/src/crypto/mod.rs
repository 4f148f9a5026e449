//! Cryptographic primitives for ledger encryption.
//!
//! This module provides:
//! - Argon2id password stretching and HKDF key separation
//! - AES-256-GCM sealing with associated data
//! - The per-ledger key manager and its verifier records

pub mod cipher;
pub mod kdf;
pub mod keyring;

pub use cipher::{decrypt_with_aad, encrypt_with_aad, EncryptedBlob};
pub use kdf::{derive_key_material, verify_token, KdfParams, KeyMaterial};
pub use keyring::{KeyManager, KeyRecord, LedgerKey};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
