//! AES-256-GCM sealing with associated data.
//!
//! Uses AES-256-GCM with:
//! - 256-bit key
//! - 96-bit (12 byte) random nonce per call
//! - 128-bit authentication tag, kept separately from the ciphertext

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Sealed bytes with their nonce and authentication tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_LEN],
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
pub fn encrypt_with_aad(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<EncryptedBlob> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot encrypt empty data".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut sealed = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    if sealed.len() < TAG_LEN {
        return Err(CryptoError::EncryptionFailed(
            "Ciphertext too short - missing auth tag".to_string(),
        ));
    }

    let tag_start = sealed.len() - TAG_LEN;
    let auth_tag: [u8; TAG_LEN] = sealed[tag_start..]
        .try_into()
        .map_err(|_| CryptoError::EncryptionFailed("Invalid auth tag length".to_string()))?;
    sealed.truncate(tag_start);

    Ok(EncryptedBlob {
        nonce: nonce.into(),
        ciphertext: sealed,
        auth_tag,
    })
}

/// Decrypt a blob produced by [`encrypt_with_aad`] with the same `aad`.
///
/// Any change to the ciphertext, tag, nonce or associated data yields
/// `CryptoError::AuthenticationFailed`.
pub fn decrypt_with_aad(key: &[u8; 32], blob: &EncryptedBlob, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&blob.nonce);

    let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&blob.ciphertext);
    sealed.extend_from_slice(&blob.auth_tag);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
