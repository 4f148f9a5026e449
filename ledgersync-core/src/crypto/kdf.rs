//! Password stretching for ledger keys.
//!
//! A ledger password is stretched once with Argon2id and the output is split
//! with HKDF-SHA256 into two independent values:
//! - the message encryption key (never persisted)
//! - the verifier stored in the key record, used by `key-test`

use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MESSAGE_KEY_INFO: &[u8] = b"ledgersync-message-key-v1";
const VERIFIER_INFO: &[u8] = b"ledgersync-verifier-v1";

/// Lowest accepted memory cost (8 MiB).
pub const MIN_MEM_COST_KIB: u32 = 8 * 1024;

/// Parameters for Argon2id key derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Salt for key derivation (16 bytes)
    pub salt: [u8; 16],

    /// Memory cost in KiB (65,536 = 64 MiB)
    pub mem_cost: u32,

    /// Time cost (number of iterations)
    pub time_cost: u32,

    /// Parallelism (number of lanes)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            salt: rand::random(),
            mem_cost: 65_536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Same cost settings with a fresh random salt
    pub fn with_fresh_salt(&self) -> Self {
        Self {
            salt: rand::random(),
            ..self.clone()
        }
    }

    /// Cheapest parameters still accepted by `validate`
    pub fn minimal() -> Self {
        Self {
            salt: rand::random(),
            mem_cost: MIN_MEM_COST_KIB,
            time_cost: 1,
            parallelism: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mem_cost < MIN_MEM_COST_KIB {
            return Err(CryptoError::KdfFailed(
                "Memory cost too low (minimum: 8 MiB)".to_string(),
            ));
        }
        if self.time_cost < 1 {
            return Err(CryptoError::KdfFailed(
                "Time cost too low (minimum: 1)".to_string(),
            ));
        }
        if self.parallelism < 1 {
            return Err(CryptoError::KdfFailed(
                "Parallelism too low (minimum: 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Key material derived from a ledger password
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pub message_key: [u8; 32],
    pub verifier: [u8; 32],
}

/// Stretch `password` and split the result into message key and verifier.
///
/// The verifier info string is bound to `ledger_id`, so a record copied
/// between ledgers never verifies.
pub fn derive_key_material(
    password: &[u8],
    params: &KdfParams,
    ledger_id: &str,
) -> Result<KeyMaterial> {
    params.validate()?;

    let argon_params = Params::new(params.mem_cost, params.time_cost, params.parallelism, Some(32))
        .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut stretched = [0u8; 32];
    argon2
        .hash_password_into(password, &params.salt, &mut stretched)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    let hk = Hkdf::<Sha256>::new(Some(&params.salt), &stretched);
    stretched.zeroize();

    let mut material = KeyMaterial {
        message_key: [0u8; 32],
        verifier: [0u8; 32],
    };
    hk.expand(MESSAGE_KEY_INFO, &mut material.message_key)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;

    let mut verifier_info = VERIFIER_INFO.to_vec();
    verifier_info.extend_from_slice(ledger_id.as_bytes());
    hk.expand(&verifier_info, &mut material.verifier)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;

    Ok(material)
}

/// Constant-time comparison of two verifier tokens
pub fn verify_token(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len() && bool::from(expected.ct_eq(actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_params_default() {
        let params = KdfParams::default();
        assert_eq!(params.mem_cost, 65_536);
        assert_eq!(params.time_cost, 3);
        assert_eq!(params.parallelism, 4);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_kdf_params_validation() {
        let mut params = KdfParams::minimal();
        assert!(params.validate().is_ok());

        params.mem_cost = MIN_MEM_COST_KIB - 1;
        assert!(params.validate().is_err());

        params.mem_cost = MIN_MEM_COST_KIB;
        params.time_cost = 0;
        assert!(params.validate().is_err());

        params.time_cost = 1;
        params.parallelism = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let params = KdfParams::minimal();
        let a = derive_key_material(b"correct horse", &params, "ledger-a").unwrap();
        let b = derive_key_material(b"correct horse", &params, "ledger-a").unwrap();
        assert_eq!(a.message_key, b.message_key);
        assert_eq!(a.verifier, b.verifier);
        assert_ne!(a.message_key, a.verifier);
    }

    #[test]
    fn test_verifier_bound_to_ledger_and_password() {
        let params = KdfParams::minimal();
        let base = derive_key_material(b"pw", &params, "ledger-a").unwrap();
        let other_ledger = derive_key_material(b"pw", &params, "ledger-b").unwrap();
        let other_password = derive_key_material(b"pw2", &params, "ledger-a").unwrap();

        assert_eq!(base.message_key, other_ledger.message_key);
        assert_ne!(base.verifier, other_ledger.verifier);
        assert_ne!(base.verifier, other_password.verifier);
    }

    #[test]
    fn test_fresh_salt_changes_key() {
        let params = KdfParams::minimal();
        let rotated = params.with_fresh_salt();
        assert_eq!(rotated.mem_cost, params.mem_cost);
        assert_ne!(rotated.salt, params.salt);

        let a = derive_key_material(b"pw", &params, "l").unwrap();
        let b = derive_key_material(b"pw", &rotated, "l").unwrap();
        assert_ne!(a.message_key, b.message_key);
    }

    #[test]
    fn test_verify_token() {
        assert!(verify_token(&[1, 2, 3], &[1, 2, 3]));
        assert!(!verify_token(&[1, 2, 3], &[1, 2, 4]));
        assert!(!verify_token(&[1, 2, 3], &[1, 2]));
    }
}
