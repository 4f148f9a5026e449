//! Relay storage model types.

use ed25519_dalek::VerifyingKey;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StoredDevice {
    pub device_id: String,
    pub ledger_id: String,
    pub device_name: String,
    #[serde(skip)]
    pub public_key: Vec<u8>,
    pub registered_at: i64,
    pub revoked: bool,
    pub revoked_at: Option<i64>,
}

impl StoredDevice {
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        let bytes: [u8; 32] = self.public_key.as_slice().try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }
}

/// The authenticated caller, attached to requests by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthedDevice {
    pub device_id: String,
    pub ledger_id: String,
}
