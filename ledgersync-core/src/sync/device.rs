//! Ed25519 device identity used to sign relay requests.
//!
//! The signing key is stored in `sync_metadata`, sealed under the ledger key
//! so a copied database file does not let anyone impersonate the device.

use crate::crypto::cipher::{NONCE_LEN, TAG_LEN};
use crate::crypto::{decrypt_with_aad, encrypt_with_aad, EncryptedBlob, LedgerKey};
use crate::{DatabaseError, LedgerSyncError, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const SIGNING_KEY_AAD: &[u8] = b"ledgersync-device-key/v1";

/// A device identity: Ed25519 keypair plus the device id it signs for.
pub struct DeviceIdentity {
    pub device_id: Uuid,
    pub device_name: String,
    pub signing_key: SigningKey,
}

impl DeviceIdentity {
    /// Fresh keypair for an existing device id.
    pub fn generate(device_id: Uuid, device_name: &str) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            device_id,
            device_name: device_name.to_string(),
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key().to_bytes().to_vec()
    }

    fn aad(device_id: &Uuid) -> Vec<u8> {
        let mut aad = SIGNING_KEY_AAD.to_vec();
        aad.extend_from_slice(device_id.as_bytes());
        aad
    }

    fn seal(&self, key: &LedgerKey) -> Result<Vec<u8>> {
        let blob = encrypt_with_aad(
            key.as_bytes(),
            &self.signing_key.to_bytes(),
            &Self::aad(&self.device_id),
        )?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + blob.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&blob.nonce);
        sealed.extend_from_slice(&blob.ciphertext);
        sealed.extend_from_slice(&blob.auth_tag);
        Ok(sealed)
    }

    fn unseal(device_id: &Uuid, sealed: &[u8], key: &LedgerKey) -> Result<SigningKey> {
        if sealed.len() <= NONCE_LEN + TAG_LEN {
            return Err(LedgerSyncError::InvalidInput(
                "stored signing key is truncated".to_string(),
            ));
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let blob = EncryptedBlob {
            nonce: nonce.try_into().map_err(|_| {
                LedgerSyncError::InvalidInput("invalid signing key nonce".to_string())
            })?,
            ciphertext: ciphertext.to_vec(),
            auth_tag: tag.try_into().map_err(|_| {
                LedgerSyncError::InvalidInput("invalid signing key tag".to_string())
            })?,
        };
        let bytes = decrypt_with_aad(key.as_bytes(), &blob, &Self::aad(device_id))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| LedgerSyncError::InvalidInput("invalid signing key length".to_string()))?;
        Ok(SigningKey::from_bytes(&secret))
    }

    /// Seal the signing key under `key` and store it on the sync_metadata row.
    pub fn save_to_db(&self, conn: &Connection, key: &LedgerKey) -> Result<()> {
        let sealed = self.seal(key)?;
        let updated = conn
            .execute(
                "UPDATE sync_metadata SET device_signing_key_encrypted = ?1, device_name = ?2
                 WHERE id = 1 AND device_id = ?3",
                params![sealed, self.device_name, self.device_id.to_string()],
            )
            .map_err(DatabaseError::Sqlite)?;
        if updated == 0 {
            return Err(LedgerSyncError::NotFound(format!(
                "sync configuration for device {}",
                self.device_id
            )));
        }
        Ok(())
    }

    /// Load the stored identity. `None` until one has been saved.
    pub fn load_from_db(conn: &Connection, key: &LedgerKey) -> Result<Option<Self>> {
        let row = conn
            .query_row(
                "SELECT device_id, device_name, device_signing_key_encrypted
                 FROM sync_metadata WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        let Some((device_id, device_name, Some(sealed))) = row else {
            return Ok(None);
        };
        let device_id = Uuid::parse_str(&device_id)
            .map_err(|e| DatabaseError::Serialization(format!("invalid device id: {}", e)))?;
        let signing_key = Self::unseal(&device_id, &sealed, key)?;
        Ok(Some(Self {
            device_id,
            device_name,
            signing_key,
        }))
    }

    /// Load the identity, creating and storing one on first use.
    pub fn load_or_create(
        conn: &Connection,
        key: &LedgerKey,
        device_id: Uuid,
        device_name: &str,
    ) -> Result<Self> {
        if let Some(identity) = Self::load_from_db(conn, key)? {
            return Ok(identity);
        }
        let identity = Self::generate(device_id, device_name);
        identity.save_to_db(conn, key)?;
        Ok(identity)
    }

    /// Move the stored signing key from `old` to `new` after key rotation.
    pub fn reseal(conn: &Connection, old: Option<&LedgerKey>, new: &LedgerKey) -> Result<()> {
        let Some(old) = old else {
            return Ok(());
        };
        if let Some(identity) = Self::load_from_db(conn, old)? {
            identity.save_to_db(conn, new)?;
        }
        Ok(())
    }
}
