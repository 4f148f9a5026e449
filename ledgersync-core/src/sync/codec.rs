//! Message codec: turns a [`Message`] into an [`EncryptedMessage`] and back.
//!
//! Plaintext is the bincode encoding of the message, length-prefixed and
//! padded to a fixed bucket so envelope sizes do not reveal payee names or
//! amounts. The cleartext header (ledger, device, sequence, key version) is
//! authenticated as associated data:
//!
//! `"ledgersync/v1" || ledger_id || device_id(16) || sequence(be) || key_version(be)`

use crate::crypto::cipher::{decrypt_with_aad, encrypt_with_aad, EncryptedBlob, NONCE_LEN, TAG_LEN};
use crate::crypto::{CryptoError, LedgerKey};
use crate::sync::models::{EncryptedMessage, Message};
use crate::{LedgerSyncError, Result};
use uuid::Uuid;

const AAD_PREFIX: &[u8] = b"ledgersync/v1";
const BUCKETS: [usize; 6] = [256, 512, 1024, 2048, 4096, 8192];

/// Associated data binding an envelope's header to its ciphertext
pub fn header_aad(ledger_id: &str, device_id: &Uuid, sequence: u64, key_version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_PREFIX.len() + ledger_id.len() + 1 + 16 + 8 + 4);
    aad.extend_from_slice(AAD_PREFIX);
    aad.extend_from_slice(ledger_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(device_id.as_bytes());
    aad.extend_from_slice(&sequence.to_be_bytes());
    aad.extend_from_slice(&key_version.to_be_bytes());
    aad
}

/// Encrypt `message` under `key`.
pub fn encode(key: &LedgerKey, message: &Message) -> Result<EncryptedMessage> {
    if message.ledger_id != key.ledger_id() {
        return Err(LedgerSyncError::InvalidInput(format!(
            "message for ledger {} cannot be sealed with key for {}",
            message.ledger_id,
            key.ledger_id()
        )));
    }

    let plaintext = bincode::serialize(message)
        .map_err(|e| CryptoError::EncryptionFailed(format!("encoding failed: {}", e)))?;
    let aad = header_aad(
        &message.ledger_id,
        &message.device_id,
        message.sequence,
        key.version(),
    );
    let blob = encrypt_with_aad(key.as_bytes(), &pad_payload(&plaintext), &aad)?;

    Ok(EncryptedMessage {
        ledger_id: message.ledger_id.clone(),
        device_id: message.device_id,
        sequence: message.sequence,
        key_version: key.version(),
        nonce: blob.nonce.to_vec(),
        ciphertext: blob.ciphertext,
        auth_tag: blob.auth_tag.to_vec(),
    })
}

/// Decrypt and verify `envelope`.
///
/// A key-version mismatch is a credential error. Every other failure
/// (wrong ledger, bad tag, malformed body, header disagreement, checksum) is
/// reported as tampering.
pub fn decode(key: &LedgerKey, envelope: &EncryptedMessage) -> Result<Message> {
    let tamper = |reason: &str| LedgerSyncError::Tamper {
        device_id: envelope.device_id.to_string(),
        sequence: envelope.sequence,
        reason: reason.to_string(),
    };

    if envelope.ledger_id != key.ledger_id() {
        return Err(tamper("envelope belongs to another ledger"));
    }
    if envelope.key_version != key.version() {
        return Err(LedgerSyncError::KeyVersionMismatch {
            expected: key.version(),
            found: envelope.key_version,
        });
    }

    let nonce: [u8; NONCE_LEN] = envelope
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| tamper("bad nonce length"))?;
    let auth_tag: [u8; TAG_LEN] = envelope
        .auth_tag
        .as_slice()
        .try_into()
        .map_err(|_| tamper("bad tag length"))?;
    let blob = EncryptedBlob {
        nonce,
        ciphertext: envelope.ciphertext.clone(),
        auth_tag,
    };

    let aad = header_aad(
        &envelope.ledger_id,
        &envelope.device_id,
        envelope.sequence,
        envelope.key_version,
    );
    let padded = decrypt_with_aad(key.as_bytes(), &blob, &aad)
        .map_err(|_| tamper("authentication tag mismatch"))?;
    let plaintext = unpad_payload(&padded).map_err(|_| tamper("bad padding"))?;
    let message: Message =
        bincode::deserialize(&plaintext).map_err(|_| tamper("malformed message body"))?;

    if message.ledger_id != envelope.ledger_id
        || message.device_id != envelope.device_id
        || message.sequence != envelope.sequence
    {
        return Err(tamper("header does not match body"));
    }
    if !message.has_valid_checksum() {
        return Err(tamper("checksum mismatch"));
    }

    Ok(message)
}

/// Re-encrypt an envelope from `old` to `new`.
pub fn reseal(old: &LedgerKey, new: &LedgerKey, envelope: &EncryptedMessage) -> Result<EncryptedMessage> {
    let message = decode(old, envelope)?;
    encode(new, &message)
}

/// Pad payload to a fixed-size bucket with an 8-byte length prefix.
///
/// Buckets: 256, 512, 1024, 2048, 4096, 8192 bytes, then multiples of 8192.
pub fn pad_payload(data: &[u8]) -> Vec<u8> {
    let total_needed = data.len() + 8;
    let bucket_size = BUCKETS
        .iter()
        .find(|&&b| b >= total_needed)
        .copied()
        .unwrap_or(total_needed.div_ceil(8192) * 8192);

    let mut padded = Vec::with_capacity(bucket_size);
    padded.extend_from_slice(&(data.len() as u64).to_le_bytes());
    padded.extend_from_slice(data);
    padded.resize(bucket_size, 0u8);
    padded
}

/// Remove padding from a padded payload.
pub fn unpad_payload(padded: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
    let len_bytes: [u8; 8] = padded
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CryptoError::DecryptionFailed("Padded payload too short".to_string()))?;
    let original_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| CryptoError::DecryptionFailed("Invalid length prefix".to_string()))?;

    padded
        .get(8..)
        .and_then(|rest| rest.get(..original_len))
        .map(|data| data.to_vec())
        .ok_or_else(|| CryptoError::DecryptionFailed("Invalid padded payload length".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{CellChange, MessageValue};

    fn key(version: u32) -> LedgerKey {
        LedgerKey::new("budget", version, [version as u8; 32])
    }

    fn message(sequence: u64) -> Message {
        Message::new(
            "budget",
            1_700_000_000_000 + sequence,
            Uuid::new_v4(),
            sequence,
            CellChange::new("transactions", "t1", "payee_id", "p-coffee"),
        )
    }

    #[test]
    fn encode_decode() {
        let key = key(1);
        let msg = message(4);
        let envelope = encode(&key, &msg).unwrap();

        assert_eq!(envelope.sequence, 4);
        assert_eq!(envelope.key_version, 1);
        assert_eq!(envelope.ciphertext.len(), 256);
        assert_eq!(decode(&key, &envelope).unwrap(), msg);
    }

    #[test]
    fn payee_length_is_hidden_by_padding() {
        let key = key(1);
        let short = encode(&key, &message(1)).unwrap();
        let mut long_msg = message(2);
        long_msg.value = MessageValue::Text("x".repeat(30));
        long_msg.checksum = long_msg.compute_checksum();
        let long = encode(&key, &long_msg).unwrap();
        assert_eq!(short.ciphertext.len(), long.ciphertext.len());
    }

    #[test]
    fn any_flipped_bit_is_tamper() {
        let key = key(1);
        let envelope = encode(&key, &message(1)).unwrap();

        for field in 0..3 {
            let mut bad = envelope.clone();
            match field {
                0 => bad.ciphertext[17] ^= 0x04,
                1 => bad.auth_tag[0] ^= 0x01,
                _ => bad.nonce[11] ^= 0x80,
            }
            let err = decode(&key, &bad).unwrap_err();
            assert!(matches!(err, LedgerSyncError::Tamper { .. }), "{:?}", err);
        }
    }

    #[test]
    fn header_is_authenticated() {
        let key = key(1);
        let envelope = encode(&key, &message(1)).unwrap();

        let mut moved = envelope.clone();
        moved.sequence = 2;
        assert!(matches!(
            decode(&key, &moved),
            Err(LedgerSyncError::Tamper { .. })
        ));

        let mut other_device = envelope;
        other_device.device_id = Uuid::new_v4();
        assert!(matches!(
            decode(&key, &other_device),
            Err(LedgerSyncError::Tamper { .. })
        ));
    }

    #[test]
    fn cross_ledger_envelope_rejected() {
        let envelope = encode(&key(1), &message(1)).unwrap();
        let foreign = LedgerKey::new("other", 1, [1; 32]);
        assert!(matches!(
            decode(&foreign, &envelope),
            Err(LedgerSyncError::Tamper { .. })
        ));
    }

    #[test]
    fn key_version_mismatch_is_credential_error() {
        let envelope = encode(&key(1), &message(1)).unwrap();
        let err = decode(&key(2), &envelope).unwrap_err();
        assert!(matches!(
            err,
            LedgerSyncError::KeyVersionMismatch {
                expected: 2,
                found: 1
            }
        ));
        assert_eq!(err.kind(), crate::ErrorKind::Credential);
    }

    #[test]
    fn reseal_moves_to_new_key() {
        let old = key(1);
        let new = key(2);
        let msg = message(3);
        let envelope = encode(&old, &msg).unwrap();
        let resealed = reseal(&old, &new, &envelope).unwrap();

        assert_eq!(resealed.key_version, 2);
        assert_eq!(decode(&new, &resealed).unwrap(), msg);
        assert!(decode(&old, &resealed).is_err());
    }

    #[test]
    fn pad_bucket_sizes() {
        assert_eq!(pad_payload(&[0u8; 10]).len(), 256);
        assert_eq!(pad_payload(&[0u8; 250]).len(), 512);
        assert_eq!(pad_payload(&[0u8; 1000]).len(), 1024);
        assert_eq!(pad_payload(&[0u8; 9000]).len(), 16384);
    }

    #[test]
    fn unpad_rejects_bad_prefix() {
        assert!(unpad_payload(&[0u8; 4]).is_err());
        let mut padded = pad_payload(b"abc");
        padded[..8].copy_from_slice(&1_000u64.to_le_bytes());
        assert!(unpad_payload(&padded).is_err());
        assert_eq!(unpad_payload(&pad_payload(b"abc")).unwrap(), b"abc");
    }
}
