//! Ed25519 request signing for the relay API.
//!
//! Every authenticated request carries
//!
//! ```text
//! Authorization: LedgerSync-Ed25519 <device_id>:<timestamp>:<nonce>:<base64(signature)>
//! ```
//!
//! where the signature covers `METHOD\nPATH\nTIMESTAMP\nNONCE\nSHA256(BODY)`.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const AUTH_SCHEME: &str = "LedgerSync-Ed25519";

/// Requests older or newer than this many seconds are refused.
pub const MAX_REQUEST_AGE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid authorization header format")]
    InvalidFormat,
    #[error("Request timestamp outside the freshness window")]
    Expired,
    #[error("Unknown device")]
    UnknownDevice,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Device has been revoked")]
    DeviceRevoked,
    #[error("Nonce has been reused")]
    NonceReused,
}

/// The string a device signs for one request.
pub fn canonical_string(
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{}\n{}\n{}\n{}\n{}", method, path, timestamp, nonce, body_hash)
}

/// Parsed `Authorization` header, before signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeader {
    pub device_id: Uuid,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: Vec<u8>,
}

impl SignedHeader {
    /// Sign a request with the device key, using a fresh nonce.
    pub fn sign(
        signing_key: &SigningKey,
        device_id: Uuid,
        method: &str,
        path: &str,
        timestamp: i64,
        body: &[u8],
    ) -> Self {
        let nonce = Uuid::new_v4().to_string();
        let message = canonical_string(method, path, timestamp, &nonce, body);
        Self {
            device_id,
            timestamp,
            signature: signing_key.sign(message.as_bytes()).to_bytes().to_vec(),
            nonce,
        }
    }

    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let stripped = header
            .strip_prefix(AUTH_SCHEME)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or(AuthError::InvalidFormat)?;

        let mut parts = stripped.splitn(4, ':');
        let (Some(device), Some(ts), Some(nonce), Some(sig)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::InvalidFormat);
        };
        if nonce.is_empty() {
            return Err(AuthError::InvalidFormat);
        }

        Ok(Self {
            device_id: Uuid::parse_str(device).map_err(|_| AuthError::InvalidFormat)?,
            timestamp: ts.parse().map_err(|_| AuthError::InvalidFormat)?,
            nonce: nonce.to_string(),
            signature: STANDARD.decode(sig).map_err(|_| AuthError::InvalidFormat)?,
        })
    }

    pub fn to_header_value(&self) -> String {
        format!(
            "{} {}:{}:{}:{}",
            AUTH_SCHEME,
            self.device_id,
            self.timestamp,
            self.nonce,
            STANDARD.encode(&self.signature)
        )
    }

    /// Check freshness against `now` and the signature against `key`.
    pub fn verify(
        &self,
        key: &VerifyingKey,
        method: &str,
        path: &str,
        body: &[u8],
        now: i64,
    ) -> Result<(), AuthError> {
        if (now - self.timestamp).abs() > MAX_REQUEST_AGE_SECS {
            return Err(AuthError::Expired);
        }
        let bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::InvalidSignature)?;
        let message = canonical_string(method, path, self.timestamp, &self.nonce, body);
        key.verify(message.as_bytes(), &Signature::from_bytes(&bytes))
            .map_err(|_| AuthError::InvalidSignature)
    }
}

/// Parse and verify a header in one step, looking the device key up by id.
pub fn verify_auth_header(
    header: &str,
    method: &str,
    path: &str,
    body: &[u8],
    lookup_key: &dyn Fn(&Uuid) -> Option<VerifyingKey>,
) -> Result<SignedHeader, AuthError> {
    let parsed = SignedHeader::parse(header)?;
    let key = lookup_key(&parsed.device_id).ok_or(AuthError::UnknownDevice)?;
    parsed.verify(&key, method, path, body, chrono::Utc::now().timestamp())?;
    Ok(parsed)
}
