//! HTTP client for the relay server.

use crate::crypto::KeyRecord;
use crate::sync::auth::SignedHeader;
use crate::sync::device::DeviceIdentity;
use crate::sync::models::{
    ConflictResponse, EncryptedMessage, PullRequest, PullResponse, PushOutcome, PushRequest,
    PushResponse, RegisterDeviceRequest, ResetRequest, ResetResponse,
};
use crate::sync::remote::RemoteStore;
use crate::{LedgerSyncError, Result};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

const REQUEST_TIMEOUT_SECS: u64 = 30;

fn transport(e: reqwest::Error) -> LedgerSyncError {
    LedgerSyncError::Transport(e.to_string())
}

/// [`RemoteStore`] backed by a relay server, signing every request with the
/// device key.
pub struct RelayClient {
    client: reqwest::Client,
    relay_url: String,
    device_id: Uuid,
    signing_key: SigningKey,
}

impl RelayClient {
    pub fn new(relay_url: &str, identity: &DeviceIdentity) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(transport)?;

        Ok(Self {
            client,
            relay_url: relay_url.trim_end_matches('/').to_string(),
            device_id: identity.device_id,
            signing_key: identity.signing_key.clone(),
        })
    }

    /// Register this device's public key for `ledger_id`. Unauthenticated:
    /// the relay has no key to check a signature against yet.
    pub async fn register_device(
        &self,
        ledger_id: &str,
        device_name: &str,
        public_key: &[u8],
    ) -> Result<()> {
        let request = RegisterDeviceRequest {
            ledger_id: ledger_id.to_string(),
            device_id: self.device_id,
            device_name: device_name.to_string(),
            public_key: public_key.to_vec(),
        };
        let resp = self
            .client
            .post(format!("{}/api/v1/devices/register", self.relay_url))
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn signed_post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let body = serde_json::to_vec(body)
            .map_err(|e| LedgerSyncError::InvalidInput(e.to_string()))?;
        let header = SignedHeader::sign(
            &self.signing_key,
            self.device_id,
            "POST",
            path,
            chrono::Utc::now().timestamp(),
            &body,
        );

        self.client
            .post(format!("{}{}", self.relay_url, path))
            .header("Authorization", header.to_header_value())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(transport)
    }

    async fn signed_get(&self, path: &str) -> Result<reqwest::Response> {
        let header = SignedHeader::sign(
            &self.signing_key,
            self.device_id,
            "GET",
            path,
            chrono::Utc::now().timestamp(),
            b"",
        );

        self.client
            .get(format!("{}{}", self.relay_url, path))
            .header("Authorization", header.to_header_value())
            .send()
            .await
            .map_err(transport)
    }

    /// Turn a non-success status into an error. Server-side failures are
    /// transport errors (retry later); client errors are not.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = format!("relay returned {}: {}", status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(LedgerSyncError::Transport(message))
        } else if status == StatusCode::NOT_FOUND {
            Err(LedgerSyncError::NotFound(message))
        } else {
            Err(LedgerSyncError::InvalidInput(message))
        }
    }

    async fn json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let bytes = resp.bytes().await.map_err(transport)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| LedgerSyncError::Transport(format!("invalid relay response: {}", e)))
    }
}

#[async_trait]
impl RemoteStore for RelayClient {
    async fn push(
        &self,
        ledger_id: &str,
        cursor: u64,
        messages: &[EncryptedMessage],
    ) -> Result<PushOutcome> {
        let request = PushRequest {
            ledger_id: ledger_id.to_string(),
            cursor,
            messages: messages.to_vec(),
        };
        let resp = self.signed_post("/api/v1/sync/push", &request).await?;
        if resp.status() == StatusCode::CONFLICT {
            let conflict: ConflictResponse = Self::json(resp).await?;
            return Ok(PushOutcome::Conflict {
                head: conflict.head,
            });
        }
        let accepted: PushResponse = Self::json(Self::check(resp).await?).await?;
        debug!(
            accepted = accepted.accepted,
            duplicates = accepted.duplicates,
            head = accepted.head,
            "Relay accepted push"
        );
        Ok(PushOutcome::Accepted {
            head: accepted.head,
        })
    }

    async fn pull(&self, ledger_id: &str, since: u64, limit: Option<u64>) -> Result<PullResponse> {
        let request = PullRequest {
            ledger_id: ledger_id.to_string(),
            since,
            limit,
        };
        let resp = self.signed_post("/api/v1/sync/pull", &request).await?;
        Self::json(Self::check(resp).await?).await
    }

    async fn reset(&self, ledger_id: &str, key: &KeyRecord) -> Result<u64> {
        let request = ResetRequest {
            ledger_id: ledger_id.to_string(),
            key: key.clone(),
        };
        let resp = self.signed_post("/api/v1/sync/reset", &request).await?;
        let reset: ResetResponse = Self::json(Self::check(resp).await?).await?;
        Ok(reset.head)
    }

    async fn key_record(&self, ledger_id: &str) -> Result<Option<KeyRecord>> {
        let resp = self
            .signed_get(&format!("/api/v1/ledgers/{}/key", ledger_id))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::json(Self::check(resp).await?).await.map(Some)
    }
}
