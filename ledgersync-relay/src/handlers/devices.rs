//! Device registration and management handlers.

use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::models::{AuthedDevice, StoredDevice};
use axum::extract::{Path, State};
use axum::{Extension, Json};
use ed25519_dalek::VerifyingKey;
use ledgersync_core::sync::models::RegisterDeviceRequest;

pub async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<Json<serde_json::Value>, RelayError> {
    if req.ledger_id.trim().is_empty() {
        return Err(RelayError::BadRequest("ledger_id is required".to_string()));
    }
    let key_bytes: [u8; 32] = req
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| RelayError::BadRequest("Public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| RelayError::BadRequest("Invalid Ed25519 public key".to_string()))?;

    state.storage.register_device(
        &req.ledger_id,
        &req.device_id.to_string(),
        &req.device_name,
        &key_bytes,
    )?;
    tracing::info!(ledger_id = %req.ledger_id, device_id = %req.device_id, "Device registered");

    Ok(Json(serde_json::json!({"status": "registered"})))
}

pub async fn list_devices(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
) -> Result<Json<Vec<StoredDevice>>, RelayError> {
    Ok(Json(state.storage.list_devices(&device.ledger_id)?))
}

pub async fn revoke_device(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
    Path(target_id): Path<String>,
) -> Result<Json<serde_json::Value>, RelayError> {
    if !state.storage.revoke_device(&device.ledger_id, &target_id)? {
        return Err(RelayError::NotFound(format!(
            "No active device {} in this ledger",
            target_id
        )));
    }
    tracing::info!(ledger_id = %device.ledger_id, target_id = %target_id, by = %device.device_id, "Device revoked");
    Ok(Json(serde_json::json!({"status": "revoked"})))
}
