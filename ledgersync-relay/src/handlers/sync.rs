//! Sync push/pull/reset handlers.

use super::ensure_ledger;
use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::models::AuthedDevice;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use ledgersync_core::crypto::KeyRecord;
use ledgersync_core::sync::models::{
    PullRequest, PullResponse, PushRequest, PushResponse, ResetRequest, ResetResponse,
};
use ledgersync_core::sync::remote::DEFAULT_PAGE_SIZE;

pub async fn push(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, RelayError> {
    ensure_ledger(&device, &req.ledger_id)?;
    let result = state.storage.append(
        &req.ledger_id,
        req.cursor,
        &req.messages,
        state.config.max_messages_per_ledger,
    );
    match &result {
        Ok(accepted) => tracing::debug!(
            ledger_id = %req.ledger_id,
            device_id = %device.device_id,
            accepted = accepted.accepted,
            duplicates = accepted.duplicates,
            head = accepted.head,
            "Push accepted"
        ),
        Err(RelayError::Stale { head }) => tracing::debug!(
            ledger_id = %req.ledger_id,
            cursor = req.cursor,
            head,
            "Push rejected as stale"
        ),
        Err(_) => {}
    }
    result.map(Json)
}

pub async fn pull(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
    Json(req): Json<PullRequest>,
) -> Result<Json<PullResponse>, RelayError> {
    ensure_ledger(&device, &req.ledger_id)?;
    let limit = req
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, state.config.max_pull_limit.max(1));
    let response = state.storage.pull(&req.ledger_id, req.since, limit)?;
    Ok(Json(response))
}

pub async fn reset(
    State(state): State<AppState>,
    Extension(device): Extension<AuthedDevice>,
    Json(req): Json<ResetRequest>,
) -> Result<Json<ResetResponse>, RelayError> {
    ensure_ledger(&device, &req.ledger_id)?;
    tracing::info!(ledger_id = %req.ledger_id, device_id = %device.device_id, "Reset requested");
    let head = state.storage.reset(&req.ledger_id, &req.key)?;
    Ok(Json(ResetResponse { head }))
}

/// Public: the key record holds only KDF parameters and a verifier.
pub async fn key_record(
    State(state): State<AppState>,
    Path(ledger_id): Path<String>,
) -> Result<Json<KeyRecord>, RelayError> {
    state
        .storage
        .key_record(&ledger_id)?
        .map(Json)
        .ok_or_else(|| RelayError::NotFound(format!("No key published for ledger {}", ledger_id)))
}
