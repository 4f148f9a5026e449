//! Ed25519 auth middleware for the relay server.

use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::models::AuthedDevice;
use crate::storage::RelayStorage;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use ledgersync_core::sync::auth::{AuthError, SignedHeader};

/// Auth middleware: verifies the Ed25519 signature on every authenticated
/// request, burns its nonce, and applies the per-device rate limit.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, RelayError> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(RelayError::Auth(AuthError::InvalidFormat))?
        .to_string();

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    // The signature covers the body, so it has to be buffered here.
    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, state.config.max_payload_size)
        .await
        .map_err(|e| RelayError::BadRequest(format!("Failed to read body: {}", e)))?;

    let device = authenticate(
        &state.storage,
        &auth_header,
        &method,
        &path,
        &body_bytes,
        Utc::now().timestamp(),
    )?;

    if !state.limiter.check(&device.device_id) {
        tracing::warn!(device_id = %device.device_id, "Rate limit exceeded");
        return Err(RelayError::RateLimited);
    }

    let mut request = Request::from_parts(parts, Body::from(body_bytes));
    request.extensions_mut().insert(device);

    Ok(next.run(request).await)
}

/// Verify one request against the registered device key.
pub fn authenticate(
    storage: &RelayStorage,
    header: &str,
    method: &str,
    path: &str,
    body: &[u8],
    now: i64,
) -> Result<AuthedDevice, RelayError> {
    let parsed = SignedHeader::parse(header)?;
    let device = storage
        .device(&parsed.device_id.to_string())?
        .ok_or(AuthError::UnknownDevice)?;
    if device.revoked {
        return Err(AuthError::DeviceRevoked.into());
    }
    let key = device.verifying_key().ok_or(AuthError::UnknownDevice)?;
    parsed.verify(&key, method, path, body, now)?;

    if !storage.remember_nonce(&parsed.nonce, &device.device_id, now)? {
        return Err(AuthError::NonceReused.into());
    }

    Ok(AuthedDevice {
        device_id: device.device_id,
        ledger_id: device.ledger_id,
    })
}
