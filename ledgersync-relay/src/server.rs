//! Axum router setup.

use crate::auth::auth_middleware;
use crate::config::RelayConfig;
use crate::handlers::{devices, sync};
use crate::rate_limit::RateLimiter;
use crate::storage::RelayStorage;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: RelayStorage,
    pub limiter: RateLimiter,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(storage: RelayStorage, config: RelayConfig) -> Self {
        Self {
            storage,
            limiter: RateLimiter::new(config.rate_limit_per_minute),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let max_payload_size = state.config.max_payload_size;

    // Authenticated routes
    let authenticated = Router::new()
        .route("/api/v1/devices", get(devices::list_devices))
        .route("/api/v1/devices/{id}/revoke", post(devices::revoke_device))
        .route("/api/v1/sync/push", post(sync::push))
        .route("/api/v1/sync/pull", post(sync::pull))
        .route("/api/v1/sync/reset", post(sync::reset))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Unauthenticated routes
    let public = Router::new()
        .route("/api/v1/devices/register", post(devices::register_device))
        .route("/api/v1/ledgers/{id}/key", get(sync::key_record))
        .route("/health", get(health));

    Router::new()
        .merge(authenticated)
        .merge(public)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(max_payload_size))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use ed25519_dalek::SigningKey;
    use ledgersync_core::crypto::{KdfParams, KeyRecord};
    use ledgersync_core::sync::auth::SignedHeader;
    use ledgersync_core::sync::models::{
        ConflictResponse, EncryptedMessage, PullRequest, PullResponse, PushRequest,
        PushResponse, RegisterDeviceRequest, ResetRequest, ResetResponse,
    };
    use rand::RngCore;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct Device {
        id: Uuid,
        key: SigningKey,
    }

    impl Device {
        fn new() -> Self {
            let mut secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            Self {
                id: Uuid::new_v4(),
                key: SigningKey::from_bytes(&secret),
            }
        }

        fn envelope(&self, ledger: &str, sequence: u64) -> EncryptedMessage {
            EncryptedMessage {
                ledger_id: ledger.to_string(),
                device_id: self.id,
                sequence,
                key_version: 1,
                nonce: vec![0; 12],
                ciphertext: vec![sequence as u8; 4],
                auth_tag: vec![0; 16],
            }
        }

        fn signed_post<B: Serialize>(&self, path: &str, body: &B) -> Request<Body> {
            let body = serde_json::to_vec(body).unwrap();
            let header = SignedHeader::sign(
                &self.key,
                self.id,
                "POST",
                path,
                chrono::Utc::now().timestamp(),
                &body,
            );
            Request::post(path)
                .header("Authorization", header.to_header_value())
                .header("Content-Type", "application/json")
                .body(Body::from(body))
                .unwrap()
        }
    }

    fn app() -> Router {
        let storage = RelayStorage::in_memory().unwrap();
        build_router(AppState::new(storage, RelayConfig::default()))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    async fn send_json<T: DeserializeOwned>(app: &Router, request: Request<Body>) -> (StatusCode, T) {
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn register(app: &Router, device: &Device, ledger: &str) -> StatusCode {
        let request = RegisterDeviceRequest {
            ledger_id: ledger.to_string(),
            device_id: device.id,
            device_name: "test".to_string(),
            public_key: device.key.verifying_key().to_bytes().to_vec(),
        };
        let request = Request::post("/api/v1/devices/register")
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&request).unwrap()))
            .unwrap();
        send(app, request).await.0
    }

    fn push(device: &Device, ledger: &str, cursor: u64, seqs: &[u64]) -> Request<Body> {
        device.signed_post(
            "/api/v1/sync/push",
            &PushRequest {
                ledger_id: ledger.to_string(),
                cursor,
                messages: seqs.iter().map(|s| device.envelope(ledger, *s)).collect(),
            },
        )
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = app();
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn unsigned_sync_requests_are_rejected() {
        let app = app();
        let request = Request::post("/api/v1/sync/pull")
            .header("Content-Type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(send(&app, request).await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn push_pull_and_stale_conflict() {
        let app = app();
        let a = Device::new();
        let b = Device::new();
        assert_eq!(register(&app, &a, "budget").await, StatusCode::OK);
        assert_eq!(register(&app, &b, "budget").await, StatusCode::OK);

        let (status, accepted): (_, PushResponse) = send_json(&app, push(&a, "budget", 0, &[1, 2])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted.head, 2);

        let (status, conflict): (_, ConflictResponse) = send_json(&app, push(&b, "budget", 0, &[1])).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(conflict.error, "conflict");
        assert_eq!(conflict.head, 2);

        let pull = b.signed_post(
            "/api/v1/sync/pull",
            &PullRequest {
                ledger_id: "budget".to_string(),
                since: 0,
                limit: Some(1),
            },
        );
        let (status, page): (_, PullResponse) = send_json(&app, pull).await;
        assert_eq!(status, StatusCode::OK);
        assert!(page.has_more);
        assert_eq!(page.messages[0].envelope, a.envelope("budget", 1));

        let (status, accepted): (_, PushResponse) = send_json(&app, push(&b, "budget", 2, &[1])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted.head, 3);
    }

    #[tokio::test]
    async fn other_ledgers_are_forbidden() {
        let app = app();
        let a = Device::new();
        let b = Device::new();
        register(&app, &a, "budget").await;
        register(&app, &b, "other").await;

        assert_eq!(send(&app, push(&b, "budget", 0, &[1])).await.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn reset_publishes_key_record() {
        let app = app();
        let a = Device::new();
        register(&app, &a, "budget").await;
        send(&app, push(&a, "budget", 0, &[1, 2, 3])).await;

        let key_path = "/api/v1/ledgers/budget/key";
        let (status, _) = send(&app, Request::get(key_path).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let record = KeyRecord {
            ledger_id: "budget".to_string(),
            key_version: 2,
            kdf: KdfParams::minimal(),
            verifier: vec![1; 32],
            created_at: 0,
        };
        let reset = a.signed_post(
            "/api/v1/sync/reset",
            &ResetRequest {
                ledger_id: "budget".to_string(),
                key: record.clone(),
            },
        );
        let (status, reset): (_, ResetResponse) = send_json(&app, reset).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reset.head, 3);

        let (status, published): (_, KeyRecord) =
            send_json(&app, Request::get(key_path).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(published, record);
    }

    #[tokio::test]
    async fn revoked_device_loses_access() {
        let app = app();
        let a = Device::new();
        let b = Device::new();
        register(&app, &a, "budget").await;
        register(&app, &b, "budget").await;

        let revoke = a.signed_post(&format!("/api/v1/devices/{}/revoke", b.id), &());
        assert_eq!(send(&app, revoke).await.0, StatusCode::OK);
        assert_eq!(send(&app, push(&b, "budget", 0, &[1])).await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_public_key_rejected() {
        let app = app();
        let request = Request::post("/api/v1/devices/register")
            .header("Content-Type", "application/json")
            .body(Body::from(
                r#"{"ledger_id":"budget","device_id":"00000000-0000-0000-0000-000000000001","device_name":"x","public_key":"AAAA"}"#,
            ))
            .unwrap();
        assert_eq!(send(&app, request).await.0, StatusCode::BAD_REQUEST);
    }
}
