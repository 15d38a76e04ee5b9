//! HTTP surface: webhook ingestion plus a small read API
//!
//! The webhook route never talks to an exchange; it authenticates, validates,
//! persists and acknowledges. Everything slower happens in the dispatcher.

pub mod logging;
pub mod rate_limit;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use governor::clock::DefaultClock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::db::SignalStore;
use crate::ingest;
use crate::models::{NormalizedSignal, SignalStatus};
use rate_limit::WebhookRateLimiter;

const DEFAULT_SOURCE: &str = "tradingview";
const TOKEN_HEADER: &str = "x-webhook-token";
const MAX_LIST_LIMIT: i64 = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SignalStore>,
    pub webhook_token: String,
    pub db_timeout: Duration,
    pub limiter: Arc<WebhookRateLimiter>,
    pub limiter_clock: DefaultClock,
}

impl AppState {
    pub fn new(store: Arc<SignalStore>, config: &Config) -> Self {
        Self {
            store,
            webhook_token: config.webhook_token.clone(),
            db_timeout: config.db_timeout,
            limiter: rate_limit::new_limiter(config.rate_limit_rpm),
            limiter_clock: DefaultClock::default(),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let webhook = Router::new()
        .route("/webhooks/signal", post(receive_signal))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ));

    let api = Router::new()
        .route("/api/v1/signals", get(list_signals))
        .route("/api/v1/signals/stats", get(signal_stats))
        .route("/api/v1/signals/:id", get(get_signal))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/health", get(health_check))
        .merge(webhook)
        .merge(api)
        .layer(middleware::from_fn(logging::request_logging))
        .with_state(state)
}

/// Bind and serve until the process shuts down
pub async fn serve(state: AppState, bind_addr: SocketAddr) -> crate::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("HTTP server listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

// ===== Route Handlers =====

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    token: Option<String>,
    source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    id: i64,
    status: &'static str,
}

/// POST /webhooks/signal
///
/// Authenticate, parse, normalize, persist, acknowledge. The response never
/// waits on anything but the database, and that work is bounded by
/// `db_timeout`.
async fn receive_signal(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AckResponse>, ApiError> {
    authenticate(&state, &params, &headers)?;

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("invalid JSON body".to_string()))?;

    let source = params.source.as_deref().unwrap_or(DEFAULT_SOURCE);
    let client_ip = addr.ip().to_string();

    let signal = match ingest::normalize(source, &payload) {
        Ok(signal) => signal,
        Err(e) => {
            // Keep the bad payload for the audit trail before rejecting
            match timeout(
                state.db_timeout,
                state
                    .store
                    .record_rejected_event(source, &payload, Some(&client_ip)),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(db_err)) => {
                    tracing::warn!("Failed to audit rejected payload: {}", db_err)
                }
                Err(_) => tracing::warn!("Timed out auditing rejected payload"),
            }
            return Err(ApiError::BadRequest(e.to_string()));
        }
    };

    let (raw_id, signal_id) = match timeout(
        state.db_timeout,
        state
            .store
            .record_signal(&payload, Some(&client_ip), &signal),
    )
    .await
    {
        Ok(Ok(ids)) => ids,
        Ok(Err(db_err)) => return Err(ApiError::Internal(db_err.to_string())),
        Err(_) => {
            return Err(ApiError::Internal(format!(
                "database work exceeded {:?}",
                state.db_timeout
            )))
        }
    };

    tracing::info!(
        "✓ Signal {} recorded ({} {} from {}, raw event {})",
        signal_id,
        signal.action,
        signal.symbol,
        source,
        raw_id
    );

    Ok(Json(AckResponse {
        id: signal_id,
        status: "received",
    }))
}

fn authenticate(
    state: &AppState,
    params: &WebhookQuery,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let provided = params
        .token
        .as_deref()
        .or_else(|| headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()));

    match provided {
        Some(token) if token == state.webhook_token => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unavailable"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignalsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    status: Option<String>,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct SignalsResponse {
    pub signals: Vec<NormalizedSignal>,
    pub total: usize,
}

/// GET /api/v1/signals
async fn list_signals(
    State(state): State<AppState>,
    Query(params): Query<SignalsQuery>,
) -> Result<Json<SignalsResponse>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            SignalStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status '{}'", s)))
        })
        .transpose()?;

    let limit = params.limit.clamp(1, MAX_LIST_LIMIT);
    let signals = state.store.recent_signals(limit, status).await?;

    Ok(Json(SignalsResponse {
        total: signals.len(),
        signals,
    }))
}

/// GET /api/v1/signals/:id
async fn get_signal(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<NormalizedSignal>, ApiError> {
    state
        .store
        .get_signal(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("signal {} not found", id)))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: i64,
    pub by_status: HashMap<String, i64>,
}

/// GET /api/v1/signals/stats
async fn signal_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state.store.status_counts().await?;
    let total = counts.iter().map(|(_, n)| n).sum();

    Ok(Json(StatsResponse {
        total,
        by_status: counts.into_iter().collect(),
    }))
}

// ===== Error Handling =====

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("internal error")]
    Internal(String),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ApiError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::RateLimited { retry_after_secs } => {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("Retry-After", retry_after_secs.to_string())],
                    Json(json!({"error": "rate limit exceeded"})),
                )
                    .into_response();
            }
            // Detail stays in the logs; clients get a generic body
            ApiError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(json!({"error": message}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    // An unreachable database: handlers that stop before touching the pool
    // (auth, body validation, rate limiting) are fully testable without
    // Postgres, and anything that does touch it fails fast.
    fn test_state(rpm: u32) -> AppState {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(250))
            .connect_lazy("postgres://127.0.0.1:1/tradehook_unreachable")
            .expect("lazy pool");

        AppState {
            store: Arc::new(SignalStore::from_pool(pool)),
            webhook_token: "secret-token".to_string(),
            db_timeout: Duration::from_millis(200),
            limiter: rate_limit::new_limiter(rpm),
            limiter_clock: DefaultClock::default(),
        }
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))));
        request
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_rejects_missing_token() {
        let app = create_router(test_state(60));

        let response = app
            .oneshot(request(
                "POST",
                "/webhooks/signal",
                r#"{"ticker":"BTCUSDT","action":"buy"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_webhook_rejects_wrong_token() {
        let app = create_router(test_state(60));

        let response = app
            .oneshot(request(
                "POST",
                "/webhooks/signal?token=nope",
                r#"{"ticker":"BTCUSDT","action":"buy"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_accepts_header_token_for_auth() {
        let app = create_router(test_state(60));

        // Correct header token gets past auth; the unreachable database then
        // yields a 500, not a 401.
        let mut req = request("POST", "/webhooks/signal", r#"{"ticker":"BTCUSDT","action":"buy"}"#);
        req.headers_mut()
            .insert("x-webhook-token", "secret-token".parse().unwrap());

        let response = app.oneshot(req).await.unwrap();
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_rejects_invalid_json() {
        let app = create_router(test_state(60));

        let response = app
            .oneshot(request(
                "POST",
                "/webhooks/signal?token=secret-token",
                "not json at all",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid JSON body");
    }

    #[tokio::test]
    async fn test_webhook_rejects_missing_symbol() {
        let app = create_router(test_state(60));

        let response = app
            .oneshot(request(
                "POST",
                "/webhooks/signal?token=secret-token",
                r#"{"action":"buy"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("symbol"));
    }

    #[tokio::test]
    async fn test_webhook_db_failure_is_generic() {
        let app = create_router(test_state(60));

        let response = app
            .oneshot(request(
                "POST",
                "/webhooks/signal?token=secret-token",
                r#"{"ticker":"BTCUSDT","action":"buy","price":"100"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // Connection detail must never reach the client
        assert_eq!(body_json(response).await["error"], "internal error");
    }

    #[tokio::test]
    async fn test_rate_limit_returns_429() {
        let state = test_state(2);

        for _ in 0..2 {
            let app = create_router(state.clone());
            let response = app
                .oneshot(request("POST", "/webhooks/signal", "{}"))
                .await
                .unwrap();
            // Under the limit: rejected by auth, not by the limiter
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let app = create_router(state);
        let response = app
            .oneshot(request("POST", "/webhooks/signal", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("Retry-After"));
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_status() {
        let app = create_router(test_state(60));

        let response = app
            .oneshot(request("GET", "/api/v1/signals?status=bogus", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn test_health_unavailable_without_database() {
        let app = create_router(test_state(60));

        let response = app
            .oneshot(request("GET", "/health", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
