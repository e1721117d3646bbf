pub mod config;
pub mod credentials;
pub mod error;
pub mod pool;
pub mod relay;
pub mod retry;
pub mod transform;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};

pub use config::{AppConfig, ConfigError, RoutingTable};
pub use credentials::{CredentialCache, TokenSource};
pub use error::{detail_response, DetailResponse, GatewayError};

use crate::retry::RetryPolicy;
use crate::transform::RequestEnvelope;

#[derive(Clone)]
pub struct AppState {
    config: AppConfig,
    routing: Arc<RoutingTable>,
    credentials: Arc<CredentialCache>,
    http_client: Client,
}

impl AppState {
    pub fn new(config: AppConfig, routing: RoutingTable, token_source: Arc<dyn TokenSource>) -> Self {
        let http_client = Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            .build()
            .expect("failed to build reqwest client");
        let credentials = Arc::new(
            CredentialCache::new(token_source, config.token_ttl)
                .with_fetch_timeout(config.token_fetch_timeout),
        );
        Self {
            config,
            routing: Arc::new(routing),
            credentials,
            http_client,
        }
    }
}

pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/token-status", get(token_status))
        .route("/retry-config", get(retry_config))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "models": state.routing.pools.model_ids(),
    }))
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let data: Vec<Value> = state
        .routing
        .pools
        .model_ids()
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "vertex-ai"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn token_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.credentials.status().await)
}

#[derive(Debug, Serialize)]
struct RetryConfigView {
    #[serde(flatten)]
    policy: RetryPolicy,
    delay_schedule_secs: Vec<f64>,
}

async fn retry_config(State(state): State<AppState>) -> impl IntoResponse {
    let policy = state.config.retry.clone();
    let delay_schedule_secs = policy.schedule();
    Json(RetryConfigView {
        policy,
        delay_schedule_secs,
    })
}

async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
            return detail_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Err(_) => {
            return detail_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let envelope = match RequestEnvelope::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => return err.into_response(),
    };
    let stream = envelope.is_stream();

    match proxy_chat_completion(&state, envelope).await {
        Ok(resp) => resp,
        Err(err) if stream && err.is_upstream() => relay::sse_error_response(&err.to_string()),
        Err(err) => {
            if !err.is_upstream() {
                tracing::warn!(status = err.status().as_u16(), error = %err, "request rejected");
            }
            err.into_response()
        }
    }
}

/// Resolve, transform, then hand off to the retry/failover orchestrator.
async fn proxy_chat_completion(
    state: &AppState,
    envelope: RequestEnvelope,
) -> Result<Response, GatewayError> {
    let public_model = envelope.model().to_string();
    let pool = state.routing.pools.resolve(&public_model)?;
    let envelope = state
        .routing
        .transforms
        .for_model(&public_model)
        .apply(envelope)?;

    retry::dispatch(state, &public_model, pool, envelope).await
}
