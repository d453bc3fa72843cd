use crate::cache::AttachmentCache;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::logging::SharedLogger;
use crate::pool::CredentialPool;
use crate::proxy::{self, Frame};
use crate::translate::openai_types::{ChatCompletionRequest, ErrorResponse};
use crate::upload::Uploader;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: ProxyConfig,
    pub auth_token: String,
    pub client: reqwest::Client,
    pub pool: Arc<CredentialPool>,
    pub cache: Arc<AttachmentCache>,
    pub uploader: Uploader,
    pub logger: SharedLogger,
}

impl AppState {
    /// Wire up the shared pool, cache and uploader from a config.
    pub fn from_config(config: ProxyConfig, client: reqwest::Client, logger: SharedLogger) -> Self {
        let auth_token = config.resolve_auth_token();
        let pool = Arc::new(CredentialPool::from_list(&config.resolve_credentials()));
        let cache = Arc::new(AttachmentCache::new());
        let uploader = Uploader::new(
            client.clone(),
            pool.clone(),
            cache.clone(),
            config.upload_url(),
            config.origin(),
            config.referer(),
            logger.clone(),
        );

        Self {
            config,
            auth_token,
            client,
            pool,
            cache,
            uploader,
            logger,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .route(
            "/admin/cache",
            get(handle_cache_stats).delete(handle_cache_clear),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer check against the configured static token. Failures never reach
/// transcoding or the upstream.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        None => {
            let err = ErrorResponse::authentication("Missing API key");
            Err((StatusCode::UNAUTHORIZED, Json(err)).into_response())
        }
        Some(token) if token != state.auth_token => {
            let err = ErrorResponse::authentication("Invalid API key");
            Err((StatusCode::UNAUTHORIZED, Json(err)).into_response())
        }
        Some(_) => Ok(()),
    }
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = check_auth(&state, &headers) {
        return response;
    }

    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .error("server", format!("failed to parse request: {e}"));
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    state.logger.info(
        "server",
        format!(
            "request: model={} streaming={} messages={}",
            req.model,
            req.stream.unwrap_or(false),
            req.messages.len()
        ),
    );

    let result = proxy::proxy_chat(
        &req,
        &state.config,
        &state.client,
        &state.pool,
        &state.uploader,
        &state.logger,
    )
    .await;

    match result {
        Ok(proxy::ProxyResponse::Buffered(completion)) => Json(*completion).into_response(),
        Ok(proxy::ProxyResponse::Streaming(frames)) => stream_response(frames),
        Err(e) => {
            state.logger.error("server", format!("proxy error: {e}"));
            error_response(&e)
        }
    }
}

fn stream_response(frames: proxy::FrameStream) -> Response {
    let event_stream = frames.map(|result| -> std::result::Result<Event, Infallible> {
        match result {
            Ok(Frame::Chunk(chunk)) => {
                let data = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
                Ok(Event::default().data(data))
            }
            Ok(Frame::Done) => Ok(Event::default().data("[DONE]")),
            Err(_) => Ok(Event::default().data("[DONE]")),
        }
    });

    Sse::new(event_stream)
        .keep_alive(axum::response::sse::KeepAlive::default())
        .into_response()
}

fn error_response(err: &ProxyError) -> Response {
    let envelope = ErrorResponse::server_error("Error processing request", err.to_string());
    (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope)).into_response()
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let created = chrono::Utc::now().timestamp();
    let models: Vec<serde_json::Value> = state
        .config
        .models
        .keys()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "mammouth",
                "provider": "mammouth",
            })
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": models }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_cache_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&state, &headers) {
        return response;
    }

    Json(state.cache.stats()).into_response()
}

async fn handle_cache_clear(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&state, &headers) {
        return response;
    }

    let cleared = state.cache.clear();
    state
        .logger
        .info("server", format!("attachment cache cleared: {cleared} entries"));
    Json(serde_json::json!({ "cleared": cleared })).into_response()
}
