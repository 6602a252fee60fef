pub mod backend;
pub mod config;
pub mod db;
pub mod dedup;
pub mod envelope;
pub mod handlers;
pub mod mock;
pub mod models;
pub mod queue;
pub mod sender;
pub mod urns;

pub use config::Config;

use crate::backend::{Backend, BackendError};
use crate::handlers::{
    chatapi::ChatApiHandler, freshchat::FreshchatHandler, telegram::TelegramHandler,
    HandlerContext, HandlerRegistry,
};
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub backend: Arc<dyn Backend>,
    pub registry: Arc<HandlerRegistry>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            backend: self.backend.clone(),
            http: self.http.clone(),
        }
    }
}

/// The closed set of adapters this process serves. Built once at startup
/// and handed to the router; nothing registers later.
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ChatApiHandler::new()));
    registry.register(Arc::new(FreshchatHandler::new(true)));
    registry.register(Arc::new(TelegramHandler::new()));
    registry
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/c/:channel_type/:uuid/:action", post(handle_channel_request))
        .with_state(state)
}

/// Wire up the production stack: SQL pool, Redis connection, backend,
/// registry, router. Fails fast on an unreachable store so a misconfigured
/// process exits non-zero instead of serving dead routes.
pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = config::load_config();

    let dialect = db::SqlDialect::from_url(&config.database.url);
    let pool = sqlx::AnyPool::connect(&config.database.url)
        .await
        .context("connecting to database")?;
    db::init_db(&pool, dialect).await.context("initializing database")?;

    let client = redis::Client::open(config.redis.url.as_str()).context("parsing redis url")?;
    let redis_conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("connecting to redis")?;

    let backend = Arc::new(db::DbBackend::new(
        pool,
        dialect,
        redis_conn,
        config.redis.celery_queue.clone(),
        config.dedup.capacity_per_channel,
        Duration::from_secs(config.dedup.ttl_seconds),
        config.sender.max_send_attempts,
    ));

    let registry = Arc::new(default_registry());
    anyhow::ensure!(!registry.is_empty(), "no channel handlers registered");
    for handler in registry.handlers() {
        tracing::info!(
            channel_type = %handler.channel_type(),
            name = handler.name(),
            "registered handler"
        );
    }

    let state = AppState {
        config: config.clone(),
        backend,
        registry,
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request.deadline_seconds))
            .build()
            .context("building http client")?,
    };

    let router = create_router(state.clone());
    Ok((state, router))
}

async fn index() -> impl IntoResponse {
    Json(json!({"service": "switchboard", "status": "ok"}))
}

/// Resolve type → handler → channel, then run the adapter callback under
/// the request deadline. Unknown type or action behaves like an unmounted
/// route; a known route with an unknown channel is the provider's
/// misconfiguration and gets the 400 envelope.
async fn handle_channel_request(
    State(state): State<AppState>,
    Path((channel_type, uuid, action)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(handler) = state.registry.get(&channel_type) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !handler.capabilities().receive || !handler.actions().contains(&action.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Ok(channel_uuid) = Uuid::parse_str(&uuid) else {
        return envelope::bad_request("invalid channel uuid");
    };

    let channel = match state
        .backend
        .get_channel(&handler.channel_type(), channel_uuid)
        .await
    {
        Ok(channel) => channel,
        Err(BackendError::ChannelNotFound) => {
            return envelope::bad_request(&format!("channel not found: {}", channel_uuid));
        }
        Err(e) => {
            error!("error resolving channel {channel_uuid}: {e:?}");
            return envelope::server_error(&e.to_string());
        }
    };

    let ctx = state.handler_context();
    let deadline = Duration::from_secs(state.config.request.deadline_seconds);
    match tokio::time::timeout(
        deadline,
        handler.receive(&ctx, &channel, &action, &headers, &body),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(channel = %channel_uuid, action, "handler error: {e:?}");
            envelope::server_error(&e.to_string())
        }
        Err(_) => envelope::server_error("request deadline exceeded"),
    }
}
