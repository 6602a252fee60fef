pub mod chatapi;
pub mod freshchat;
pub mod telegram;

use crate::backend::Backend;
use crate::models::{Channel, ChannelLog, ChannelType};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::response::Response;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Which parts of the adapter contract a handler implements. The router
/// consults this when mounting routes and the sender when dispatching.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub receive: bool,
    pub send: bool,
    pub verify_signature: bool,
    pub fetch_attachment: bool,
}

/// Everything a handler may touch while servicing a request. Handlers own
/// no state of their own beyond construction-time flags.
#[derive(Clone)]
pub struct HandlerContext {
    pub backend: Arc<dyn Backend>,
    pub http: reqwest::Client,
}

/// The per-provider adapter contract. Inbound callbacks must fully decode
/// and validate before any backend write; outbound sends must attach one
/// ChannelLog per HTTP attempt and never persist status themselves.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// The webhook actions this handler answers under
    /// `/c/<type>/<uuid>/<action>`.
    fn actions(&self) -> &'static [&'static str] {
        &["receive"]
    }

    /// Handle one inbound webhook. Returns the HTTP response to hand the
    /// provider; unexpected failures bubble as errors and become a 500
    /// envelope upstream.
    async fn receive(
        &self,
        ctx: &HandlerContext,
        channel: &Channel,
        action: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response>;

    /// Deliver one outgoing message and report the resulting status. The
    /// caller persists the status and the attached logs.
    async fn send_msg(
        &self,
        ctx: &HandlerContext,
        channel: &Channel,
        msg: &crate::models::Msg,
    ) -> Result<crate::models::StatusUpdate>;

    /// A request that re-downloads provider media with whatever auth the
    /// provider wants. Default: plain GET.
    fn attachment_request(
        &self,
        _channel: &Channel,
        http: &reqwest::Client,
        url: &str,
    ) -> reqwest::RequestBuilder {
        http.get(url)
    }
}

/// Closed set of adapters, complete before HTTP serving begins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ChannelHandler>) {
        self.handlers
            .insert(handler.channel_type().code().to_string(), handler);
    }

    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(&channel_type.to_uppercase()).cloned()
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn ChannelHandler>> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Decode a JSON webhook body. The error string is part of the response
/// contract ("unable to parse request JSON: ...").
pub fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| anyhow!("unable to parse request JSON: {}", e))
}

/// Run one provider HTTP request, producing the observability log whether
/// it worked or not. Returns the log plus the status code and body on the
/// wire-level success path.
pub async fn execute_logged(
    http: &reqwest::Client,
    request: reqwest::Request,
    description: &str,
    channel_uuid: Uuid,
    msg_id: Option<i64>,
) -> (ChannelLog, Result<(u16, String)>) {
    let mut log = ChannelLog::new(description, channel_uuid, msg_id);
    log.url = request.url().to_string();
    log.request = format!(
        "{} {}\n{}",
        request.method(),
        request.url(),
        request
            .body()
            .and_then(|b| b.as_bytes())
            .map(|b| String::from_utf8_lossy(b).to_string())
            .unwrap_or_default()
    );

    let started = Instant::now();
    let result = http.execute(request).await;
    log.elapsed_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            log.status_code = status;
            let body = response.text().await.unwrap_or_default();
            log.response = body.clone();
            if status / 100 != 2 {
                let err = anyhow!("received non 2xx response: {}", status);
                log.error = Some(err.to_string());
                return (log, Err(err));
            }
            (log, Ok((status, body)))
        }
        Err(e) => {
            log.error = Some(e.to_string());
            (log, Err(anyhow!("error making request: {}", e)))
        }
    }
}
