use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::models::{ChannelLog, Msg, MsgStatus, StatusUpdate};
use chrono::Duration;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{error, warn};

const SENDER_POLL_MS: u64 = 500;

const SEND_RETRY_BASE_SECS: i64 = 30;
const SEND_RETRY_CAP_SECS: i64 = 900;

/// Delay before re-attempting a failed delivery. A provider that just
/// rejected or timed out rarely recovers within seconds, so retries
/// start at half a minute and triple until the fifteen-minute ceiling.
pub fn compute_backoff(attempt: i32) -> Duration {
    let step = (attempt.clamp(1, 5) - 1) as u32;
    let secs = SEND_RETRY_BASE_SECS.saturating_mul(3_i64.saturating_pow(step));
    Duration::seconds(secs.min(SEND_RETRY_CAP_SECS))
}

/// Drains the backend's outgoing queue through the adapters. A fixed pool
/// of workers polls; each claimed message gets exactly one delivery
/// attempt per claim, with the backend scheduling retries.
pub struct Sender {
    ctx: HandlerContext,
    registry: Arc<HandlerRegistry>,
    workers: usize,
}

impl Sender {
    pub fn new(ctx: HandlerContext, registry: Arc<HandlerRegistry>, workers: usize) -> Sender {
        Sender {
            ctx,
            registry,
            workers: workers.max(1),
        }
    }

    pub fn start(self) {
        for worker in 0..self.workers {
            let ctx = self.ctx.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                run_worker(worker, ctx, registry).await;
            });
        }
    }
}

async fn run_worker(worker: usize, ctx: HandlerContext, registry: Arc<HandlerRegistry>) {
    loop {
        match ctx.backend.pop_next_outgoing_msg().await {
            Ok(Some(msg)) => {
                if let Err(e) = send_msg(&ctx, &registry, &msg).await {
                    error!(worker, msg_id = msg.id, "send failed: {e:?}");
                }
            }
            Ok(None) => sleep(std::time::Duration::from_millis(SENDER_POLL_MS)).await,
            Err(e) => {
                error!(worker, "error popping outgoing msg: {e:?}");
                sleep(std::time::Duration::from_millis(SENDER_POLL_MS)).await;
            }
        }
    }
}

/// One delivery attempt: route to the adapter, persist every log it
/// attached, record the outcome. Adapter failures become an errored
/// status rather than bubbling, so the retry bookkeeping always runs.
pub async fn send_msg(
    ctx: &HandlerContext,
    registry: &HandlerRegistry,
    msg: &Msg,
) -> anyhow::Result<()> {
    let status = attempt_send(ctx, registry, msg).await;

    for log in &status.logs {
        if let Err(e) = ctx.backend.write_channel_log(log).await {
            warn!(msg_id = msg.id, "unable to write channel log: {e:?}");
        }
    }

    ctx.backend.mark_outgoing_msg_complete(msg, &status).await?;
    Ok(())
}

async fn attempt_send(
    ctx: &HandlerContext,
    registry: &HandlerRegistry,
    msg: &Msg,
) -> StatusUpdate {
    let mut errored = StatusUpdate {
        channel_uuid: msg.channel_uuid,
        msg_id: Some(msg.id),
        external_id: None,
        status: MsgStatus::Errored,
        logs: Vec::new(),
    };

    let Some(handler) = registry.get(msg.channel_type.code()) else {
        errored.add_log(
            ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                .with_error(&format!("no handler for channel type {}", msg.channel_type)),
        );
        return errored;
    };
    if !handler.capabilities().send {
        errored.add_log(
            ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                .with_error(&format!("{} channels do not support sending", handler.name())),
        );
        return errored;
    }

    let channel = match ctx.backend.get_channel(&msg.channel_type, msg.channel_uuid).await {
        Ok(channel) => channel,
        Err(e) => {
            errored.add_log(
                ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                    .with_error(&e.to_string()),
            );
            return errored;
        }
    };

    match handler.send_msg(ctx, &channel, msg).await {
        Ok(status) => status,
        Err(e) => {
            errored.add_log(
                ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                    .with_error(&e.to_string()),
            );
            errored
        }
    }
}
