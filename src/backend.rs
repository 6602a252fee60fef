use crate::models::{Channel, ChannelEvent, ChannelLog, ChannelType, Msg, StatusUpdate};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("channel not found")]
    ChannelNotFound,
    #[error("message not found")]
    MsgNotFound,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("{0}")]
    Other(String),
}

/// The persistence port. The gateway core only ever talks to this trait;
/// `db::DbBackend` implements it against Postgres/SQLite + Redis and
/// `mock::MockBackend` implements it in memory for the test suite.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Resolve a configured channel by type + UUID.
    async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: Uuid,
    ) -> Result<Channel, BackendError>;

    /// Persist an incoming message. Creates the owning contact and URN on
    /// first sight, attaches the URN idempotently otherwise, assigns the
    /// internal id, and enqueues exactly one hand-off task for the
    /// downstream worker.
    async fn write_msg(&self, msg: &mut Msg) -> Result<(), BackendError>;

    /// Whether this (channel, external id) pair was already accepted.
    fn check_external_id_seen(&self, msg: &Msg) -> bool;

    /// Mark the pair as accepted. Only called after `write_msg` succeeds,
    /// so a retried delivery either re-persists or is suppressed, never
    /// half-applied.
    fn write_external_id_seen(&self, msg: &Msg);

    /// Persist a status transition. Regressions are dropped; an update for
    /// an external id we have never seen is `MsgNotFound`.
    async fn write_msg_status(&self, status: &StatusUpdate) -> Result<(), BackendError>;

    /// Persist a channel event and enqueue its hand-off task.
    async fn write_channel_event(&self, event: &mut ChannelEvent) -> Result<(), BackendError>;

    async fn write_channel_log(&self, log: &ChannelLog) -> Result<(), BackendError>;

    /// Claim the next outgoing message ready to send, if any.
    async fn pop_next_outgoing_msg(&self) -> Result<Option<Msg>, BackendError>;

    /// Record the outcome of a send attempt. An errored outcome re-queues
    /// with backoff until the attempt budget is exhausted, then fails the
    /// message for good.
    async fn mark_outgoing_msg_complete(
        &self,
        msg: &Msg,
        status: &StatusUpdate,
    ) -> Result<(), BackendError>;
}
