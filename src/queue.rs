use crate::models::{Channel, ChannelEvent, ChannelEventKind, Contact, Msg};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Subtracted from a fresh task's score so an org waking from idle sorts
/// far below every busy org's head and is serviced promptly. As queued
/// work ages it rises relative to fresh arrivals, which approximates fair
/// queueing without per-org counters.
pub const FAIR_SHARE_OFFSET: f64 = 10_000_000.0;

pub const LEGACY_QUEUE: &str = "handler";
pub const LEGACY_TASK: &str = "handle_event_task";
pub const MAILROOM_QUEUE: &str = "handler";

/// Unix seconds as a float with microsecond precision. Every producer
/// must format scores the same way or the worker's ordering breaks, so
/// this is the single place scores are rendered.
pub fn score_at(now: DateTime<Utc>) -> String {
    let epoch = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0;
    format!("{:.5}", epoch)
}

pub fn offset_score_at(now: DateTime<Utc>) -> String {
    let epoch = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0;
    format!("{:.5}", epoch - FAIR_SHARE_OFFSET)
}

/// The wake-up message pushed onto the Celery broker list. Protocol v1:
/// the task call is JSON, base64-wrapped in `body`, and the outer message
/// carries the routing properties an unmodified Celery worker expects.
pub fn celery_message(queue_name: &str, task_name: &str, task_id: Uuid) -> String {
    let body = json!({
        "id": task_id.to_string(),
        "task": task_name,
        "args": [],
        "kwargs": {},
        "retries": 0,
        "eta": Value::Null,
    });
    let encoded = BASE64.encode(body.to_string());
    json!({
        "body": encoded,
        "content-encoding": "utf-8",
        "content-type": "application/json",
        "headers": {},
        "properties": {
            "body_encoding": "base64",
            "correlation_id": task_id.to_string(),
            "delivery_info": {"exchange": queue_name, "routing_key": queue_name},
            "delivery_mode": 2,
            "delivery_tag": task_id.to_string(),
        },
    })
    .to_string()
}

#[derive(Debug, Serialize)]
struct MailroomTask<'a> {
    #[serde(rename = "type")]
    task_type: &'a str,
    org_id: i64,
    task: Value,
    queued_on: DateTime<Utc>,
}

/// Enqueue onto the legacy per-org fair-share queue. One MULTI/EXEC:
/// optional sub-queue ZADD at the real arrival score, the per-org ZADD at
/// the offset score, a no-op ZINCRBY to surface the org in the active
/// set, and the Celery wake-up push. Nothing is visible unless the whole
/// transaction lands.
pub async fn queue_legacy_task(
    conn: &mut ConnectionManager,
    queue_name: &str,
    task_name: &str,
    org_id: i64,
    sub_queue: Option<&str>,
    body: &Value,
) -> redis::RedisResult<()> {
    let body_json = body.to_string();
    let now = Utc::now();

    let mut pipe = redis::pipe();
    pipe.atomic();
    if let Some(sub_queue) = sub_queue {
        pipe.cmd("ZADD")
            .arg(sub_queue)
            .arg(score_at(now))
            .arg(&body_json)
            .ignore();
    }
    pipe.cmd("ZADD")
        .arg(format!("{}:{}", task_name, org_id))
        .arg(offset_score_at(now))
        .arg(&body_json)
        .ignore();
    pipe.cmd("ZINCRBY")
        .arg(format!("{}:active", task_name))
        .arg(0)
        .arg(org_id)
        .ignore();
    pipe.cmd("LPUSH")
        .arg(queue_name)
        .arg(celery_message(queue_name, task_name, Uuid::new_v4()))
        .ignore();
    pipe.query_async::<()>(conn).await
}

/// Enqueue onto the mailroom queue: RPUSH the event onto the contact's
/// FIFO, point the per-org dispatch queue at the contact, mark the org
/// active. One MULTI/EXEC.
pub async fn queue_mailroom_task(
    conn: &mut ConnectionManager,
    task_type: &str,
    org_id: i64,
    contact_id: i64,
    body: Value,
) -> redis::RedisResult<()> {
    let event_task = MailroomTask {
        task_type,
        org_id,
        task: body,
        queued_on: Utc::now(),
    };
    let contact_task = MailroomTask {
        task_type: "handle_contact_event",
        org_id,
        task: json!({"contact_id": contact_id}),
        queued_on: Utc::now(),
    };

    let event_json = serde_json::to_string(&event_task)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string())))?;
    let contact_json = serde_json::to_string(&contact_task)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string())))?;

    let now = Utc::now();
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("RPUSH")
        .arg(format!("c:{}:{}", org_id, contact_id))
        .arg(&event_json)
        .ignore()
        .cmd("ZADD")
        .arg(format!("{}:{}", MAILROOM_QUEUE, org_id))
        .arg(offset_score_at(now))
        .arg(&contact_json)
        .ignore()
        .cmd("ZINCRBY")
        .arg(format!("{}:active", MAILROOM_QUEUE))
        .arg(0)
        .arg(org_id)
        .ignore();
    pipe.query_async::<()>(conn).await
}

/// Hand an accepted incoming message to the downstream worker. Orgs
/// migrated to the flow server go through the mailroom queue; everyone
/// else through the legacy handler queue with a per-contact sub-queue.
pub async fn queue_msg_handling(
    conn: &mut ConnectionManager,
    celery_queue: &str,
    channel: &Channel,
    contact: &Contact,
    msg: &Msg,
) -> redis::RedisResult<()> {
    if channel.flow_server_enabled {
        let body = json!({
            "contact_id": contact.id,
            "org_id": channel.org_id,
            "channel_id": channel.id,
            "msg_id": msg.id,
            "msg_uuid": msg.uuid.to_string(),
            "msg_external_id": msg.external_id.clone().unwrap_or_default(),
            "urn": msg.urn.to_string(),
            "urn_id": msg.contact_urn_id.unwrap_or_default(),
            "text": msg.text,
            "attachments": msg.attachments,
            "new_contact": contact.is_new,
        });
        return queue_mailroom_task(conn, "msg_event", channel.org_id, contact.id, body).await;
    }

    let body = json!({
        "type": "msg",
        "id": msg.id,
        "contact_id": contact.id,
        "new_message": true,
        "new_contact": contact.is_new,
    });
    let sub_queue = format!("ch:{}", contact.id);
    queue_legacy_task(
        conn,
        celery_queue,
        LEGACY_TASK,
        channel.org_id,
        Some(&sub_queue),
        &body,
    )
    .await
}

pub fn mailroom_event_task_type(kind: ChannelEventKind) -> &'static str {
    match kind {
        ChannelEventKind::StopContact => "stop_event",
        ChannelEventKind::WelcomeMessage => "welcome_message",
        ChannelEventKind::Referral => "referral",
        ChannelEventKind::NewConversation => "new_conversation",
    }
}

/// Hand a channel event to the downstream worker. Each event kind maps to
/// its own mailroom task type; legacy orgs get a generic channel_event
/// task.
pub async fn queue_channel_event(
    conn: &mut ConnectionManager,
    celery_queue: &str,
    channel: &Channel,
    contact: &Contact,
    event: &ChannelEvent,
    event_id: i64,
) -> redis::RedisResult<()> {
    if channel.flow_server_enabled {
        let task_type = mailroom_event_task_type(event.kind);
        let body = match event.kind {
            ChannelEventKind::StopContact => {
                json!({"org_id": channel.org_id, "contact_id": contact.id})
            }
            ChannelEventKind::WelcomeMessage => {
                json!({
                    "org_id": channel.org_id,
                    "contact_id": contact.id,
                    "urn_id": event.contact_urn_id.unwrap_or_default(),
                    "channel_id": channel.id,
                    "new_contact": contact.is_new,
                })
            }
            ChannelEventKind::Referral | ChannelEventKind::NewConversation => {
                json!({
                    "org_id": channel.org_id,
                    "contact_id": contact.id,
                    "urn_id": event.contact_urn_id.unwrap_or_default(),
                    "channel_id": channel.id,
                    "extra": event.extra,
                    "new_contact": contact.is_new,
                })
            }
        };
        return queue_mailroom_task(conn, task_type, channel.org_id, contact.id, body).await;
    }

    let body = json!({
        "type": "channel_event",
        "contact_id": contact.id,
        "event_id": event_id,
    });
    queue_legacy_task(conn, celery_queue, LEGACY_TASK, channel.org_id, None, &body).await
}
