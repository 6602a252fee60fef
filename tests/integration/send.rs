use crate::harness::{handler_context, spawn_provider, test_channel, CA_UUID, FC_UUID, TG_UUID};
use axum::http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use switchboard::backend::Backend;
use switchboard::handlers::{chatapi::ChatApiHandler, freshchat::FreshchatHandler, telegram::TelegramHandler, ChannelHandler};
use switchboard::mock::MockBackend;
use switchboard::models::{Channel, Msg, MsgStatus};
use switchboard::sender;
use switchboard::urns::Urn;
use switchboard::{default_registry};

fn ca_channel(send_url: &str) -> Channel {
    test_channel(
        "CA",
        CA_UUID,
        json!({"auth_token": "token123", "send_url": send_url}),
    )
}

fn ca_msg(channel: &Channel, text: &str, attachments: Vec<String>) -> Msg {
    let urn = Urn::from_whatsapp("17472822486").unwrap();
    let mut msg = Msg::outgoing(channel, urn, text);
    msg.id = 10;
    msg.attachments = attachments;
    msg
}

#[tokio::test]
async fn test_plain_send() {
    let (url, records) = spawn_provider(StatusCode::OK, r#"{"id": "ext-abc"}"#).await;
    let channel = ca_channel(&url);
    let ctx = handler_context(Arc::new(MockBackend::new()));
    let msg = ca_msg(&channel, "Simple Message ☺", vec![]);

    let status = ChatApiHandler::new().send_msg(&ctx, &channel, &msg).await.unwrap();

    assert_eq!(status.status, MsgStatus::Wired);
    assert_eq!(status.external_id.as_deref(), Some("ext-abc"));
    assert_eq!(status.logs.len(), 1);
    assert_eq!(status.logs[0].status_code, 200);

    let recorded = records.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].path, "/sendMessage?token=token123");
    let body: Value = serde_json::from_str(&recorded[0].body).unwrap();
    assert_eq!(body["phone"], "17472822486");
    assert_eq!(body["body"], "Simple Message ☺");
}

#[tokio::test]
async fn test_single_attachment_carries_text_as_caption() {
    let (url, records) = spawn_provider(StatusCode::OK, r#"{"id": "ext-abc"}"#).await;
    let channel = ca_channel(&url);
    let ctx = handler_context(Arc::new(MockBackend::new()));
    let msg = ca_msg(
        &channel,
        "Simple Message ☺",
        vec!["image/jpeg:https://foo.bar/image.jpg".to_string()],
    );

    let status = ChatApiHandler::new().send_msg(&ctx, &channel, &msg).await.unwrap();
    assert_eq!(status.status, MsgStatus::Wired);
    assert_eq!(status.logs.len(), 1);

    let recorded = records.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].path, "/sendFile?token=token123");
    let body: Value = serde_json::from_str(&recorded[0].body).unwrap();
    assert_eq!(body["body"], "https://foo.bar/image.jpg");
    assert_eq!(body["caption"], "Simple Message ☺");
}

#[tokio::test]
async fn test_text_and_two_attachments_is_three_parts() {
    let (url, records) = spawn_provider(StatusCode::OK, r#"{"id": "ext-last"}"#).await;
    let channel = ca_channel(&url);
    let ctx = handler_context(Arc::new(MockBackend::new()));
    let msg = ca_msg(
        &channel,
        "Simple Message ☺",
        vec![
            "image/jpeg:https://foo.bar/one.jpg".to_string(),
            "image/png:https://foo.bar/two.png".to_string(),
        ],
    );

    let status = ChatApiHandler::new().send_msg(&ctx, &channel, &msg).await.unwrap();

    assert_eq!(status.status, MsgStatus::Wired);
    assert_eq!(status.logs.len(), 3);
    // the most recent successful part owns the external id
    assert_eq!(status.external_id.as_deref(), Some("ext-last"));

    let recorded = records.lock().unwrap();
    assert_eq!(recorded.len(), 3);
    assert_eq!(recorded[0].path, "/sendMessage?token=token123");
    assert_eq!(recorded[1].path, "/sendFile?token=token123");
    assert_eq!(recorded[2].path, "/sendFile?token=token123");
    // text first, then attachments in declared order
    assert!(recorded[1].body.contains("one.jpg"));
    assert!(recorded[2].body.contains("two.png"));
}

#[tokio::test]
async fn test_provider_failure_is_errored_with_log() {
    let (url, _records) = spawn_provider(StatusCode::BAD_GATEWAY, "gateway error").await;
    let channel = ca_channel(&url);
    let ctx = handler_context(Arc::new(MockBackend::new()));
    let msg = ca_msg(&channel, "hello", vec![]);

    let status = ChatApiHandler::new().send_msg(&ctx, &channel, &msg).await.unwrap();
    assert_eq!(status.status, MsgStatus::Errored);
    assert_eq!(status.logs.len(), 1);
    assert_eq!(status.logs[0].status_code, 502);
    assert!(status.logs[0].error.is_some());
}

#[tokio::test]
async fn test_success_body_without_id_fails_part() {
    let (url, _records) = spawn_provider(StatusCode::OK, r#"{"ok": true}"#).await;
    let channel = ca_channel(&url);
    let ctx = handler_context(Arc::new(MockBackend::new()));
    let msg = ca_msg(&channel, "hello", vec![]);

    let status = ChatApiHandler::new().send_msg(&ctx, &channel, &msg).await.unwrap();
    assert_eq!(status.status, MsgStatus::Errored);
    assert_eq!(
        status.logs[0].error.as_deref(),
        Some("no 'id' in response")
    );
}

#[tokio::test]
async fn test_missing_config_means_no_http_call() {
    let (url, records) = spawn_provider(StatusCode::OK, r#"{"id": "x"}"#).await;
    let channel = test_channel("CA", CA_UUID, json!({"send_url": url}));
    let ctx = handler_context(Arc::new(MockBackend::new()));
    let msg = ca_msg(&channel, "hello", vec![]);

    let status = ChatApiHandler::new().send_msg(&ctx, &channel, &msg).await.unwrap();
    assert_eq!(status.status, MsgStatus::Errored);
    assert_eq!(status.logs.len(), 1);
    assert_eq!(
        status.logs[0].error.as_deref(),
        Some("invalid auth token config")
    );
    assert!(records.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_failure_is_errored() {
    // provider accepts the first part then hands back garbage: with a
    // single canned response we simulate by returning a body with no id,
    // so every part fails and the aggregate must be errored
    let (url, records) = spawn_provider(StatusCode::OK, "not json").await;
    let channel = ca_channel(&url);
    let ctx = handler_context(Arc::new(MockBackend::new()));
    let msg = ca_msg(
        &channel,
        "text part",
        vec!["image/jpeg:https://foo.bar/one.jpg".to_string(), "image/jpeg:https://foo.bar/two.jpg".to_string()],
    );

    let status = ChatApiHandler::new().send_msg(&ctx, &channel, &msg).await.unwrap();
    assert_eq!(status.status, MsgStatus::Errored);
    assert_eq!(status.logs.len(), 3);
    assert_eq!(records.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_freshchat_sends_all_parts_in_one_call() {
    let (url, records) = spawn_provider(StatusCode::OK, "").await;
    let channel = test_channel(
        "FC",
        FC_UUID,
        json!({
            "username": "c8fddfaf-622a-4a0e-b060-4f3ccbeab606",
            "auth_token": "bearer-token",
            "send_url": url,
        }),
    );
    let ctx = handler_context(Arc::new(MockBackend::new()));

    let urn = Urn::from_freshchat(
        "0534f78-b6e9-4f79-8853-11cedfc1f35b/c8fddfaf-622a-4a0e-b060-4f3ccbeab606",
    )
    .unwrap();
    let mut msg = Msg::outgoing(&channel, urn, "Simple Message ☺");
    msg.id = 11;
    msg.attachments = vec!["image/jpeg:https://foo.bar/image.jpg".to_string()];

    let status = FreshchatHandler::new(false)
        .send_msg(&ctx, &channel, &msg)
        .await
        .unwrap();

    assert_eq!(status.status, MsgStatus::Wired);
    assert_eq!(status.logs.len(), 1);
    assert!(status.external_id.is_none());

    let recorded = records.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    let body: Value = serde_json::from_str(&recorded[0].body).unwrap();
    assert_eq!(
        body["messages"][0]["message_parts"][0]["text"]["content"],
        "Simple Message ☺"
    );
    assert_eq!(
        body["messages"][0]["message_parts"][1]["image"]["url"],
        "https://foo.bar/image.jpg"
    );
    assert_eq!(body["messages"][0]["actor_type"], "agent");
    assert_eq!(body["channel_id"], "0534f78-b6e9-4f79-8853-11cedfc1f35b");
    assert_eq!(
        body["users"][0]["id"],
        "c8fddfaf-622a-4a0e-b060-4f3ccbeab606"
    );
}

#[tokio::test]
async fn test_telegram_quick_replies_on_first_part_only() {
    let (url, records) = spawn_provider(
        StatusCode::OK,
        r#"{"ok": true, "result": {"message_id": 77}}"#,
    )
    .await;
    let channel = test_channel(
        "TG",
        TG_UUID,
        json!({"auth_token": "a123", "send_url": url}),
    );
    let ctx = handler_context(Arc::new(MockBackend::new()));

    let urn = Urn::from_telegram("3527065").unwrap();
    let mut msg = Msg::outgoing(&channel, urn, "pick one");
    msg.id = 12;
    msg.quick_replies = vec!["Yes".to_string(), "No".to_string()];
    msg.attachments = vec![
        "image/jpeg:https://foo.bar/one.jpg".to_string(),
        "image/jpeg:https://foo.bar/two.jpg".to_string(),
    ];

    let status = TelegramHandler::new().send_msg(&ctx, &channel, &msg).await.unwrap();
    assert_eq!(status.status, MsgStatus::Wired);
    assert_eq!(status.external_id.as_deref(), Some("77"));
    assert_eq!(status.logs.len(), 3);

    let recorded = records.lock().unwrap();
    assert_eq!(recorded.len(), 3);
    assert!(recorded[0].body.contains("reply_markup"));
    assert!(!recorded[1].body.contains("reply_markup"));
    assert!(!recorded[2].body.contains("reply_markup"));
}

#[tokio::test]
async fn test_driver_records_wired_outcome() {
    let (url, _records) = spawn_provider(StatusCode::OK, r#"{"id": "ext-1"}"#).await;
    let backend = Arc::new(MockBackend::new());
    let channel = ca_channel(&url);
    backend.add_channel(channel.clone());

    let msg = ca_msg(&channel, "driver test", vec![]);
    backend.add_outgoing_msg(msg);

    let ctx = handler_context(backend.clone());
    let registry = default_registry();

    let claimed = backend.pop_next_outgoing_msg().await.unwrap().unwrap();
    sender::send_msg(&ctx, &registry, &claimed).await.unwrap();

    let completed = backend.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].1, MsgStatus::Wired);
    // the channel log made it to the backend
    assert_eq!(backend.channel_logs().len(), 1);
}

#[tokio::test]
async fn test_driver_requeues_then_fails() {
    let (url, _records) = spawn_provider(StatusCode::INTERNAL_SERVER_ERROR, "down").await;
    let backend = Arc::new(MockBackend::new());
    let channel = ca_channel(&url);
    backend.add_channel(channel.clone());
    backend.add_outgoing_msg(ca_msg(&channel, "doomed", vec![]));

    let ctx = handler_context(backend.clone());
    let registry = default_registry();

    // drive until the attempt budget runs out
    while let Some(msg) = backend.pop_next_outgoing_msg().await.unwrap() {
        sender::send_msg(&ctx, &registry, &msg).await.unwrap();
    }

    let completed = backend.completed();
    assert_eq!(completed.last().unwrap().1, MsgStatus::Failed);
    // one channel log per attempt
    assert_eq!(backend.channel_logs().len(), completed.len());
}
