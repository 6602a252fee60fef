use crate::harness::{post_json, test_app, test_channel, CA_UUID, FC_UUID, TG_UUID};
use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde_json::json;
use std::sync::Arc;
use switchboard::mock::{MockBackend, QueuedTask};
use switchboard::models::{ChannelEventKind, Direction, Msg, MsgStatus};
use switchboard::urns::Urn;

const FC_RECEIVE: &str =
    "/c/fc/8eb23e93-5ecb-45ba-b726-3b064e0c56ab/receive";
const CA_RECEIVE: &str =
    "/c/ca/c0534f78-b6e9-4f79-8853-11cedfc1f35b/receive";
const CA_STATUS: &str =
    "/c/ca/c0534f78-b6e9-4f79-8853-11cedfc1f35b/status";
const TG_RECEIVE: &str =
    "/c/tg/bd78e176-8fe0-4d2e-9045-d571fb1fcc1e/receive";

fn fc_body() -> String {
    json!({
        "actor": {"actor_type": "user", "actor_id": "882f3926-b292-414b-a411-96380db373cd"},
        "action": "message_create",
        "action_time": "2019-06-21T17:43:20.875Z",
        "data": {"message": {
            "message_parts": [{"text": {"content": "Test 2"}}],
            "actor_id": "882f3926-b292-414b-a411-96380db373cd",
            "id": "7a454fde-c720-4c97-a61d-0ffe70449eb6",
            "channel_id": "c8fddfaf-622a-4a0e-b060-4f3ccbeab606",
            "message_type": "normal",
            "actor_type": "user",
            "created_time": "2019-06-21T17:43:20.866Z"
        }}
    })
    .to_string()
}

fn fc_backend(public_key_b64: &str) -> Arc<MockBackend> {
    let backend = Arc::new(MockBackend::new());
    backend.add_channel(test_channel(
        "FC",
        FC_UUID,
        json!({
            "username": "c8fddfaf-622a-4a0e-b060-4f3ccbeab606",
            "secret": public_key_b64,
            "auth_token": "authtoken",
        }),
    ));
    backend
}

fn ca_backend() -> Arc<MockBackend> {
    let backend = Arc::new(MockBackend::new());
    backend.add_channel(test_channel(
        "CA",
        CA_UUID,
        json!({"auth_token": "token123", "send_url": "https://api.example.com"}),
    ));
    backend
}

#[tokio::test]
async fn test_signed_inbound_accepted() {
    let signing = SigningKey::generate(&mut OsRng);
    let public_key = BASE64.encode(signing.verifying_key().to_bytes());
    let backend = fc_backend(&public_key);
    let app = test_app(backend.clone());

    let body = fc_body();
    let signature = BASE64.encode(signing.sign(body.as_bytes()).to_bytes());

    let (status, response) = post_json(
        &app,
        FC_RECEIVE,
        &[("X-Freshchat-Signature", signature.as_str())],
        &body,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(response.contains("Message Accepted"), "{response}");

    let msgs = backend.written_msgs();
    assert_eq!(msgs.len(), 1);
    assert_eq!(
        msgs[0].urn.as_str(),
        "freshchat:c8fddfaf-622a-4a0e-b060-4f3ccbeab606/882f3926-b292-414b-a411-96380db373cd"
    );
    assert_eq!(msgs[0].text, "Test 2");
    assert_eq!(
        msgs[0].external_id.as_deref(),
        Some("7a454fde-c720-4c97-a61d-0ffe70449eb6")
    );
    assert_eq!(backend.queued_tasks().len(), 1);
}

#[tokio::test]
async fn test_signed_inbound_rejected() {
    let signing = SigningKey::generate(&mut OsRng);
    let public_key = BASE64.encode(signing.verifying_key().to_bytes());
    let backend = fc_backend(&public_key);
    let app = test_app(backend.clone());

    let body = fc_body();
    // signature from the wrong key
    let other = SigningKey::generate(&mut OsRng);
    let signature = BASE64.encode(other.sign(body.as_bytes()).to_bytes());

    let (status, response) = post_json(
        &app,
        FC_RECEIVE,
        &[("X-Freshchat-Signature", signature.as_str())],
        &body,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("unable to verify signature"), "{response}");
    assert!(response.contains(r#""type":"error""#));
    assert!(backend.written_msgs().is_empty());
    assert!(backend.queued_tasks().is_empty());
}

#[tokio::test]
async fn test_missing_signature_rejected() {
    let signing = SigningKey::generate(&mut OsRng);
    let public_key = BASE64.encode(signing.verifying_key().to_bytes());
    let backend = fc_backend(&public_key);
    let app = test_app(backend.clone());

    let (status, response) = post_json(&app, FC_RECEIVE, &[], &fc_body()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("unable to verify signature, missing signature header"));
}

#[tokio::test]
async fn test_malformed_json() {
    let backend = ca_backend();
    let app = test_app(backend.clone());

    let (status, response) = post_json(&app, CA_RECEIVE, &[], "empty").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("unable to parse request JSON"), "{response}");
    assert!(backend.written_msgs().is_empty());
}

fn ca_message_body() -> String {
    json!({
        "instanceId": "79926",
        "messages": [{
            "id": "false_17472822486@c.us_DF38E6A25B42CC8CCE57EC40F",
            "body": "Ok!",
            "type": "chat",
            "senderName": "Ilya",
            "fromMe": false,
            "author": "17472822486@c.us",
            "time": 1504208593
        }]
    })
    .to_string()
}

#[tokio::test]
async fn test_inbound_message_accepted() {
    let backend = ca_backend();
    let app = test_app(backend.clone());

    let (status, response) = post_json(&app, CA_RECEIVE, &[], &ca_message_body()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains("Events Handled"));

    let msgs = backend.written_msgs();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].urn.as_str(), "whatsapp:17472822486");
    assert_eq!(msgs[0].text, "Ok!");
    assert_eq!(msgs[0].contact_name.as_deref(), Some("Ilya"));
    assert_eq!(msgs[0].direction, Direction::Incoming);

    // exactly one durable row, exactly one hand-off task
    assert_eq!(backend.queued_tasks().len(), 1);
    match &backend.queued_tasks()[0] {
        QueuedTask::Legacy {
            task_name,
            org_id,
            sub_queue,
        } => {
            assert_eq!(task_name, "handle_event_task");
            assert_eq!(*org_id, 1);
            assert!(sub_queue.as_deref().unwrap().starts_with("ch:"));
        }
        other => panic!("unexpected task {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_delivery_suppressed() {
    let backend = ca_backend();
    let app = test_app(backend.clone());
    let body = ca_message_body();

    let (first_status, first) = post_json(&app, CA_RECEIVE, &[], &body).await;
    let (second_status, second) = post_json(&app, CA_RECEIVE, &[], &body).await;

    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
    assert!(first.contains(r#""type":"msg""#));
    assert!(second.contains("ignored"), "{second}");

    assert_eq!(backend.written_msgs().len(), 1);
    assert_eq!(backend.queued_tasks().len(), 1);
}

#[tokio::test]
async fn test_events_processed_in_declared_order() {
    let backend = ca_backend();
    let app = test_app(backend.clone());

    let body = json!({
        "instanceId": "79926",
        "messages": [
            {"id": "m-1", "body": "first", "type": "chat", "fromMe": false,
             "author": "17472822486@c.us", "time": 1504208593},
            {"id": "m-2", "body": "second", "type": "chat", "fromMe": false,
             "author": "17472822486@c.us", "time": 1504208594}
        ]
    })
    .to_string();

    let (status, _) = post_json(&app, CA_RECEIVE, &[], &body).await;
    assert_eq!(status, StatusCode::OK);

    let msgs = backend.written_msgs();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].text, "first");
    assert_eq!(msgs[1].text, "second");
    assert_eq!(backend.queued_tasks().len(), 2);
}

#[tokio::test]
async fn test_own_messages_ignored() {
    let backend = ca_backend();
    let app = test_app(backend.clone());

    let body = json!({
        "instanceId": "79926",
        "messages": [{
            "id": "m-1", "body": "from us", "type": "chat", "fromMe": true,
            "author": "17472822486@c.us", "time": 1504208593
        }]
    })
    .to_string();

    let (status, _) = post_json(&app, CA_RECEIVE, &[], &body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(backend.written_msgs().is_empty());
    assert!(backend.queued_tasks().is_empty());
}

#[tokio::test]
async fn test_no_actionable_content_ignored() {
    let backend = ca_backend();
    let app = test_app(backend.clone());

    let (status, response) = post_json(&app, CA_RECEIVE, &[], r#"{"messages": []}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains("Ignoring request, no message"), "{response}");
}

#[tokio::test]
async fn test_ack_for_unknown_external_id() {
    let backend = ca_backend();
    let app = test_app(backend.clone());

    let body = json!({
        "instanceId": "79926",
        "ack": [{"id": "never-seen", "status": "delivered"}]
    })
    .to_string();

    let (status, response) = post_json(&app, CA_RECEIVE, &[], &body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains(r#"{"type":"info","info":"message not found, ignored"}"#), "{response}");
    assert!(backend.status_writes().is_empty());
}

#[tokio::test]
async fn test_ack_updates_known_message() {
    let backend = ca_backend();
    let channel = test_channel(
        "CA",
        CA_UUID,
        json!({"auth_token": "token123"}),
    );
    let urn = Urn::from_whatsapp("17472822486").unwrap();
    let mut sent = Msg::outgoing(&channel, urn, "hello");
    sent.id = 99;
    sent.external_id = Some("prov-42".to_string());
    sent.status = MsgStatus::Sent;
    backend.add_sent_msg(sent);

    let app = test_app(backend.clone());
    let body = json!({
        "instanceId": "79926",
        "ack": [{"id": "prov-42", "status": "delivered"}]
    })
    .to_string();

    // the dedicated status action consumes acks too
    let (status, response) = post_json(&app, CA_STATUS, &[], &body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains(r#""type":"status""#), "{response}");
    assert_eq!(backend.written_msgs()[0].status, MsgStatus::Delivered);
}

#[tokio::test]
async fn test_unknown_channel_uuid() {
    let backend = ca_backend();
    let app = test_app(backend.clone());

    let (status, response) = post_json(
        &app,
        "/c/ca/7c38b143-1111-4b3a-9c86-eb74be101111/receive",
        &[],
        &ca_message_body(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("channel not found"));
}

#[tokio::test]
async fn test_unknown_channel_type_is_404() {
    let backend = ca_backend();
    let app = test_app(backend.clone());
    let (status, _) = post_json(
        &app,
        "/c/xx/c0534f78-b6e9-4f79-8853-11cedfc1f35b/receive",
        &[],
        "{}",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_undeclared_action_is_404() {
    let backend = ca_backend();
    let app = test_app(backend.clone());
    let (status, _) = post_json(&app, CA_RECEIVE.replace("/receive", "/register").as_str(), &[], "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn tg_backend() -> Arc<MockBackend> {
    let backend = Arc::new(MockBackend::new());
    backend.add_channel(test_channel(
        "TG",
        TG_UUID,
        json!({"auth_token": "a123"}),
    ));
    backend
}

#[tokio::test]
async fn test_telegram_message_accepted() {
    let backend = tg_backend();
    let app = test_app(backend.clone());

    let body = json!({
        "update_id": 174114370,
        "message": {
            "message_id": 41,
            "from": {"id": 3527065, "first_name": "Nic", "last_name": "Pottier"},
            "chat": {"id": 3527065, "type": "private"},
            "date": 1454119029,
            "text": "Hello World"
        }
    })
    .to_string();

    let (status, response) = post_json(&app, TG_RECEIVE, &[], &body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains("Message Accepted"));

    let msgs = backend.written_msgs();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].urn.as_str(), "telegram:3527065");
    assert_eq!(msgs[0].contact_name.as_deref(), Some("Nic Pottier"));
    assert_eq!(msgs[0].external_id.as_deref(), Some("41"));
}

#[tokio::test]
async fn test_telegram_start_creates_conversation_event() {
    let backend = tg_backend();
    let app = test_app(backend.clone());

    let body = json!({
        "update_id": 174114371,
        "message": {
            "message_id": 42,
            "from": {"id": 3527065, "first_name": "Nic"},
            "chat": {"id": 3527065, "type": "private"},
            "date": 1454119029,
            "text": "/start"
        }
    })
    .to_string();

    let (status, response) = post_json(&app, TG_RECEIVE, &[], &body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains("conversation started"), "{response}");

    assert!(backend.written_msgs().is_empty());
    let events = backend.channel_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChannelEventKind::NewConversation);
    assert_eq!(backend.queued_tasks().len(), 1);
}

#[tokio::test]
async fn test_telegram_update_without_message_ignored() {
    let backend = tg_backend();
    let app = test_app(backend.clone());

    let (status, response) = post_json(&app, TG_RECEIVE, &[], r#"{"update_id": 1}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains("Ignoring request, no message"));
}
