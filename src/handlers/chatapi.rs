use crate::backend::BackendError;
use crate::envelope::{self, DataItem};
use crate::handlers::{decode_json, execute_logged, Capabilities, ChannelHandler, HandlerContext};
use crate::models::{
    split_attachment, Channel, ChannelLog, ChannelType, Msg, MsgStatus, StatusUpdate,
    CONFIG_AUTH_TOKEN, CONFIG_SEND_URL,
};
use crate::urns::Urn;
use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Adapter for the "CA" WhatsApp aggregator. One webhook carries message
/// and ack arrays side by side; sends go out one HTTP call per part with
/// the API token as a query parameter.
pub struct ChatApiHandler {
    channel_type: ChannelType,
}

impl ChatApiHandler {
    pub fn new() -> ChatApiHandler {
        ChatApiHandler {
            channel_type: ChannelType::new("CA"),
        }
    }
}

impl Default for ChatApiHandler {
    fn default() -> Self {
        ChatApiHandler::new()
    }
}

#[derive(Debug, Deserialize)]
struct MoPayload {
    #[serde(rename = "instanceId", default)]
    instance_id: String,
    #[serde(default)]
    messages: Vec<MoMessage>,
    #[serde(default)]
    ack: Vec<MoAck>,
}

#[derive(Debug, Deserialize)]
struct MoMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    body: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(rename = "senderName", default)]
    sender_name: String,
    #[serde(rename = "fromMe", default)]
    from_me: bool,
    #[serde(default)]
    author: String,
    #[serde(default)]
    time: i64,
    #[serde(default)]
    caption: String,
}

#[derive(Debug, Deserialize)]
struct MoAck {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Serialize)]
struct SendMsgPayload<'a> {
    phone: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct SendFilePayload<'a> {
    phone: &'a str,
    body: &'a str,
    filename: &'a str,
    caption: &'a str,
}

fn ack_status(raw: &str) -> MsgStatus {
    match raw {
        "sent" => MsgStatus::Sent,
        "delivered" => MsgStatus::Delivered,
        _ => MsgStatus::Queued,
    }
}

impl ChatApiHandler {
    async fn send_part(
        &self,
        ctx: &HandlerContext,
        msg: &Msg,
        send_url: &str,
        token: &str,
        path: &str,
        payload: &impl Serialize,
        status: &mut StatusUpdate,
    ) -> bool {
        let url = format!("{}/{}?token={}", send_url, path, token);
        let request = match ctx
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(payload)
            .build()
        {
            Ok(request) => request,
            Err(e) => {
                status.add_log(
                    ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                        .with_error(&e.to_string()),
                );
                return false;
            }
        };

        let (mut log, result) =
            execute_logged(&ctx.http, request, "Message Sent", msg.channel_uuid, Some(msg.id))
                .await;

        let ok = match result {
            Ok((_, body)) => {
                let external_id = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_str().map(String::from)));
                match external_id {
                    Some(external_id) => {
                        status.set_external_id(&external_id);
                        true
                    }
                    None => {
                        log.error = Some("no 'id' in response".to_string());
                        false
                    }
                }
            }
            Err(_) => false,
        };
        status.add_log(log);
        ok
    }
}

#[async_trait]
impl ChannelHandler for ChatApiHandler {
    fn channel_type(&self) -> ChannelType {
        self.channel_type.clone()
    }

    fn name(&self) -> &'static str {
        "Chat API"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            receive: true,
            send: true,
            verify_signature: false,
            fetch_attachment: false,
        }
    }

    fn actions(&self) -> &'static [&'static str] {
        &["receive", "status"]
    }

    async fn receive(
        &self,
        ctx: &HandlerContext,
        channel: &Channel,
        action: &str,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response> {
        let payload: MoPayload = match decode_json(body) {
            Ok(payload) => payload,
            Err(e) => return Ok(envelope::bad_request(&e.to_string())),
        };

        if payload.instance_id.is_empty() {
            return Ok(envelope::ignored("Ignoring request, no message"));
        }

        let mut data = Vec::new();

        // the dedicated status action only consumes acks
        if action == "receive" {
            for message in &payload.messages {
                if message.from_me {
                    continue;
                }

                let number = message.author.replace("@c.us", "");
                let urn = match Urn::from_whatsapp(&number) {
                    Ok(urn) => urn,
                    Err(e) => return Ok(envelope::bad_request(&e.to_string())),
                };

                let date = Utc
                    .timestamp_opt(message.time, 0)
                    .single()
                    .unwrap_or_else(Utc::now);

                // an image delivery carries the media URL in body and the
                // text in caption
                let is_attachment = message.kind == "image";
                let text = if is_attachment {
                    message.caption.as_str()
                } else {
                    message.body.as_str()
                };

                let mut msg = Msg::incoming(channel, urn, text)
                    .with_external_id(&message.id)
                    .with_received_on(date)
                    .with_contact_name(&message.sender_name);
                if is_attachment {
                    msg = msg.with_attachment(message.body.clone());
                }

                if ctx.backend.check_external_id_seen(&msg) {
                    data.push(DataItem::info("message already accepted, ignored"));
                    continue;
                }

                ctx.backend.write_msg(&mut msg).await?;
                ctx.backend.write_external_id_seen(&msg);
                data.push(DataItem::msg_received(&msg));
            }
        }

        for ack in &payload.ack {
            let status = StatusUpdate::for_external_id(channel, &ack.id, ack_status(&ack.status));
            match ctx.backend.write_msg_status(&status).await {
                Ok(()) => data.push(DataItem::status(&status)),
                Err(BackendError::MsgNotFound) => {
                    data.push(DataItem::info("message not found, ignored"));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(envelope::events_handled(data))
    }

    async fn send_msg(
        &self,
        ctx: &HandlerContext,
        channel: &Channel,
        msg: &Msg,
    ) -> Result<StatusUpdate> {
        let mut status = StatusUpdate::for_id(channel, msg.id, MsgStatus::Errored);

        let Some(token) = channel
            .config_str(CONFIG_AUTH_TOKEN)
            .filter(|v| !v.is_empty())
            .map(String::from)
        else {
            status.add_log(
                ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                    .with_error("invalid auth token config"),
            );
            return Ok(status);
        };
        let Some(send_url) = channel
            .config_str(CONFIG_SEND_URL)
            .filter(|v| !v.is_empty())
            .map(String::from)
        else {
            status.add_log(
                ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                    .with_error("invalid send url config"),
            );
            return Ok(status);
        };

        // a lone attachment carries the text as its caption
        let caption = if msg.attachments.len() == 1 {
            msg.text.as_str()
        } else {
            ""
        };

        let phone = msg.urn.path();
        let mut parts_sent = 0;
        let mut all_ok = true;

        if !msg.text.is_empty() && caption.is_empty() {
            let payload = SendMsgPayload {
                phone,
                body: &msg.text,
            };
            let ok = self
                .send_part(ctx, msg, &send_url, &token, "sendMessage", &payload, &mut status)
                .await;
            parts_sent += 1;
            all_ok &= ok;
        }

        for attachment in &msg.attachments {
            let (content_type, media_url) = split_attachment(attachment);
            match content_type.split('/').next().unwrap_or("") {
                "image" => {
                    let filename = media_url.rsplit('/').next().unwrap_or("file.jpg");
                    let payload = SendFilePayload {
                        phone,
                        body: media_url,
                        filename,
                        caption,
                    };
                    let ok = self
                        .send_part(ctx, msg, &send_url, &token, "sendFile", &payload, &mut status)
                        .await;
                    parts_sent += 1;
                    all_ok &= ok;
                }
                other => {
                    status.add_log(
                        ChannelLog::new(
                            &format!("Unknown media type: {}", other),
                            msg.channel_uuid,
                            Some(msg.id),
                        )
                        .with_error(&format!("unknown media type: {}", other)),
                    );
                    parts_sent += 1;
                    all_ok = false;
                }
            }
        }

        if parts_sent == 0 {
            status.add_log(
                ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                    .with_error("empty message"),
            );
        } else if all_ok {
            status.set_status(MsgStatus::Wired);
        }
        Ok(status)
    }
}
