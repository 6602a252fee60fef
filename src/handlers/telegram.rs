use crate::envelope::{self, DataItem};
use crate::handlers::{decode_json, execute_logged, Capabilities, ChannelHandler, HandlerContext};
use crate::models::{
    join_attachment, name_from_parts, split_attachment, Channel, ChannelEvent, ChannelEventKind,
    ChannelLog, ChannelType, Msg, MsgStatus, StatusUpdate, CONFIG_AUTH_TOKEN, CONFIG_SEND_URL,
};
use crate::urns::Urn;
use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

const API_URL: &str = "https://api.telegram.org";

fn api_base(channel: &Channel) -> &str {
    channel
        .config_str(CONFIG_SEND_URL)
        .filter(|v| !v.is_empty())
        .unwrap_or(API_URL)
}

/// Adapter for the "TG" bot API. Updates arrive over a webhook; sends use
/// sendMessage/sendPhoto/sendDocument, one call per part, with the bot's
/// reply keyboard carrying quick replies on the first part.
pub struct TelegramHandler {
    channel_type: ChannelType,
}

impl TelegramHandler {
    pub fn new() -> TelegramHandler {
        TelegramHandler {
            channel_type: ChannelType::new("TG"),
        }
    }
}

impl Default for TelegramHandler {
    fn default() -> Self {
        TelegramHandler::new()
    }
}

#[derive(Debug, Deserialize)]
struct MoUpdate {
    #[serde(default)]
    update_id: i64,
    message: Option<MoMessage>,
}

#[derive(Debug, Deserialize)]
struct MoMessage {
    message_id: i64,
    from: Option<MoUser>,
    chat: MoChat,
    #[serde(default)]
    date: i64,
    text: Option<String>,
    #[serde(default)]
    photo: Vec<MoPhoto>,
    document: Option<MoDocument>,
}

#[derive(Debug, Default, Deserialize)]
struct MoUser {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct MoChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct MoPhoto {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct MoDocument {
    file_id: String,
    mime_type: Option<String>,
}

impl TelegramHandler {
    /// Turn a file id into a fetchable URL via getFile. Telegram file
    /// paths are only valid for an hour, so this happens at receive time.
    async fn resolve_file_url(
        &self,
        ctx: &HandlerContext,
        base: &str,
        token: &str,
        file_id: &str,
    ) -> Option<String> {
        let url = format!("{}/bot{}/getFile", base, token);
        let response = ctx
            .http
            .post(&url)
            .json(&json!({"file_id": file_id}))
            .send()
            .await
            .ok()?;
        let value: Value = response.json().await.ok()?;
        if value.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            return None;
        }
        let file_path = value.get("result")?.get("file_path")?.as_str()?;
        Some(format!("{}/file/bot{}/{}", base, token, file_path))
    }

    async fn send_part(
        &self,
        ctx: &HandlerContext,
        msg: &Msg,
        base: &str,
        token: &str,
        method: &str,
        payload: &Value,
        status: &mut StatusUpdate,
    ) -> bool {
        let url = format!("{}/bot{}/{}", base, token, method);
        let request = match ctx.http.post(&url).json(payload).build() {
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
            Ok((_, body)) => match serde_json::from_str::<Value>(&body) {
                Ok(value) if value.get("ok").and_then(|v| v.as_bool()) == Some(true) => {
                    if let Some(message_id) = value
                        .get("result")
                        .and_then(|r| r.get("message_id"))
                        .and_then(|id| id.as_i64())
                    {
                        status.set_external_id(&message_id.to_string());
                    }
                    true
                }
                _ => {
                    log.error = Some("response not ok".to_string());
                    false
                }
            },
            Err(_) => false,
        };
        status.add_log(log);
        ok
    }
}

fn keyboard(quick_replies: &[String]) -> Value {
    let rows: Vec<Value> = quick_replies
        .iter()
        .map(|qr| json!([{"text": qr}]))
        .collect();
    json!({"keyboard": rows, "resize_keyboard": true, "one_time_keyboard": true})
}

#[async_trait]
impl ChannelHandler for TelegramHandler {
    fn channel_type(&self) -> ChannelType {
        self.channel_type.clone()
    }

    fn name(&self) -> &'static str {
        "Telegram"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            receive: true,
            send: true,
            verify_signature: false,
            fetch_attachment: false,
        }
    }

    async fn receive(
        &self,
        ctx: &HandlerContext,
        channel: &Channel,
        _action: &str,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response> {
        let update: MoUpdate = match decode_json(body) {
            Ok(update) => update,
            Err(e) => return Ok(envelope::bad_request(&e.to_string())),
        };

        let Some(message) = update.message else {
            return Ok(envelope::ignored("Ignoring request, no message"));
        };

        let urn = match Urn::from_telegram(&message.chat.id.to_string()) {
            Ok(urn) => urn,
            Err(e) => return Ok(envelope::bad_request(&e.to_string())),
        };

        // a /start is the beginning of a conversation, not a message
        if message.text.as_deref() == Some("/start") {
            let mut event = ChannelEvent::new(channel, urn, ChannelEventKind::NewConversation)
                .with_occurred_on(
                    Utc.timestamp_opt(message.date, 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                );
            ctx.backend.write_channel_event(&mut event).await?;
            return Ok(envelope::events_handled(vec![DataItem::info(
                "conversation started",
            )]));
        }

        let name = message
            .from
            .as_ref()
            .and_then(|u| name_from_parts(&u.first_name, &u.last_name, &u.username))
            .unwrap_or_default();

        let mut msg = Msg::incoming(channel, urn, message.text.as_deref().unwrap_or(""))
            .with_external_id(&message.message_id.to_string())
            .with_received_on(
                Utc.timestamp_opt(message.date, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            )
            .with_contact_name(&name);

        let base = api_base(channel);
        let token = channel.config_str(CONFIG_AUTH_TOKEN).unwrap_or_default();
        if let Some(photo) = message.photo.last() {
            if let Some(url) = self.resolve_file_url(ctx, base, token, &photo.file_id).await {
                msg = msg.with_attachment(join_attachment("image/jpeg", &url));
            }
        }
        if let Some(document) = &message.document {
            if let Some(url) = self.resolve_file_url(ctx, base, token, &document.file_id).await {
                msg = msg.with_attachment(join_attachment(
                    document.mime_type.as_deref().unwrap_or(""),
                    &url,
                ));
            }
        }

        if msg.text.is_empty() && msg.attachments.is_empty() {
            return Ok(envelope::ignored("Ignoring request, no message"));
        }

        let mut data = Vec::new();
        if ctx.backend.check_external_id_seen(&msg) {
            data.push(DataItem::info("message already accepted, ignored"));
            return Ok(envelope::message_accepted(data));
        }

        ctx.backend.write_msg(&mut msg).await?;
        ctx.backend.write_external_id_seen(&msg);
        data.push(DataItem::msg_received(&msg));

        tracing::debug!(update_id = update.update_id, msg_id = msg.id, "telegram update accepted");
        Ok(envelope::message_accepted(data))
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

        let base = api_base(channel).to_string();
        let chat_id = msg.urn.path();
        let caption = if msg.attachments.len() == 1 {
            msg.text.as_str()
        } else {
            ""
        };

        // quick replies ride the first part only
        let mut quick_replies = msg.quick_replies.clone();
        let mut parts_sent = 0;
        let mut all_ok = true;

        if !msg.text.is_empty() && caption.is_empty() {
            let mut payload = json!({"chat_id": chat_id, "text": msg.text});
            if !quick_replies.is_empty() {
                payload["reply_markup"] = keyboard(&quick_replies);
                quick_replies.clear();
            }
            let ok = self
                .send_part(ctx, msg, &base, &token, "sendMessage", &payload, &mut status)
                .await;
            parts_sent += 1;
            all_ok &= ok;
        }

        for attachment in &msg.attachments {
            let (content_type, url) = split_attachment(attachment);
            let (method, field) = match content_type.split('/').next().unwrap_or("") {
                "image" => ("sendPhoto", "photo"),
                _ => ("sendDocument", "document"),
            };
            let mut payload = json!({"chat_id": chat_id, field: url});
            if !caption.is_empty() {
                payload["caption"] = Value::String(caption.to_string());
            }
            if !quick_replies.is_empty() {
                payload["reply_markup"] = keyboard(&quick_replies);
                quick_replies.clear();
            }
            let ok = self
                .send_part(ctx, msg, &base, &token, method, &payload, &mut status)
                .await;
            parts_sent += 1;
            all_ok &= ok;
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
