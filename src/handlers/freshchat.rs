use crate::envelope::{self, DataItem};
use crate::handlers::{decode_json, execute_logged, Capabilities, ChannelHandler, HandlerContext};
use crate::models::{
    split_attachment, Channel, ChannelLog, ChannelType, Msg, MsgStatus, StatusUpdate,
    CONFIG_AUTH_TOKEN, CONFIG_SECRET, CONFIG_SEND_URL, CONFIG_USERNAME,
};
use crate::urns::Urn;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::response::Response;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;

const SIGNATURE_HEADER: &str = "X-Freshchat-Signature";
const DEFAULT_SEND_URL: &str = "https://api.freshchat.com/v2/outbound-messages";

/// Adapter for the "FC" agent-chat provider. Webhooks are signed with the
/// account's public key; contacts are addressed as `<channel>/<actor>`
/// pairs and sends carry every part in a single call.
pub struct FreshchatHandler {
    channel_type: ChannelType,
    verify_signatures: bool,
}

impl FreshchatHandler {
    /// `verify_signatures` exists so the test suite can exercise the
    /// pipeline with and without the signature gate.
    pub fn new(verify_signatures: bool) -> FreshchatHandler {
        FreshchatHandler {
            channel_type: ChannelType::new("FC"),
            verify_signatures,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MoPayload {
    #[serde(default)]
    actor: MoActor,
    #[serde(default)]
    action: String,
    #[serde(default)]
    data: MoData,
}

#[derive(Debug, Default, Deserialize)]
struct MoActor {
    #[serde(rename = "actor_type", default)]
    actor_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct MoData {
    message: Option<MoMessage>,
}

#[derive(Debug, Deserialize)]
struct MoMessage {
    #[serde(default)]
    message_parts: Vec<MoPart>,
    #[serde(default)]
    actor_id: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct MoPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<MoText>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<MoImage>,
}

#[derive(Debug, Deserialize, Serialize)]
struct MoText {
    content: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct MoImage {
    url: String,
}

fn verify_signature(channel: &Channel, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let secret = channel
        .config_str(CONFIG_SECRET)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("missing verification key config"))?;

    let key_raw = BASE64
        .decode(secret.trim())
        .map_err(|e| anyhow!("invalid verification key: {}", e))?;
    let key_bytes: [u8; 32] = key_raw
        .try_into()
        .map_err(|_| anyhow!("invalid verification key length"))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| anyhow!("invalid verification key: {}", e))?;

    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow!("missing signature header"))?;
    let sig_raw = BASE64
        .decode(header.trim())
        .map_err(|e| anyhow!("invalid signature encoding: {}", e))?;
    let signature =
        Signature::from_slice(&sig_raw).map_err(|e| anyhow!("invalid signature: {}", e))?;

    key.verify(body, &signature)
        .map_err(|e| anyhow!("{}", e))
}

#[async_trait]
impl ChannelHandler for FreshchatHandler {
    fn channel_type(&self) -> ChannelType {
        self.channel_type.clone()
    }

    fn name(&self) -> &'static str {
        "Freshchat"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            receive: true,
            send: true,
            verify_signature: self.verify_signatures,
            fetch_attachment: true,
        }
    }

    async fn receive(
        &self,
        ctx: &HandlerContext,
        channel: &Channel,
        _action: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response> {
        if self.verify_signatures {
            if let Err(e) = verify_signature(channel, headers, body) {
                return Ok(envelope::bad_request(&format!(
                    "unable to verify signature, {}",
                    e
                )));
            }
        }

        let payload: MoPayload = match decode_json(body) {
            Ok(payload) => payload,
            Err(e) => return Ok(envelope::bad_request(&e.to_string())),
        };

        if payload.action != "message_create" || payload.actor.actor_type != "user" {
            return Ok(envelope::ignored("Ignoring request, no message"));
        }
        let Some(message) = payload.data.message else {
            return Ok(envelope::ignored("Ignoring request, no message"));
        };

        let urn = match Urn::from_freshchat(&format!("{}/{}", message.channel_id, message.actor_id))
        {
            Ok(urn) => urn,
            Err(e) => return Ok(envelope::bad_request(&e.to_string())),
        };

        let mut text_parts = Vec::new();
        let mut attachments = Vec::new();
        for part in &message.message_parts {
            if let Some(text) = &part.text {
                text_parts.push(text.content.clone());
            }
            if let Some(image) = &part.image {
                attachments.push(image.url.clone());
            }
        }

        let mut msg = Msg::incoming(channel, urn, &text_parts.join("\n"))
            .with_external_id(&message.id);
        if let Some(created) = message.created_time {
            msg = msg.with_received_on(created);
        }
        for attachment in attachments {
            msg = msg.with_attachment(attachment);
        }

        let mut data = Vec::new();
        if ctx.backend.check_external_id_seen(&msg) {
            data.push(DataItem::info("message already accepted, ignored"));
            return Ok(envelope::message_accepted(data));
        }

        ctx.backend.write_msg(&mut msg).await?;
        ctx.backend.write_external_id_seen(&msg);
        data.push(DataItem::msg_received(&msg));

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
        let Some(agent_id) = channel
            .config_str(CONFIG_USERNAME)
            .filter(|v| !v.is_empty())
            .map(String::from)
        else {
            status.add_log(
                ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                    .with_error("invalid username config"),
            );
            return Ok(status);
        };

        let (channel_id, user_id) = match msg.urn.path().split_once('/') {
            Some(parts) => parts,
            None => {
                status.add_log(
                    ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                        .with_error("invalid freshchat urn"),
                );
                return Ok(status);
            }
        };

        // every part travels in one call here, text first
        let mut parts = Vec::new();
        if !msg.text.is_empty() {
            parts.push(MoPart {
                text: Some(MoText {
                    content: msg.text.clone(),
                }),
                image: None,
            });
        }
        for attachment in &msg.attachments {
            let (_, url) = split_attachment(attachment);
            parts.push(MoPart {
                text: None,
                image: Some(MoImage {
                    url: url.to_string(),
                }),
            });
        }
        if parts.is_empty() {
            status.add_log(
                ChannelLog::new("Message Send Error", msg.channel_uuid, Some(msg.id))
                    .with_error("empty message"),
            );
            return Ok(status);
        }

        let payload = json!({
            "messages": [{
                "message_parts": parts,
                "actor_id": agent_id,
                "actor_type": "agent",
            }],
            "channel_id": channel_id,
            "users": [{"id": user_id}],
        });

        let send_url = channel
            .config_str(CONFIG_SEND_URL)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_SEND_URL);

        let request = ctx
            .http
            .post(send_url)
            .header("Content-Type", "application/json")
            .bearer_auth(&token)
            .json(&payload)
            .build()?;

        let (log, result) =
            execute_logged(&ctx.http, request, "Message Sent", msg.channel_uuid, Some(msg.id))
                .await;
        status.add_log(log);

        if result.is_ok() {
            status.set_status(MsgStatus::Wired);
        }
        Ok(status)
    }

    /// Provider media is behind the same bearer token as the send API.
    fn attachment_request(
        &self,
        channel: &Channel,
        http: &reqwest::Client,
        url: &str,
    ) -> reqwest::RequestBuilder {
        let mut request = http.get(url);
        if let Some(token) = channel.config_str(CONFIG_AUTH_TOKEN) {
            request = request.bearer_auth(token);
        }
        request
    }
}
