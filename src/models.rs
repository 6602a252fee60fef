use crate::urns::Urn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub const CONFIG_AUTH_TOKEN: &str = "auth_token";
pub const CONFIG_USERNAME: &str = "username";
pub const CONFIG_SECRET: &str = "secret";
pub const CONFIG_SEND_URL: &str = "send_url";
pub const CONFIG_CALLBACK_DOMAIN: &str = "callback_domain";
pub const CONFIG_VERIFY_SSL: &str = "verify_ssl";
pub const CONFIG_USE_NATIONAL: &str = "use_national";

/// Short channel-type code, e.g. `CA`, `FC`, `TG`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(pub String);

impl ChannelType {
    pub fn new(code: &str) -> ChannelType {
        ChannelType(code.to_uppercase())
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A configured provider endpoint for one org. Read-only inside the
/// gateway; provisioning happens elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub uuid: Uuid,
    pub channel_type: ChannelType,
    pub address: String,
    pub country: String,
    pub org_id: i64,
    pub config: HashMap<String, Value>,
    pub flow_server_enabled: bool,
}

impl Channel {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_bool(&self, key: &str, default: bool) -> bool {
        self.config
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "I")]
    Incoming,
    #[serde(rename = "O")]
    Outgoing,
}

impl Direction {
    pub fn code(self) -> &'static str {
        match self {
            Direction::Incoming => "I",
            Direction::Outgoing => "O",
        }
    }
}

/// Delivery state of a message. Forward transitions only; a regressing
/// write is dropped by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgStatus {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "Q")]
    Queued,
    #[serde(rename = "W")]
    Wired,
    #[serde(rename = "S")]
    Sent,
    #[serde(rename = "D")]
    Delivered,
    #[serde(rename = "V")]
    Read,
    #[serde(rename = "E")]
    Errored,
    #[serde(rename = "F")]
    Failed,
}

impl MsgStatus {
    pub fn code(self) -> &'static str {
        match self {
            MsgStatus::Pending => "P",
            MsgStatus::Queued => "Q",
            MsgStatus::Wired => "W",
            MsgStatus::Sent => "S",
            MsgStatus::Delivered => "D",
            MsgStatus::Read => "V",
            MsgStatus::Errored => "E",
            MsgStatus::Failed => "F",
        }
    }

    pub fn from_code(code: &str) -> Option<MsgStatus> {
        match code {
            "P" => Some(MsgStatus::Pending),
            "Q" => Some(MsgStatus::Queued),
            "W" => Some(MsgStatus::Wired),
            "S" => Some(MsgStatus::Sent),
            "D" => Some(MsgStatus::Delivered),
            "V" => Some(MsgStatus::Read),
            "E" => Some(MsgStatus::Errored),
            "F" => Some(MsgStatus::Failed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            MsgStatus::Pending => 0,
            MsgStatus::Queued => 1,
            MsgStatus::Wired => 2,
            MsgStatus::Sent => 3,
            MsgStatus::Delivered => 4,
            MsgStatus::Read => 5,
            MsgStatus::Errored => 6,
            MsgStatus::Failed => 7,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MsgStatus::Errored | MsgStatus::Failed)
    }

    /// Whether writing `next` over `self` would move the status backwards.
    /// Errored is allowed from any non-terminal state.
    pub fn is_regression(self, next: MsgStatus) -> bool {
        if next == MsgStatus::Errored || next == MsgStatus::Failed {
            return self.is_terminal() && self != next;
        }
        next.rank() <= self.rank() && next != self
    }
}

/// Attachments travel as `content_type:url` strings. The content type may
/// be absent when a provider only gave us a URL.
pub fn split_attachment(attachment: &str) -> (&str, &str) {
    match attachment.split_once(':') {
        Some((content_type, url)) if content_type.contains('/') => (content_type, url),
        _ => ("", attachment),
    }
}

pub fn join_attachment(content_type: &str, url: &str) -> String {
    if content_type.is_empty() {
        url.to_string()
    } else {
        format!("{}:{}", content_type, url)
    }
}

/// Canonical message. Incoming messages are produced by the builder chain
/// (`Msg::incoming(..).with_external_id(..)`); each step consumes and
/// returns the value, so a decorated message is a new value rather than a
/// mutation visible through aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    pub id: i64,
    pub uuid: Uuid,
    pub direction: Direction,
    pub channel_id: i64,
    pub channel_uuid: Uuid,
    pub channel_type: ChannelType,
    pub org_id: i64,
    pub urn: Urn,
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
    pub external_id: Option<String>,
    pub contact_name: Option<String>,
    pub contact_id: Option<i64>,
    pub contact_urn_id: Option<i64>,
    pub received_on: Option<DateTime<Utc>>,
    pub sent_on: Option<DateTime<Utc>>,
    pub status: MsgStatus,
    pub error_count: i32,
    pub created_on: DateTime<Utc>,
}

impl Msg {
    pub fn incoming(channel: &Channel, urn: Urn, text: &str) -> Msg {
        Msg {
            id: 0,
            uuid: Uuid::new_v4(),
            direction: Direction::Incoming,
            channel_id: channel.id,
            channel_uuid: channel.uuid,
            channel_type: channel.channel_type.clone(),
            org_id: channel.org_id,
            urn,
            text: text.to_string(),
            attachments: Vec::new(),
            quick_replies: Vec::new(),
            external_id: None,
            contact_name: None,
            contact_id: None,
            contact_urn_id: None,
            received_on: None,
            sent_on: None,
            status: MsgStatus::Pending,
            error_count: 0,
            created_on: Utc::now(),
        }
    }

    pub fn outgoing(channel: &Channel, urn: Urn, text: &str) -> Msg {
        Msg {
            direction: Direction::Outgoing,
            ..Msg::incoming(channel, urn, text)
        }
    }

    pub fn with_external_id(mut self, external_id: &str) -> Msg {
        self.external_id = Some(external_id.to_string());
        self
    }

    pub fn with_received_on(mut self, received_on: DateTime<Utc>) -> Msg {
        self.received_on = Some(received_on);
        self
    }

    pub fn with_contact_name(mut self, name: &str) -> Msg {
        if !name.trim().is_empty() {
            self.contact_name = Some(name.trim().to_string());
        }
        self
    }

    pub fn with_attachment(mut self, attachment: String) -> Msg {
        self.attachments.push(attachment);
        self
    }

    pub fn with_quick_replies(mut self, replies: Vec<String>) -> Msg {
        self.quick_replies = replies;
        self
    }
}

/// A pending status write, keyed either by our internal id (outbound
/// sends) or by the provider's external id (delivery acks).
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub channel_uuid: Uuid,
    pub msg_id: Option<i64>,
    pub external_id: Option<String>,
    pub status: MsgStatus,
    pub logs: Vec<ChannelLog>,
}

impl StatusUpdate {
    pub fn for_id(channel: &Channel, msg_id: i64, status: MsgStatus) -> StatusUpdate {
        StatusUpdate {
            channel_uuid: channel.uuid,
            msg_id: Some(msg_id),
            external_id: None,
            status,
            logs: Vec::new(),
        }
    }

    pub fn for_external_id(channel: &Channel, external_id: &str, status: MsgStatus) -> StatusUpdate {
        StatusUpdate {
            channel_uuid: channel.uuid,
            msg_id: None,
            external_id: Some(external_id.to_string()),
            status,
            logs: Vec::new(),
        }
    }

    /// Providers report an id per part; the most recent successful part
    /// wins.
    pub fn set_external_id(&mut self, external_id: &str) {
        if !external_id.is_empty() {
            self.external_id = Some(external_id.to_string());
        }
    }

    pub fn set_status(&mut self, status: MsgStatus) {
        self.status = status;
    }

    pub fn add_log(&mut self, log: ChannelLog) {
        self.logs.push(log);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub org_id: i64,
    pub name: Option<String>,
    pub urns: Vec<Urn>,
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEventKind {
    StopContact,
    NewConversation,
    WelcomeMessage,
    Referral,
}

/// A non-message occurrence on a channel (opt-out, conversation start,
/// referral, ...). These take a different hand-off path than messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub channel_id: i64,
    pub channel_uuid: Uuid,
    pub org_id: i64,
    pub urn: Urn,
    pub kind: ChannelEventKind,
    pub extra: HashMap<String, String>,
    pub occurred_on: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    pub contact_id: Option<i64>,
    pub contact_urn_id: Option<i64>,
}

impl ChannelEvent {
    pub fn new(channel: &Channel, urn: Urn, kind: ChannelEventKind) -> ChannelEvent {
        ChannelEvent {
            channel_id: channel.id,
            channel_uuid: channel.uuid,
            org_id: channel.org_id,
            urn,
            kind,
            extra: HashMap::new(),
            occurred_on: Utc::now(),
            created_on: Utc::now(),
            contact_id: None,
            contact_urn_id: None,
        }
    }

    pub fn with_extra(mut self, extra: HashMap<String, String>) -> ChannelEvent {
        self.extra = extra;
        self
    }

    pub fn with_occurred_on(mut self, occurred_on: DateTime<Utc>) -> ChannelEvent {
        self.occurred_on = occurred_on;
        self
    }
}

/// One record per HTTP exchange with a provider, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLog {
    pub description: String,
    pub channel_uuid: Uuid,
    pub msg_id: Option<i64>,
    pub url: String,
    pub request: String,
    pub response: String,
    pub status_code: u16,
    pub elapsed_ms: i64,
    pub error: Option<String>,
    pub created_on: DateTime<Utc>,
}

impl ChannelLog {
    pub fn new(description: &str, channel_uuid: Uuid, msg_id: Option<i64>) -> ChannelLog {
        ChannelLog {
            description: description.to_string(),
            channel_uuid,
            msg_id,
            url: String::new(),
            request: String::new(),
            response: String::new(),
            status_code: 0,
            elapsed_ms: 0,
            error: None,
            created_on: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: &str) -> ChannelLog {
        self.error = Some(error.to_string());
        self
    }
}

/// Contact display names arrive in pieces; first non-empty combination
/// wins.
pub fn name_from_parts(first: &str, last: &str, username: &str) -> Option<String> {
    let full = format!("{} {}", first.trim(), last.trim());
    let full = full.trim();
    if !full.is_empty() {
        return Some(full.to_string());
    }
    let username = username.trim();
    if !username.is_empty() {
        return Some(username.to_string());
    }
    None
}
