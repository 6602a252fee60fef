use crate::models::{Msg, MsgStatus, StatusUpdate};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use serde::Serialize;
use uuid::Uuid;

/// Every handler answers with this envelope so providers (and our tests)
/// can assert exact bodies.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub message: String,
    pub data: Vec<DataItem>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataItem {
    Msg {
        channel_uuid: Uuid,
        msg_uuid: Uuid,
        urn: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
    },
    Status {
        channel_uuid: Uuid,
        status: MsgStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        msg_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
    },
    Info {
        info: String,
    },
    Error {
        error: String,
    },
}

impl DataItem {
    pub fn msg_received(msg: &Msg) -> DataItem {
        DataItem::Msg {
            channel_uuid: msg.channel_uuid,
            msg_uuid: msg.uuid,
            urn: msg.urn.to_string(),
            text: msg.text.clone(),
            external_id: msg.external_id.clone(),
        }
    }

    pub fn status(update: &StatusUpdate) -> DataItem {
        DataItem::Status {
            channel_uuid: update.channel_uuid,
            status: update.status,
            msg_id: update.msg_id,
            external_id: update.external_id.clone(),
        }
    }

    pub fn info(info: &str) -> DataItem {
        DataItem::Info {
            info: info.to_string(),
        }
    }

    pub fn error(error: &str) -> DataItem {
        DataItem::Error {
            error: error.to_string(),
        }
    }
}

fn respond(status: StatusCode, message: &str, data: Vec<DataItem>) -> Response {
    let envelope = Envelope {
        message: message.to_string(),
        data,
    };
    let body = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}

/// 200 with per-event outcomes. Used when a webhook carried a mix of
/// messages and acks.
pub fn events_handled(data: Vec<DataItem>) -> Response {
    respond(StatusCode::OK, "Events Handled", data)
}

/// 200 for a webhook that carried exactly the accepted messages.
pub fn message_accepted(data: Vec<DataItem>) -> Response {
    respond(StatusCode::OK, "Message Accepted", data)
}

/// 200 for a well-formed request with nothing actionable. Providers retry
/// on non-2xx, so "nothing to do" must not look like failure.
pub fn ignored(reason: &str) -> Response {
    respond(StatusCode::OK, "Ignored", vec![DataItem::info(reason)])
}

/// 400 for malformed, unverifiable, or unroutable requests.
pub fn bad_request(error: &str) -> Response {
    respond(StatusCode::BAD_REQUEST, "Error", vec![DataItem::error(error)])
}

/// 500 for persistence or other unexpected failures; the provider retries.
pub fn server_error(error: &str) -> Response {
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Error",
        vec![DataItem::error(error)],
    )
}
