use axum::body::to_bytes;
use axum::http::{header, StatusCode};
use switchboard::envelope::{self, DataItem};

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_error_envelope_is_body_exact() {
    let response = envelope::bad_request("unable to verify signature, signature error");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert_eq!(
        body,
        r#"{"message":"Error","data":[{"type":"error","error":"unable to verify signature, signature error"}]}"#
    );
}

#[tokio::test]
async fn test_ignored_envelope() {
    let response = envelope::ignored("Ignoring request, no message");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert_eq!(
        body,
        r#"{"message":"Ignored","data":[{"type":"info","info":"Ignoring request, no message"}]}"#
    );
}

#[tokio::test]
async fn test_content_type_carries_charset() {
    let response = envelope::events_handled(vec![]);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json; charset=utf-8"
    );
}

#[tokio::test]
async fn test_mixed_data_items_keep_order() {
    let response = envelope::events_handled(vec![
        DataItem::info("message not found, ignored"),
        DataItem::error("boom"),
    ]);
    let body = body_string(response).await;
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["message"], "Events Handled");
    assert_eq!(value["data"][0]["type"], "info");
    assert_eq!(value["data"][1]["type"], "error");
}

#[tokio::test]
async fn test_server_error_envelope() {
    let response = envelope::server_error("database error: connection reset");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(body.contains(r#""type":"error""#));
    assert!(body.contains("connection reset"));
}
