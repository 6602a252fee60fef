use std::collections::HashMap;
use switchboard::models::{
    split_attachment, Channel, ChannelType, Direction, Msg, MsgStatus, StatusUpdate,
};
use switchboard::urns::Urn;
use uuid::Uuid;

fn channel() -> Channel {
    Channel {
        id: 1,
        uuid: Uuid::new_v4(),
        channel_type: ChannelType::new("TG"),
        address: "bot".to_string(),
        country: "US".to_string(),
        org_id: 1,
        config: HashMap::new(),
        flow_server_enabled: false,
    }
}

#[test]
fn test_status_axis_is_monotone() {
    let forward = [
        MsgStatus::Pending,
        MsgStatus::Queued,
        MsgStatus::Wired,
        MsgStatus::Sent,
        MsgStatus::Delivered,
        MsgStatus::Read,
    ];
    for window in forward.windows(2) {
        assert!(!window[0].is_regression(window[1]), "{:?} -> {:?}", window[0], window[1]);
        assert!(window[1].is_regression(window[0]), "{:?} -> {:?}", window[1], window[0]);
    }
}

#[test]
fn test_same_status_rewrite_allowed() {
    assert!(!MsgStatus::Delivered.is_regression(MsgStatus::Delivered));
}

#[test]
fn test_errored_reachable_until_terminal() {
    for status in [
        MsgStatus::Pending,
        MsgStatus::Queued,
        MsgStatus::Wired,
        MsgStatus::Sent,
        MsgStatus::Delivered,
        MsgStatus::Read,
    ] {
        assert!(!status.is_regression(MsgStatus::Errored));
    }
    assert!(MsgStatus::Failed.is_regression(MsgStatus::Errored));
}

#[test]
fn test_incoming_builder_produces_new_values() {
    let ch = channel();
    let urn = Urn::from_telegram("12345").unwrap();
    let base = Msg::incoming(&ch, urn, "hi");
    let decorated = base
        .clone()
        .with_external_id("41")
        .with_attachment("image/jpeg:https://foo.bar/a.jpg".to_string());

    // the original value is untouched by decoration
    assert!(base.external_id.is_none());
    assert!(base.attachments.is_empty());
    assert_eq!(decorated.external_id.as_deref(), Some("41"));
    assert_eq!(decorated.attachments.len(), 1);
}

#[test]
fn test_outgoing_direction() {
    let ch = channel();
    let urn = Urn::from_telegram("12345").unwrap();
    let msg = Msg::outgoing(&ch, urn, "out");
    assert_eq!(msg.direction, Direction::Outgoing);
    assert_eq!(msg.status, MsgStatus::Pending);
}

#[test]
fn test_status_update_keying() {
    let ch = channel();
    let by_id = StatusUpdate::for_id(&ch, 7, MsgStatus::Wired);
    assert_eq!(by_id.msg_id, Some(7));
    assert!(by_id.external_id.is_none());

    let by_external = StatusUpdate::for_external_id(&ch, "prov-1", MsgStatus::Delivered);
    assert!(by_external.msg_id.is_none());
    assert_eq!(by_external.external_id.as_deref(), Some("prov-1"));
}

#[test]
fn test_attachment_split_handles_urls_with_colons() {
    let (content_type, url) = split_attachment("image/jpeg:https://foo.bar:8443/a.jpg");
    assert_eq!(content_type, "image/jpeg");
    assert_eq!(url, "https://foo.bar:8443/a.jpg");
}
