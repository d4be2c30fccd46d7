use api_contract::{ClientMessage, DataSource, ErrorCode, ServerMessage, StatusSummary};
use std::collections::BTreeMap;

#[test]
fn client_messages_parse() {
    let sub: ClientMessage =
        serde_json::from_str(r#"{"type":"subscribe","channel":"realtime"}"#).expect("parse");
    assert_eq!(
        sub,
        ClientMessage::Subscribe {
            channel: "realtime".to_string()
        }
    );

    let hb: ClientMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).expect("parse");
    assert_eq!(hb, ClientMessage::Heartbeat { timestamp: None });

    let hb: ClientMessage =
        serde_json::from_str(r#"{"type":"heartbeat","timestamp":"2026-02-24T10:30:00Z"}"#)
            .expect("parse");
    assert!(matches!(hb, ClientMessage::Heartbeat { timestamp: Some(_) }));
}

#[test]
fn unknown_client_message_is_rejected() {
    let result = serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#);
    assert!(result.is_err());
}

#[test]
fn device_status_frame_shape() {
    let message = ServerMessage::DeviceStatus {
        success: true,
        timestamp: 1_700_000_000_000,
        source: DataSource::Simulated,
        data: BTreeMap::new(),
        summary: StatusSummary {
            total: 3,
            normal: 2,
            error: 1,
        },
    };
    let value = serde_json::to_value(&message).expect("serialize");
    assert_eq!(value["type"], "device_status");
    assert_eq!(value["source"], "simulated");
    assert_eq!(value["summary"]["error"], 1);
}

#[test]
fn error_frame_uses_screaming_codes() {
    let message = ServerMessage::error(ErrorCode::InvalidChannel, "invalid channel: alarms");
    let value = serde_json::to_value(&message).expect("serialize");
    assert_eq!(value["type"], "error");
    assert_eq!(value["code"], "INVALID_CHANNEL");
}
