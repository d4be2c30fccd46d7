//! 实时推送 WebSocket
//!
//! - GET /ws
//!
//! 每个连接一个读循环 + 一个写任务：写任务消费连接的出站队列并施加写超时；
//! 读循环处理订阅、退订与心跳，并施加读空闲超时。

use crate::AppState;
use api_contract::{ClientMessage, ErrorCode, ServerMessage};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use domain::{Channel, now_epoch_ms};
use futures_util::{SinkExt, StreamExt};
use kiln_hub::{ConnectionId, DistributionHub, Frame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};
use tracing::{debug, info, warn};

/// 检查连接是否已被分发中心摘除的周期。
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(state.ws.outbound_capacity.max(1));
    let id = state.hub.register(tx.clone());
    info!(target: "kiln.ws", connection_id = %id, "ws_connected");

    let write_timeout = state.ws.write_timeout;
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match timeout(write_timeout, sender.send(Message::Text(frame.to_string()))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(target: "kiln.ws", connection_id = %id, error = %err, "ws_write_failed");
                    return;
                }
                Err(_) => {
                    warn!(target: "kiln.ws", connection_id = %id, "ws_write_timeout");
                    return;
                }
            }
        }
        let _ = timeout(write_timeout, sender.send(Message::Close(None))).await;
    });

    let idle_timeout = state.ws.idle_timeout;
    let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut writer_done = false;
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            _ = state.shutdown.cancelled() => break,
            _ = liveness.tick() => {
                if !state.hub.is_registered(id) {
                    info!(target: "kiln.ws", connection_id = %id, "ws_evicted");
                    break;
                }
            }
            next = timeout_at(last_inbound + idle_timeout, receiver.next()) => {
                let message = match next {
                    Err(_) => {
                        info!(target: "kiln.ws", connection_id = %id, "ws_idle_timeout");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        debug!(target: "kiln.ws", connection_id = %id, error = %err, "ws_read_failed");
                        break;
                    }
                    Ok(Some(Ok(message))) => message,
                };
                last_inbound = Instant::now();
                let reply = match message {
                    Message::Text(text) => handle_client_text(&state.hub, id, &text),
                    Message::Binary(_) => Some(ServerMessage::error(
                        ErrorCode::InvalidMessage,
                        "binary frames are not supported",
                    )),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => None,
                };
                if let Some(frame) = reply.as_ref().and_then(encode_reply) {
                    if tx.try_send(frame).is_err() {
                        warn!(target: "kiln.ws", connection_id = %id, "ws_reply_dropped");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(id);
    drop(tx);
    if !writer_done {
        // 出站队列的发送端已全部释放，写任务发完剩余帧后自行结束
        if timeout(write_timeout, &mut writer).await.is_err() {
            writer.abort();
        }
    }
    info!(target: "kiln.ws", connection_id = %id, "ws_disconnected");
}

/// 处理一条客户端文本消息，返回需要回给该连接的消息。
pub fn handle_client_text(
    hub: &DistributionHub,
    id: ConnectionId,
    text: &str,
) -> Option<ServerMessage> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(target: "kiln.ws", connection_id = %id, error = %err, "invalid_client_message");
            return Some(ServerMessage::error(
                ErrorCode::InvalidMessage,
                format!("invalid message: {err}"),
            ));
        }
    };

    match message {
        ClientMessage::Subscribe { channel } => match Channel::parse(&channel) {
            Some(channel) => hub.subscribe(id, channel).err().map(internal_error),
            None => Some(invalid_channel(&channel)),
        },
        ClientMessage::Unsubscribe { channel } => match Channel::parse(&channel) {
            Some(channel) => hub.unsubscribe(id, channel).err().map(internal_error),
            None => Some(invalid_channel(&channel)),
        },
        ClientMessage::Heartbeat { .. } => match hub.heartbeat(id) {
            Ok(()) => Some(ServerMessage::Heartbeat {
                timestamp: now_epoch_ms(),
            }),
            Err(err) => Some(internal_error(err)),
        },
    }
}

fn invalid_channel(channel: &str) -> ServerMessage {
    ServerMessage::error(
        ErrorCode::InvalidChannel,
        format!("unknown channel: {channel}"),
    )
}

fn internal_error(err: impl std::fmt::Display) -> ServerMessage {
    ServerMessage::error(ErrorCode::InternalError, err.to_string())
}

fn encode_reply(message: &ServerMessage) -> Option<Frame> {
    match message.to_json() {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            warn!(target: "kiln.ws", error = %err, "reply_encode_failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_hub::HubConfig;

    fn hub_with_connection() -> (DistributionHub, ConnectionId, mpsc::Receiver<Frame>) {
        let hub = DistributionHub::new(HubConfig::default());
        let (tx, rx) = mpsc::channel(8);
        let id = hub.register(tx);
        (hub, id, rx)
    }

    #[tokio::test]
    async fn subscribe_registers_channel_without_reply() {
        let (hub, id, _rx) = hub_with_connection();
        let reply = handle_client_text(&hub, id, r#"{"type":"subscribe","channel":"realtime"}"#);
        assert!(reply.is_none());
        assert_eq!(hub.subscriber_count(Channel::Realtime), 1);

        let reply = handle_client_text(&hub, id, r#"{"type":"unsubscribe","channel":"realtime"}"#);
        assert!(reply.is_none());
        assert_eq!(hub.subscriber_count(Channel::Realtime), 0);
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let (hub, id, _rx) = hub_with_connection();
        let reply = handle_client_text(&hub, id, r#"{"type":"subscribe","channel":"alarms"}"#);
        match reply {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::InvalidChannel),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_message() {
        let (hub, id, _rx) = hub_with_connection();
        for text in ["not json", r#"{"type":"launch"}"#, r#"{"channel":"realtime"}"#] {
            match handle_client_text(&hub, id, text) {
                Some(ServerMessage::Error { code, .. }) => {
                    assert_eq!(code, ErrorCode::InvalidMessage, "input: {text}")
                }
                other => panic!("unexpected reply for {text}: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let (hub, id, _rx) = hub_with_connection();
        let reply = handle_client_text(&hub, id, r#"{"type":"heartbeat","timestamp":"abc"}"#);
        assert!(matches!(reply, Some(ServerMessage::Heartbeat { .. })));

        let reply = handle_client_text(&hub, id, r#"{"type":"heartbeat"}"#);
        assert!(matches!(reply, Some(ServerMessage::Heartbeat { .. })));
    }

    #[tokio::test]
    async fn messages_for_unregistered_connection_report_internal_error() {
        let (hub, id, _rx) = hub_with_connection();
        assert!(hub.unregister(id));
        match handle_client_text(&hub, id, r#"{"type":"heartbeat"}"#) {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::InternalError),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
