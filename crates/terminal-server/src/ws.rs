//! WebSocket 연결 handler.
//!
//! Axum WebSocket 엔드포인트 및 오퍼레이션 처리. 소켓마다 수신
//! 루프와 발신 태스크로 분리되며, 발신 태스크는 디스패처가 큐에 넣은
//! 메시지와 종료 프레임을 순서대로 전송합니다.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use terminal_core::{TerminalError, TerminalResult};
use terminal_pubsub::{
    ClientHandle, ConnectionManager, DisconnectReason, Envelope, Operation, OutboundMessage,
    RouteTable, SubscribeResponse, CLOSE_POLICY_VIOLATION,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// WebSocket 서버 상태.
#[derive(Clone)]
pub struct WsState {
    /// 라우트 테이블 (구성 루트에서 조립)
    pub routes: Arc<RouteTable>,
    /// 연결 관리자
    pub connections: Arc<ConnectionManager>,
}

/// `/ws` 엔드포인트 라우터를 생성합니다.
pub fn websocket_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// WebSocket 업그레이드 핸들러.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// WebSocket 연결 하나를 처리합니다.
async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let client = Arc::new(ClientHandle::new(outbound_tx));
    let client_id = client.id();
    let connection = state.connections.register(Arc::clone(&client)).await;
    info!(client_id = %client_id, "WebSocket connected");

    // 환영 메시지 - 클라이언트 활동으로 치지 않는다
    let welcome = Envelope::welcome(env!("CARGO_PKG_VERSION"));
    if let Ok(json) = welcome.to_json() {
        let _ = sender.send(Message::Text(json.into())).await;
    }
    connection.activate().await;

    // 발신 태스크: 큐에 들어온 메시지를 소켓으로 전송
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message {
                OutboundMessage::Text(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutboundMessage::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // 수신 루프
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                state.connections.touch(client_id).await;
                if let Err(e) = handle_operation(&state, &client, text.as_str()).await {
                    if e.is_connection_fatal() {
                        warn!(client_id = %client_id, error = %e, "Protocol violation, closing");
                        client.close(CLOSE_POLICY_VIOLATION, e.to_string());
                        state
                            .connections
                            .disconnect(client_id, DisconnectReason::ProtocolViolation)
                            .await;
                        break;
                    }
                    debug!(client_id = %client_id, error = %e, "Operation failed");
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                state.connections.touch(client_id).await;
            }
            Ok(Message::Close(_)) => {
                debug!(client_id = %client_id, "Client closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    state
        .connections
        .disconnect(client_id, DisconnectReason::ClientClosed)
        .await;
    // 클라이언트 핸들을 내려놓으면 발신 채널이 닫혀 태스크가 끝난다
    drop(client);
    drop(connection);
    let _ = send_task.await;
    info!(client_id = %client_id, "WebSocket disconnected");
}

/// 수신한 텍스트 프레임 하나를 처리합니다.
///
/// 치명적이지 않은 에러(검증/인코딩 실패)는 에러 응답으로 보고되고
/// 연결은 유지됩니다. `Protocol` 에러만 호출자에게 전파되어 연결을
/// 닫습니다.
async fn handle_operation(
    state: &WsState,
    client: &Arc<ClientHandle>,
    text: &str,
) -> TerminalResult<()> {
    let envelope = Envelope::parse(text)?;
    let operation = Operation::parse(&envelope.kind)?;
    let route = operation.route().to_string();

    let Some(registry) = state.routes.get(&route) else {
        return Err(TerminalError::Protocol(format!("unknown route: {}", route)));
    };
    let params = envelope.payload.unwrap_or(Value::Null);

    match operation {
        Operation::Subscribe { .. } => {
            let response = match registry.subscribe(client, &params).await {
                Ok(topic) => SubscribeResponse::ok(topic),
                Err(e) if e.is_connection_fatal() => return Err(e),
                Err(e) => {
                    debug!(route = %route, error = %e, "Subscribe rejected");
                    SubscribeResponse::error(e.to_string())
                }
            };
            client.send(Envelope::subscribe_response(&route, &response).to_json()?)?;
        }
        Operation::Unsubscribe { .. } => {
            let response = match registry.unsubscribe(client, &params).await {
                Ok(topic) => SubscribeResponse::ok(topic),
                Err(e) if e.is_connection_fatal() => return Err(e),
                Err(e) => {
                    debug!(route = %route, error = %e, "Unsubscribe rejected");
                    SubscribeResponse::error(e.to_string())
                }
            };
            client.send(Envelope::unsubscribe_response(&route, &response).to_json()?)?;
        }
    }
    Ok(())
}
