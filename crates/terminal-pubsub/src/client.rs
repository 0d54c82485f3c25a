//! 클라이언트 핸들.

use std::collections::HashSet;
use std::sync::Mutex;
use terminal_core::{TerminalError, TerminalResult};
use tokio::sync::mpsc;
use uuid::Uuid;

/// 연결 식별자.
pub type ClientId = Uuid;

/// 클라이언트로 내보내는 메시지.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// 텍스트 프레임 (JSON envelope)
    Text(String),
    /// 종료 프레임 - 소켓 태스크가 이를 전송하고 종료합니다
    Close {
        /// WebSocket close code
        code: u16,
        /// 종료 사유
        reason: String,
    },
}

/// 연결된 클라이언트 하나에 대한 핸들.
///
/// 발신 채널과 이 클라이언트가 소유한 (라우트, 토픽) 쌍을 추적합니다.
/// 디스패처와 연결 관리자가 공유합니다.
#[derive(Debug)]
pub struct ClientHandle {
    /// 연결 ID
    id: ClientId,
    /// 발신 메시지 채널 (소켓 전송 태스크가 수신)
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    /// 구독 중인 (라우트, 토픽 키) 쌍
    topics: Mutex<HashSet<(String, String)>>,
}

impl ClientHandle {
    /// 새 클라이언트 핸들을 생성합니다.
    pub fn new(outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            topics: Mutex::new(HashSet::new()),
        }
    }

    /// 연결 ID를 반환합니다.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// 텍스트 메시지를 전송 큐에 넣습니다.
    ///
    /// 소켓 전송 태스크가 종료된 경우 실패합니다. 호출자는 이 실패를
    /// 격리하고 다른 구독자에 대한 전달을 계속해야 합니다.
    pub fn send(&self, text: impl Into<String>) -> TerminalResult<()> {
        self.outbound
            .send(OutboundMessage::Text(text.into()))
            .map_err(|_| TerminalError::Producer(format!("client {} send channel closed", self.id)))
    }

    /// 종료 프레임을 전송 큐에 넣습니다.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.send(OutboundMessage::Close {
            code,
            reason: reason.into(),
        });
    }

    /// 구독 토픽을 기록합니다.
    pub fn track(&self, route: &str, topic_key: &str) {
        self.topics
            .lock()
            .expect("client topics lock poisoned")
            .insert((route.to_string(), topic_key.to_string()));
    }

    /// 구독 해제된 토픽을 제거합니다.
    pub fn untrack(&self, route: &str, topic_key: &str) {
        self.topics
            .lock()
            .expect("client topics lock poisoned")
            .remove(&(route.to_string(), topic_key.to_string()));
    }

    /// 소유 중인 (라우트, 토픽 키) 쌍의 스냅샷을 반환합니다.
    pub fn owned_topics(&self) -> Vec<(String, String)> {
        self.topics
            .lock()
            .expect("client topics lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_receive() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ClientHandle::new(tx);

        client.send("hello").unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundMessage::Text("hello".to_string())
        );
    }

    #[test]
    fn test_send_fails_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = ClientHandle::new(tx);
        drop(rx);

        assert!(client.send("hello").is_err());
    }

    #[test]
    fn test_topic_tracking() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = ClientHandle::new(tx);

        client.track("orders", "orders:{}");
        client.track("bars", "bars:{}");
        assert_eq!(client.owned_topics().len(), 2);

        client.untrack("orders", "orders:{}");
        assert_eq!(client.owned_topics().len(), 1);
    }
}
