//! 토픽 업데이트 팬아웃.
//!
//! 프로듀서가 발행한 업데이트를 해당 토픽의 모든 구독자에게
//! 전달합니다. 느리거나 끊긴 구독자는 격리되며 다른 구독자의 전달을
//! 막지 않습니다.

use crate::registry::SubscriptionRegistry;
use crate::wire::Envelope;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 프로듀서가 발행하는 업데이트 하나.
#[derive(Debug, Clone)]
pub struct TopicUpdate {
    /// 정준 토픽 키
    pub topic: String,
    /// `{route}.update` envelope의 payload
    pub payload: Value,
}

/// 프로듀서가 업데이트를 밀어 넣는 싱크.
pub type UpdateSink = mpsc::UnboundedSender<TopicUpdate>;

/// 라우트 하나의 팬아웃 디스패처.
///
/// 업데이트 채널을 소비하며, 각 업데이트를 발행 시점의 구독자
/// 스냅샷에 전달합니다. 하나의 디스패처가 순서대로 전달하므로 같은
/// 토픽의 업데이트는 구독자에게 발행 순서대로 도착합니다.
pub struct BroadcastDispatcher {
    registry: Arc<SubscriptionRegistry>,
    updates: mpsc::UnboundedReceiver<TopicUpdate>,
}

impl BroadcastDispatcher {
    /// 디스패처와 프로듀서용 싱크를 생성합니다.
    pub fn new(registry: Arc<SubscriptionRegistry>) -> (Self, UpdateSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_receiver(registry, rx), tx)
    }

    /// 이미 만들어진 업데이트 채널로 디스패처를 생성합니다.
    ///
    /// 싱크가 레지스트리보다 먼저 필요한 구성 루트에서 사용합니다
    /// (프로듀서 → 싱크 → 레지스트리 → 디스패처 순서로 조립).
    pub fn with_receiver(
        registry: Arc<SubscriptionRegistry>,
        updates: mpsc::UnboundedReceiver<TopicUpdate>,
    ) -> Self {
        Self { registry, updates }
    }

    /// 업데이트 채널이 닫힐 때까지 팬아웃을 수행합니다.
    ///
    /// 구성 루트에서 `tokio::spawn`으로 실행합니다.
    pub async fn run(mut self) {
        let route = self.registry.route().to_string();
        while let Some(update) = self.updates.recv().await {
            self.dispatch(&route, update).await;
        }
        debug!(route = %route, "Update channel closed, dispatcher stopping");
    }

    async fn dispatch(&self, route: &str, update: TopicUpdate) {
        let subscribers = self.registry.subscribers_of(&update.topic).await;
        if subscribers.is_empty() {
            // 마지막 구독 해제와 경합한 잔여 업데이트는 버린다
            debug!(topic = %update.topic, "Dropping update with no subscribers");
            return;
        }

        let envelope = Envelope::update(route, update.payload);
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(topic = %update.topic, error = %e, "Failed to encode update");
                return;
            }
        };

        for subscriber in subscribers {
            // 전송 실패는 해당 구독자에게만 격리된다
            if let Err(e) = subscriber.send(text.clone()) {
                warn!(
                    client_id = %subscriber.id(),
                    topic = %update.topic,
                    error = %e,
                    "Failed to deliver update to subscriber"
                );
            }
        }
    }
}
