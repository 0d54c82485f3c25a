//! 구독 레지스트리.
//!
//! 라우트별로 `토픽 -> {참조 카운트, 구독자 집합}`을 유지하며
//! 구독/구독해제 참조 카운팅 프로토콜을 소유합니다. 첫 구독은
//! 프로듀서를 생성한 뒤에 승인되고, 마지막 구독 해제는 프로듀서를
//! 취소합니다.

use crate::client::{ClientHandle, ClientId};
use crate::service::DataService;
use crate::topic::{build_topic, Topic};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use terminal_core::{TerminalError, TerminalResult};
use tokio::sync::Mutex;
use tracing::{debug, info};
use validator::Validate;

/// 라우트별 구독 파라미터 검증기.
pub type ParamValidator = Arc<dyn Fn(&Value) -> TerminalResult<()> + Send + Sync>;

/// 파라미터 타입 `T`의 역직렬화 + `validator` 스키마 검증을 수행하는
/// 검증기를 생성합니다.
pub fn schema_validator<T>() -> ParamValidator
where
    T: serde::de::DeserializeOwned + Validate,
{
    Arc::new(|params: &Value| {
        let parsed: T = serde_json::from_value(params.clone())
            .map_err(|e| TerminalError::Validation(e.to_string()))?;
        parsed
            .validate()
            .map_err(|e| TerminalError::Validation(e.to_string()))
    })
}

/// 클라이언트 하나의 구독 엔트리.
#[derive(Debug)]
struct SubscriberEntry {
    handle: Arc<ClientHandle>,
    /// 이 클라이언트의 중복 구독 횟수
    count: usize,
}

/// 토픽 하나의 구독 상태.
///
/// 참조 카운트가 0인 Subscription은 존재하지 않습니다 - 0이 되는
/// 순간 제거되고 프로듀서가 취소됩니다.
struct Subscription {
    topic: Topic,
    ref_count: usize,
    subscribers: HashMap<ClientId, SubscriberEntry>,
}

/// 라우트 하나의 구독 레지스트리.
///
/// 토픽 맵 전체를 하나의 비동기 뮤텍스로 보호하므로 같은 토픽에
/// 대한 참조 카운트 변경은 엄격하게 직렬화됩니다. 라우트가 다르면
/// 레지스트리도 다르므로 서로 간섭하지 않습니다.
pub struct SubscriptionRegistry {
    route: String,
    service: Arc<dyn DataService>,
    validator: ParamValidator,
    topics: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    /// 새 레지스트리를 생성합니다. 서비스와 검증기는 구성 시점에
    /// 주입됩니다.
    pub fn new(
        route: impl Into<String>,
        service: Arc<dyn DataService>,
        validator: ParamValidator,
    ) -> Arc<Self> {
        Arc::new(Self {
            route: route.into(),
            service,
            validator,
            topics: Mutex::new(HashMap::new()),
        })
    }

    /// 라우트 이름을 반환합니다.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// 클라이언트를 토픽에 구독시킵니다.
    ///
    /// 토픽에 첫 구독자라면 `DataService::create_topic`이 승인 **전에**
    /// 호출되므로, 성공 반환 시 프로듀서가 반드시 동작 중입니다.
    /// 정준 토픽 키를 반환합니다.
    pub async fn subscribe(
        &self,
        client: &Arc<ClientHandle>,
        params: &Value,
    ) -> TerminalResult<String> {
        (self.validator)(params)?;
        let topic = build_topic(&self.route, params)?;

        let mut topics = self.topics.lock().await;
        match topics.get_mut(topic.key()) {
            Some(subscription) => {
                subscription.ref_count += 1;
                subscription
                    .subscribers
                    .entry(client.id())
                    .or_insert_with(|| SubscriberEntry {
                        handle: Arc::clone(client),
                        count: 0,
                    })
                    .count += 1;
                debug!(
                    route = %self.route,
                    topic = %topic,
                    ref_count = subscription.ref_count,
                    "Subscription reference added"
                );
            }
            None => {
                // 프로듀서 기동이 실패하면 구독 자체가 거부된다
                self.service.create_topic(&topic).await?;

                let mut subscribers = HashMap::new();
                subscribers.insert(
                    client.id(),
                    SubscriberEntry {
                        handle: Arc::clone(client),
                        count: 1,
                    },
                );
                topics.insert(
                    topic.key().to_string(),
                    Subscription {
                        topic: topic.clone(),
                        ref_count: 1,
                        subscribers,
                    },
                );
                info!(route = %self.route, topic = %topic, "Topic created, producer started");
            }
        }

        client.track(&self.route, topic.key());
        Ok(topic.key().to_string())
    }

    /// 클라이언트를 토픽에서 구독 해제합니다.
    ///
    /// 구독한 적 없는 토픽의 해제는 no-op이며 다른 클라이언트의
    /// 참조를 감소시키지 않습니다. 정준 토픽 키를 반환합니다.
    pub async fn unsubscribe(
        &self,
        client: &Arc<ClientHandle>,
        params: &Value,
    ) -> TerminalResult<String> {
        (self.validator)(params)?;
        let topic = build_topic(&self.route, params)?;
        self.release(client, topic.key(), false).await;
        Ok(topic.key().to_string())
    }

    /// 연결 종료 시 클라이언트의 모든 참조를 한 번에 해제합니다.
    pub async fn release_all(&self, client: &Arc<ClientHandle>, topic_key: &str) {
        self.release(client, topic_key, true).await;
    }

    /// 참조를 해제하고, 마지막 참조였다면 토픽을 삭제하고 프로듀서를
    /// 취소합니다.
    async fn release(&self, client: &Arc<ClientHandle>, topic_key: &str, all: bool) {
        let mut topics = self.topics.lock().await;

        let Some(subscription) = topics.get_mut(topic_key) else {
            return;
        };
        let Some(entry) = subscription.subscribers.get_mut(&client.id()) else {
            return;
        };

        let released = if all { entry.count } else { 1 };
        entry.count -= released;
        subscription.ref_count -= released;

        if entry.count == 0 {
            subscription.subscribers.remove(&client.id());
            client.untrack(&self.route, topic_key);
        }

        if subscription.ref_count == 0 {
            if let Some(subscription) = topics.remove(topic_key) {
                info!(route = %self.route, topic = %topic_key, "Last subscriber left, canceling producer");
                self.service.remove_topic(&subscription.topic).await;
            }
        } else {
            debug!(
                route = %self.route,
                topic = %topic_key,
                ref_count = subscription.ref_count,
                "Subscription reference released"
            );
        }
    }

    /// 토픽의 현재 구독자 핸들 스냅샷을 반환합니다.
    pub async fn subscribers_of(&self, topic_key: &str) -> Vec<Arc<ClientHandle>> {
        let topics = self.topics.lock().await;
        topics
            .get(topic_key)
            .map(|s| s.subscribers.values().map(|e| Arc::clone(&e.handle)).collect())
            .unwrap_or_default()
    }

    /// 토픽의 참조 카운트를 반환합니다.
    pub async fn ref_count(&self, topic_key: &str) -> Option<usize> {
        let topics = self.topics.lock().await;
        topics.get(topic_key).map(|s| s.ref_count)
    }

    /// 활성 토픽 수를 반환합니다.
    pub async fn topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }
}

/// 라우트 이름 -> 레지스트리 테이블.
///
/// 구성 루트에서 한 번 조립되며 전역 상태는 없습니다.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<SubscriptionRegistry>>,
}

impl RouteTable {
    /// 빈 테이블을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 라우트를 등록합니다.
    pub fn register(&mut self, registry: Arc<SubscriptionRegistry>) {
        self.routes.insert(registry.route().to_string(), registry);
    }

    /// 라우트의 레지스트리를 조회합니다.
    pub fn get(&self, route: &str) -> Option<&Arc<SubscriptionRegistry>> {
        self.routes.get(route)
    }
}
