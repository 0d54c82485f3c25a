//! 연결 수명주기 관리.
//!
//! 연결마다 하트비트(유휴 타임아웃)와 최대 수명을 감시하고, 어떤
//! 이유로든 연결이 끝나면 해당 클라이언트의 모든 구독을 해제합니다.

use crate::client::{ClientHandle, ClientId};
use crate::registry::RouteTable;
use std::collections::HashMap;
use std::sync::Arc;
use terminal_core::config::ConnectionConfig;
use terminal_core::TerminalError;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

/// WebSocket close code: 정상 종료.
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code: 프로토콜 위반.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// 연결 상태 머신.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 소켓은 열렸지만 환영 메시지 전이 전
    Connecting,
    /// 오퍼레이션 처리 중
    Active,
    /// 종료 절차 진행 중 (구독 해제)
    Closing,
    /// 종료 완료
    Closed,
}

/// 연결이 종료된 이유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 클라이언트가 소켓을 닫음
    ClientClosed,
    /// 하트비트 또는 최대 수명 초과
    Timeout,
    /// 파싱 불가능한 메시지 등 프로토콜 위반
    ProtocolViolation,
    /// 서버 종료
    ServerShutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::ClientClosed => "client closed",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::ServerShutdown => "server shutdown",
        };
        f.write_str(s)
    }
}

/// 활성 연결 하나.
pub struct Connection {
    client: Arc<ClientHandle>,
    state: Mutex<ConnectionState>,
    last_activity: Mutex<Instant>,
    opened_at: Instant,
}

impl Connection {
    fn new(client: Arc<ClientHandle>) -> Self {
        let now = Instant::now();
        Self {
            client,
            state: Mutex::new(ConnectionState::Connecting),
            last_activity: Mutex::new(now),
            opened_at: now,
        }
    }

    /// 클라이언트 핸들을 반환합니다.
    pub fn client(&self) -> &Arc<ClientHandle> {
        &self.client
    }

    /// 현재 상태를 반환합니다.
    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// 환영 메시지 전송 후 Active로 전이합니다.
    pub async fn activate(&self) {
        let mut state = self.state.lock().await;
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Active;
        }
    }

    /// 수신 활동을 기록해 하트비트 데드라인을 뒤로 미룹니다.
    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    async fn idle_deadline(&self, heartbeat: Duration) -> Instant {
        *self.last_activity.lock().await + heartbeat
    }
}

/// 모든 활성 연결의 소유자.
///
/// 연결 등록 시 감시 태스크를 띄우고, 연결 종료 시 라우트 테이블을
/// 통해 클라이언트의 모든 구독 참조를 해제합니다.
pub struct ConnectionManager {
    routes: Arc<RouteTable>,
    connections: Mutex<HashMap<ClientId, Arc<Connection>>>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    /// 새 연결 관리자를 생성합니다.
    pub fn new(routes: Arc<RouteTable>, config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            routes,
            connections: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// 새 연결을 등록하고 감시 태스크를 시작합니다.
    pub async fn register(self: &Arc<Self>, client: Arc<ClientHandle>) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(client));
        let client_id = connection.client.id();

        self.connections
            .lock()
            .await
            .insert(client_id, Arc::clone(&connection));
        info!(client_id = %client_id, "Connection registered");

        let manager = Arc::clone(self);
        let watched = Arc::clone(&connection);
        tokio::spawn(async move {
            manager.watch(watched).await;
        });

        connection
    }

    /// 연결 수를 반환합니다.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// 수신 활동을 기록합니다.
    pub async fn touch(&self, client_id: ClientId) {
        let connection = self.connections.lock().await.get(&client_id).cloned();
        if let Some(connection) = connection {
            connection.touch().await;
        }
    }

    /// 연결을 종료하고 클라이언트의 모든 구독을 해제합니다.
    ///
    /// 멱등합니다 - 이미 종료 중이거나 종료된 연결에는 아무 일도
    /// 일어나지 않습니다.
    pub async fn disconnect(&self, client_id: ClientId, reason: DisconnectReason) {
        let connection = self.connections.lock().await.remove(&client_id);
        let Some(connection) = connection else {
            return;
        };

        {
            let mut state = connection.state.lock().await;
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }

        let owned = connection.client.owned_topics();
        for (route, topic_key) in &owned {
            match self.routes.get(route) {
                Some(registry) => registry.release_all(&connection.client, topic_key).await,
                None => warn!(route = %route, "Unknown route while releasing subscriptions"),
            }
        }

        *connection.state.lock().await = ConnectionState::Closed;
        info!(
            client_id = %client_id,
            reason = %reason,
            released_topics = owned.len(),
            "Connection closed"
        );
    }

    /// 서버 종료 시 모든 연결을 닫습니다.
    ///
    /// 각 연결에 정상 종료 프레임을 보낸 뒤 구독을 해제합니다.
    pub async fn shutdown_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().await.values().cloned().collect();
        info!(connections = connections.len(), "Closing all connections for shutdown");
        for connection in connections {
            connection
                .client
                .close(CLOSE_NORMAL, "Server shutting down");
            self.disconnect(connection.client.id(), DisconnectReason::ServerShutdown)
                .await;
        }
    }

    /// 하트비트/최대 수명 감시 루프.
    ///
    /// 둘 중 먼저 도래하는 데드라인까지 잠들었다가 깨어나 재검사합니다.
    /// 수신 활동은 유휴 데드라인만 미루고 수명 데드라인은 고정입니다.
    async fn watch(&self, connection: Arc<Connection>) {
        let heartbeat = self.config.heartbeat();
        let life_deadline = connection.opened_at + self.config.max_lifespan();

        loop {
            let idle_deadline = connection.idle_deadline(heartbeat).await;
            let deadline = idle_deadline.min(life_deadline);
            sleep_until(deadline).await;

            if matches!(
                connection.state().await,
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                return;
            }

            let now = Instant::now();
            let idle_expired = now >= connection.idle_deadline(heartbeat).await;
            let life_expired = now >= life_deadline;
            if idle_expired || life_expired {
                let reason = TerminalError::Timeout {
                    heartbeat_secs: self.config.heartbeat_secs,
                    lifespan_secs: self.config.max_lifespan_secs,
                };
                debug!(
                    client_id = %connection.client.id(),
                    idle_expired,
                    life_expired,
                    "Connection deadline expired"
                );
                connection.client.close(CLOSE_NORMAL, reason.to_string());
                self.disconnect(connection.client.id(), DisconnectReason::Timeout)
                    .await;
                return;
            }
            // 활동으로 유휴 데드라인이 미뤄진 경우 - 다시 잠든다
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::OutboundMessage;
    use crate::registry::{schema_validator, SubscriptionRegistry};
    use crate::service::DataService;
    use crate::topic::Topic;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use terminal_core::TerminalResult;
    use tokio::sync::mpsc;
    use validator::Validate;

    #[derive(Default)]
    struct CountingService {
        removed: AtomicUsize,
    }

    #[async_trait]
    impl DataService for CountingService {
        async fn create_topic(&self, _topic: &Topic) -> TerminalResult<()> {
            Ok(())
        }
        async fn remove_topic(&self, _topic: &Topic) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Deserialize, Validate)]
    struct SymbolParams {
        #[validate(length(min = 1))]
        #[allow(dead_code)]
        symbol: String,
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_secs: 30.0,
            max_lifespan_secs: 3600.0,
        }
    }

    fn manager_with_route(
        service: Arc<CountingService>,
    ) -> (Arc<ConnectionManager>, Arc<SubscriptionRegistry>) {
        let registry =
            SubscriptionRegistry::new("quotes", service, schema_validator::<SymbolParams>());
        let mut routes = RouteTable::new();
        routes.register(Arc::clone(&registry));
        (
            ConnectionManager::new(Arc::new(routes), test_config()),
            registry,
        )
    }

    async fn drain_watchdog() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_connection() {
        let service = Arc::new(CountingService::default());
        let (manager, _registry) = manager_with_route(Arc::clone(&service));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = manager.register(Arc::new(ClientHandle::new(tx))).await;
        connection.activate().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        drain_watchdog().await;

        let OutboundMessage::Close { code, reason } = rx.recv().await.unwrap() else {
            panic!("expected close frame");
        };
        assert_eq!(code, CLOSE_NORMAL);
        assert_eq!(
            reason,
            "Connection timed out. Heartbeat interval 30. Max connection lifespan 3600"
        );
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_idle_timeout() {
        let service = Arc::new(CountingService::default());
        let (manager, _registry) = manager_with_route(Arc::clone(&service));

        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = manager.register(Arc::new(ClientHandle::new(tx))).await;
        connection.activate().await;
        let client_id = connection.client().id();

        // 데드라인 직전마다 활동을 기록하면 연결이 유지된다
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(20)).await;
            manager.touch(client_id).await;
            drain_watchdog().await;
        }
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_lifespan_ignores_activity() {
        let service = Arc::new(CountingService::default());
        let (manager, _registry) = manager_with_route(Arc::clone(&service));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = manager.register(Arc::new(ClientHandle::new(tx))).await;
        connection.activate().await;
        let client_id = connection.client().id();

        // 꾸준히 활동해도 최대 수명은 넘길 수 없다
        for _ in 0..200 {
            tokio::time::advance(Duration::from_secs(20)).await;
            manager.touch(client_id).await;
            drain_watchdog().await;
            if manager.connection_count().await == 0 {
                break;
            }
        }

        assert_eq!(manager.connection_count().await, 0);
        let OutboundMessage::Close { code, .. } = rx.recv().await.unwrap() else {
            panic!("expected close frame");
        };
        assert_eq!(code, CLOSE_NORMAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_releases_all_subscriptions() {
        let service = Arc::new(CountingService::default());
        let (manager, registry) = manager_with_route(Arc::clone(&service));

        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Arc::new(ClientHandle::new(tx));
        let connection = manager.register(Arc::clone(&client)).await;
        connection.activate().await;

        registry
            .subscribe(&client, &json!({"symbol": "AAPL"}))
            .await
            .unwrap();
        registry
            .subscribe(&client, &json!({"symbol": "MSFT"}))
            .await
            .unwrap();
        assert_eq!(registry.topic_count().await, 2);

        manager
            .disconnect(client.id(), DisconnectReason::ClientClosed)
            .await;

        assert_eq!(registry.topic_count().await, 0);
        assert_eq!(service.removed.load(Ordering::SeqCst), 2);
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let service = Arc::new(CountingService::default());
        let (manager, registry) = manager_with_route(Arc::clone(&service));

        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Arc::new(ClientHandle::new(tx));
        manager.register(Arc::clone(&client)).await;
        registry
            .subscribe(&client, &json!({"symbol": "AAPL"}))
            .await
            .unwrap();

        manager
            .disconnect(client.id(), DisconnectReason::ClientClosed)
            .await;
        manager
            .disconnect(client.id(), DisconnectReason::Timeout)
            .await;

        assert_eq!(service.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_every_connection() {
        let service = Arc::new(CountingService::default());
        let (manager, registry) = manager_with_route(Arc::clone(&service));
        let params = json!({"symbol": "AAPL"});

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let first = Arc::new(ClientHandle::new(tx1));
        manager.register(Arc::clone(&first)).await;
        registry.subscribe(&first, &params).await.unwrap();

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let second = Arc::new(ClientHandle::new(tx2));
        manager.register(Arc::clone(&second)).await;
        registry.subscribe(&second, &params).await.unwrap();

        manager.shutdown_all().await;

        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(registry.topic_count().await, 0);
        assert_eq!(service.removed.load(Ordering::SeqCst), 1);
        for rx in [&mut rx1, &mut rx2] {
            let OutboundMessage::Close { code, .. } = rx.recv().await.unwrap() else {
                panic!("expected close frame");
            };
            assert_eq!(code, CLOSE_NORMAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_topic_survives_one_disconnect() {
        let service = Arc::new(CountingService::default());
        let (manager, registry) = manager_with_route(Arc::clone(&service));
        let params = json!({"symbol": "AAPL"});

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let leaving = Arc::new(ClientHandle::new(tx1));
        manager.register(Arc::clone(&leaving)).await;
        let key = registry.subscribe(&leaving, &params).await.unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let staying = Arc::new(ClientHandle::new(tx2));
        manager.register(Arc::clone(&staying)).await;
        registry.subscribe(&staying, &params).await.unwrap();

        manager
            .disconnect(leaving.id(), DisconnectReason::ClientClosed)
            .await;

        assert_eq!(registry.ref_count(&key).await, Some(1));
        assert_eq!(service.removed.load(Ordering::SeqCst), 0);
    }
}
