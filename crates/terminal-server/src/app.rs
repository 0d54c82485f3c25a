//! 구성 루트.
//!
//! 모든 라우트/서비스/디스패처/엔진을 명시적으로 조립합니다.
//! 전역 레지스트리는 없습니다 - 모든 의존성은 여기서 생성되어
//! 생성자 주입됩니다.
//!
//! 조립 순서: 업데이트 채널 → 프로듀서(엔진/시장 데이터) → 서비스 →
//! 레지스트리 → 디스패처 → 연결 관리자 → 라우터.

use crate::market::{BarsParams, MarketDataService, QuotesParams};
use crate::ws::{websocket_router, WsState};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use terminal_broker::{AccountParams, BrokerDataService, BrokerEngine, BrokerHandle, BrokerSinks};
use terminal_core::config::AppConfig;
use terminal_core::domain::{PriceBook, SharedPriceBook};
use terminal_pubsub::{
    schema_validator, BroadcastDispatcher, ConnectionManager, DataService, ParamValidator,
    RouteTable, SubscriptionRegistry, TopicUpdate,
};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// 조립된 애플리케이션.
pub struct App {
    /// HTTP/WebSocket 라우터
    pub router: Router,
    /// 라우트 테이블
    pub routes: Arc<RouteTable>,
    /// 연결 관리자
    pub connections: Arc<ConnectionManager>,
    /// 브로커 커맨드 핸들
    pub broker: BrokerHandle,
    /// 공유 마크 가격 장부
    pub prices: SharedPriceBook,
}

/// 설정으로 애플리케이션을 조립합니다.
///
/// 엔진/디스패처/프로듀서 태스크를 스폰하고 라우터를 반환합니다.
pub fn build(config: &AppConfig) -> App {
    let prices = PriceBook::seeded();
    let mut routes = RouteTable::new();
    let mut dispatchers = Vec::new();

    // 브로커 라우트: 엔진이 네 라우트의 싱크를 모두 쥔다
    let (orders_tx, orders_rx) = mpsc::unbounded_channel();
    let (executions_tx, executions_rx) = mpsc::unbounded_channel();
    let (positions_tx, positions_rx) = mpsc::unbounded_channel();
    let (equity_tx, equity_rx) = mpsc::unbounded_channel();

    let (engine, broker) = BrokerEngine::new(
        config.broker.clone(),
        prices.clone(),
        BrokerSinks {
            orders: orders_tx,
            executions: executions_tx,
            positions: positions_tx,
            equity: equity_tx,
        },
    );
    tokio::spawn(engine.run());

    let broker_service: Arc<dyn DataService> = Arc::new(BrokerDataService::new(broker.clone()));
    let account_validator = schema_validator::<AccountParams>();
    for (route, rx) in [
        ("orders", orders_rx),
        ("executions", executions_rx),
        ("positions", positions_rx),
        ("equity", equity_rx),
    ] {
        register_route(
            &mut routes,
            &mut dispatchers,
            route,
            Arc::clone(&broker_service),
            account_validator.clone(),
            rx,
        );
    }

    // 시장 데이터 라우트: 라우트마다 전용 서비스와 싱크
    let tick = Duration::from_millis(config.market.tick_interval_ms);
    let (bars_tx, bars_rx) = mpsc::unbounded_channel();
    register_route(
        &mut routes,
        &mut dispatchers,
        "bars",
        Arc::new(MarketDataService::bars(prices.clone(), bars_tx, tick)),
        schema_validator::<BarsParams>(),
        bars_rx,
    );
    let (quotes_tx, quotes_rx) = mpsc::unbounded_channel();
    register_route(
        &mut routes,
        &mut dispatchers,
        "quotes",
        Arc::new(MarketDataService::quotes(prices.clone(), quotes_tx, tick)),
        schema_validator::<QuotesParams>(),
        quotes_rx,
    );

    for dispatcher in dispatchers {
        tokio::spawn(dispatcher.run());
    }

    let routes = Arc::new(routes);
    let connections = ConnectionManager::new(Arc::clone(&routes), config.connection.clone());

    let router = websocket_router(WsState {
        routes: Arc::clone(&routes),
        connections: Arc::clone(&connections),
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    App {
        router,
        routes,
        connections,
        broker,
        prices,
    }
}

fn register_route(
    routes: &mut RouteTable,
    dispatchers: &mut Vec<BroadcastDispatcher>,
    route: &str,
    service: Arc<dyn DataService>,
    validator: ParamValidator,
    updates: mpsc::UnboundedReceiver<TopicUpdate>,
) {
    let registry = SubscriptionRegistry::new(route, service, validator);
    dispatchers.push(BroadcastDispatcher::with_receiver(
        Arc::clone(&registry),
        updates,
    ));
    routes.register(registry);
}
