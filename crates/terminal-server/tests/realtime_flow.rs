//! 실시간 엔진 통합 테스트.
//!
//! 구성 루트로 전체 애플리케이션을 조립하고, 소켓 없이 클라이언트
//! 핸들을 직접 등록해 구독 → 주문 → 체결 → 업데이트 흐름을
//! 검증합니다.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use terminal_core::config::AppConfig;
use terminal_core::domain::OrderRequest;
use terminal_pubsub::{ClientHandle, OutboundMessage};
use terminal_server::app::{build, App};
use tokio::sync::mpsc;

fn test_app() -> App {
    build(&AppConfig::default())
}

async fn connected_client(
    app: &App,
) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<OutboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = Arc::new(ClientHandle::new(tx));
    let connection = app.connections.register(Arc::clone(&client)).await;
    connection.activate().await;
    (client, rx)
}

/// 스폰된 태스크들이 돌 수 있게 가상 시간을 전진시킵니다.
async fn run_for(duration: Duration) {
    let steps = (duration.as_millis() / 50).max(1);
    for _ in 0..steps {
        tokio::time::advance(Duration::from_millis(50)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }
}

fn drain_envelopes(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<Value> {
    let mut envelopes = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let OutboundMessage::Text(text) = message {
            envelopes.push(serde_json::from_str(&text).unwrap());
        }
    }
    envelopes
}

fn of_type<'a>(envelopes: &'a [Value], kind: &str) -> Vec<&'a Value> {
    envelopes
        .iter()
        .filter(|e| e["type"] == kind)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_place_fill_update_flow() {
    let app = test_app();
    let (client, mut rx) = connected_client(&app).await;

    let params = json!({"accountId": "ACC-1"});
    for route in ["orders", "executions", "positions", "equity"] {
        app.routes
            .get(route)
            .unwrap()
            .subscribe(&client, &params)
            .await
            .unwrap();
    }

    app.prices.set("AAPL", dec!(190));
    let order = app
        .broker
        .place_order("ACC-1", OrderRequest::market_buy("AAPL", dec!(100)))
        .await
        .unwrap();

    run_for(Duration::from_secs(20)).await;
    let envelopes = drain_envelopes(&mut rx);

    // 주문 수명주기: Working으로 시작해 Filled로 끝난다
    let order_updates = of_type(&envelopes, "orders.update");
    assert!(!order_updates.is_empty());
    assert_eq!(order_updates[0]["payload"]["status"], "working");
    assert_eq!(order_updates[0]["payload"]["id"], order.id);
    assert_eq!(
        order_updates.last().unwrap()["payload"]["status"],
        "filled"
    );

    // 체결 수량의 합은 주문 수량과 같다
    let executed: Decimal = of_type(&envelopes, "executions.update")
        .iter()
        .map(|e| {
            e["payload"]["quantity"]
                .as_str()
                .unwrap()
                .parse::<Decimal>()
                .unwrap()
        })
        .sum();
    assert_eq!(executed, dec!(100));

    // 포지션과 자산 업데이트가 도착했다
    let position_updates = of_type(&envelopes, "positions.update");
    assert_eq!(
        position_updates.last().unwrap()["payload"]["quantity"],
        json!("100")
    );
    assert!(!of_type(&envelopes, "equity.update").is_empty());

    // 스냅샷도 일치한다
    let snapshot = app.broker.snapshot("ACC-1").await.unwrap();
    assert_eq!(snapshot.positions.len(), 1);
    assert_eq!(snapshot.positions[0].quantity, dec!(100));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_subscription_param_is_rejected_not_orphaned() {
    let app = test_app();
    let (client, mut rx) = connected_client(&app).await;

    // 초과 필드가 섞인 구독이 승인되면 엔진이 발행하는 정준 토픽과
    // 달라 영원히 업데이트를 받지 못한다 - 승인 대신 거부되어야 한다
    let registry = app.routes.get("orders").unwrap();
    let err = registry
        .subscribe(&client, &json!({"accountId": "ACC-1", "source": "web"}))
        .await
        .unwrap_err();
    assert!(matches!(err, terminal_core::TerminalError::Validation(_)));
    assert_eq!(registry.topic_count().await, 0);

    // 정준 파라미터로 구독하면 같은 주문 흐름이 정상 수신된다
    registry
        .subscribe(&client, &json!({"accountId": "ACC-1"}))
        .await
        .unwrap();
    app.broker
        .place_order("ACC-1", OrderRequest::market_buy("AAPL", dec!(10)))
        .await
        .unwrap();
    run_for(Duration::from_secs(20)).await;

    let envelopes = drain_envelopes(&mut rx);
    assert!(!of_type(&envelopes, "orders.update").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_two_clients_share_one_bars_producer() {
    let app = test_app();
    let (first, mut first_rx) = connected_client(&app).await;
    let (second, mut second_rx) = connected_client(&app).await;

    let registry = app.routes.get("bars").unwrap();
    let params = json!({"resolution": "1", "symbol": "AAPL"});
    let key = registry.subscribe(&first, &params).await.unwrap();
    registry.subscribe(&second, &params).await.unwrap();
    assert_eq!(registry.ref_count(&key).await, Some(2));
    assert_eq!(registry.topic_count().await, 1);

    run_for(Duration::from_secs(3)).await;

    // 두 구독자는 같은 업데이트를 같은 순서로 받는다
    let first_updates = drain_envelopes(&mut first_rx);
    let second_updates = drain_envelopes(&mut second_rx);
    assert!(!first_updates.is_empty());
    assert_eq!(first_updates, second_updates);

    // 한 명이 떠나도 프로듀서는 유지, 마지막이 떠나면 정리된다
    registry.unsubscribe(&first, &params).await.unwrap();
    assert_eq!(registry.ref_count(&key).await, Some(1));
    registry.unsubscribe(&second, &params).await.unwrap();
    assert_eq!(registry.topic_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_times_out_and_cleans_up() {
    let app = test_app();
    let (client, mut rx) = connected_client(&app).await;

    let registry = app.routes.get("quotes").unwrap();
    registry
        .subscribe(&client, &json!({"symbol": "AAPL"}))
        .await
        .unwrap();
    assert_eq!(registry.topic_count().await, 1);

    // 기본 하트비트는 30초 - 조용한 연결은 그 직후 닫힌다
    run_for(Duration::from_secs(31)).await;

    let close = loop {
        match rx.try_recv() {
            Ok(OutboundMessage::Close { code, reason }) => break (code, reason),
            Ok(_) => continue,
            Err(_) => panic!("expected close frame"),
        }
    };
    assert_eq!(close.0, 1000);
    assert_eq!(
        close.1,
        "Connection timed out. Heartbeat interval 30. Max connection lifespan 3600"
    );

    // 유일한 구독자였으므로 토픽과 프로듀서가 정리된다
    assert_eq!(registry.topic_count().await, 0);
    assert_eq!(app.connections.connection_count().await, 0);
}
